//! HTTP surface and wiring for the image-builder engine.

pub mod api_errors;
pub mod catalog_http;
pub mod config;
pub mod handlers;

pub use api_errors::ApiError;
pub use catalog_http::HttpCatalogClient;
pub use config::{ImageBuilderConfig, ServiceOptions};
pub use handlers::{router, AppState};
