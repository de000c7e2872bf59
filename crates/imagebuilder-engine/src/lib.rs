//! Build-orchestration engine: the reconcile loop, the per-build state
//! machine, the pipeline stages, and the startup cleanup reconciler.

pub mod certificates;
pub mod cleanup;
pub mod container_build;
pub mod containerfile;
pub mod disk_image;
pub mod error;
pub mod names;
pub mod orchestrator;
pub mod pod_logs;
pub mod reconciler;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use certificates::CertificateBroker;
pub use cleanup::{CleanupReconciler, CLEANUP_LOCK_NAME};
pub use container_build::ContainerBuildStage;
pub use containerfile::{ContainerfileGenerator, EnrollmentDefaults};
pub use disk_image::DiskImageBuildStage;
pub use error::{EngineError, StageError};
pub use orchestrator::Orchestrator;
pub use reconciler::ReconcileLoop;
