//! Service configuration: command-line flags with environment fallbacks,
//! validated into a typed config.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use imagebuilder_engine::EnrollmentDefaults;
use imagebuilder_storage::{ObjectStoreConfig, StorageBackend};

/// Command-line surface of the service. Every flag can also come from the
/// environment.
#[derive(Clone, Debug, Parser)]
#[command(
    name = "flightctl-imagebuilder",
    version,
    about = "Build-orchestration service for bootable container images"
)]
pub struct ServiceOptions {
    /// Address the HTTP API listens on.
    #[arg(long, env = "IMAGEBUILDER_LISTEN_ADDR", default_value = "0.0.0.0:9090")]
    pub listen_addr: SocketAddr,

    /// Namespace build workloads run in.
    #[arg(long, env = "IMAGEBUILDER_NAMESPACE", default_value = "flightctl-builds")]
    pub build_namespace: String,

    /// Base URL of the resource catalog API.
    #[arg(long, env = "IMAGEBUILDER_CATALOG_URL")]
    pub catalog_url: String,

    /// URL disk-image workloads use to reach this service's upload endpoint.
    #[arg(
        long,
        env = "IMAGEBUILDER_SERVICE_URL",
        default_value = "http://flightctl-imagebuilder.flightctl-internal.svc.cluster.local:9090"
    )]
    pub service_url: String,

    /// Bearer token required on artifact uploads. Uploads are rejected with
    /// 503 when unset.
    #[arg(long, env = "UPLOAD_TOKEN", hide_env_values = true)]
    pub upload_token: Option<String>,

    /// Reconcile tick interval.
    #[arg(long, env = "IMAGEBUILDER_POLL_INTERVAL", default_value = "10s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Artifact storage backend.
    #[arg(long, env = "IMAGEBUILDER_STORAGE_TYPE", default_value = "local")]
    pub storage_type: String,

    /// Artifact root for the local backend.
    #[arg(long, env = "IMAGEBUILDER_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// Volume name for the shared-volume backend.
    #[arg(long, env = "IMAGEBUILDER_STORAGE_VOLUME")]
    pub storage_volume: Option<String>,

    #[arg(long, env = "IMAGEBUILDER_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,
    #[arg(long, env = "IMAGEBUILDER_S3_BUCKET")]
    pub s3_bucket: Option<String>,
    #[arg(long, env = "IMAGEBUILDER_S3_REGION")]
    pub s3_region: Option<String>,
    #[arg(long, env = "IMAGEBUILDER_S3_ACCESS_KEY", hide_env_values = true)]
    pub s3_access_key: Option<String>,
    #[arg(long, env = "IMAGEBUILDER_S3_SECRET_KEY", hide_env_values = true)]
    pub s3_secret_key: Option<String>,

    /// Base64-encoded CA bundle for the default enrollment endpoint.
    #[arg(long, env = "IMAGEBUILDER_ENROLLMENT_CA")]
    pub enrollment_ca: Option<String>,
    /// Default enrollment service URL baked into agent configs.
    #[arg(long, env = "IMAGEBUILDER_ENROLLMENT_ENDPOINT")]
    pub enrollment_endpoint: Option<String>,
    /// Default enrollment UI URL baked into agent configs.
    #[arg(long, env = "IMAGEBUILDER_ENROLLMENT_UI_URL")]
    pub enrollment_ui_url: Option<String>,

    /// Identity used as the cleanup lease holder. Defaults to the pod name.
    #[arg(long, env = "HOSTNAME", default_value = "flightctl-imagebuilder")]
    pub holder: String,
}

/// Validated service configuration.
#[derive(Clone, Debug)]
pub struct ImageBuilderConfig {
    pub listen_addr: SocketAddr,
    pub build_namespace: String,
    pub catalog_url: String,
    pub service_url: String,
    pub upload_token: Option<String>,
    pub poll_interval: Duration,
    pub storage: StorageBackend,
    pub enrollment: EnrollmentDefaults,
    pub holder: String,
}

impl TryFrom<ServiceOptions> for ImageBuilderConfig {
    type Error = String;

    fn try_from(options: ServiceOptions) -> Result<Self, Self::Error> {
        let storage = match options.storage_type.trim().to_ascii_lowercase().as_str() {
            "local" => StorageBackend::Local {
                base_path: options.storage_path,
            },
            "shared-volume" => {
                let volume_name = options
                    .storage_volume
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| {
                        "storage type 'shared-volume' requires IMAGEBUILDER_STORAGE_VOLUME"
                            .to_string()
                    })?;
                StorageBackend::SharedVolume { volume_name }
            }
            "object-store" => {
                let endpoint = required(options.s3_endpoint, "IMAGEBUILDER_S3_ENDPOINT")?;
                let bucket = required(options.s3_bucket, "IMAGEBUILDER_S3_BUCKET")?;
                let access_key = required(options.s3_access_key, "IMAGEBUILDER_S3_ACCESS_KEY")?;
                let secret_key = required(options.s3_secret_key, "IMAGEBUILDER_S3_SECRET_KEY")?;
                StorageBackend::ObjectStore(ObjectStoreConfig {
                    endpoint,
                    bucket,
                    region: options.s3_region,
                    access_key,
                    secret_key,
                })
            }
            other => {
                return Err(format!(
                    "invalid storage type {other:?}; expected one of: local, shared-volume, object-store"
                ))
            }
        };

        if options.catalog_url.is_empty() {
            return Err("IMAGEBUILDER_CATALOG_URL must not be empty".to_string());
        }

        Ok(ImageBuilderConfig {
            listen_addr: options.listen_addr,
            build_namespace: options.build_namespace,
            catalog_url: options.catalog_url.trim_end_matches('/').to_string(),
            service_url: options.service_url.trim_end_matches('/').to_string(),
            upload_token: options.upload_token.filter(|t| !t.is_empty()),
            poll_interval: options.poll_interval,
            storage,
            enrollment: EnrollmentDefaults {
                ca_data: options.enrollment_ca,
                service_url: options.enrollment_endpoint,
                ui_url: options.enrollment_ui_url,
            },
            holder: options.holder,
        })
    }
}

fn required(value: Option<String>, variable: &str) -> Result<String, String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("storage type 'object-store' requires {variable}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(extra: &[&str]) -> ServiceOptions {
        let mut argv = vec![
            "flightctl-imagebuilder",
            "--catalog-url",
            "http://catalog.internal:3443/",
        ];
        argv.extend_from_slice(extra);
        ServiceOptions::try_parse_from(argv).expect("options parse")
    }

    #[test]
    fn defaults_produce_local_storage_on_port_9090() {
        let config = ImageBuilderConfig::try_from(options(&[])).unwrap();
        assert_eq!(config.listen_addr.port(), 9090);
        assert_eq!(config.build_namespace, "flightctl-builds");
        assert_eq!(config.catalog_url, "http://catalog.internal:3443");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert!(matches!(
            config.storage,
            StorageBackend::Local { base_path: None }
        ));
        assert!(config.upload_token.is_none());
    }

    #[test]
    fn shared_volume_requires_a_volume_name() {
        let err = ImageBuilderConfig::try_from(options(&["--storage-type", "shared-volume"]))
            .unwrap_err();
        assert!(err.contains("IMAGEBUILDER_STORAGE_VOLUME"));

        let config = ImageBuilderConfig::try_from(options(&[
            "--storage-type",
            "shared-volume",
            "--storage-volume",
            "imagebuilder-storage",
        ]))
        .unwrap();
        assert!(matches!(
            config.storage,
            StorageBackend::SharedVolume { ref volume_name } if volume_name == "imagebuilder-storage"
        ));
    }

    #[test]
    fn object_store_requires_endpoint_bucket_and_keys() {
        let err = ImageBuilderConfig::try_from(options(&["--storage-type", "object-store"]))
            .unwrap_err();
        assert!(err.contains("IMAGEBUILDER_S3_ENDPOINT"));

        let config = ImageBuilderConfig::try_from(options(&[
            "--storage-type",
            "object-store",
            "--s3-endpoint",
            "http://minio:9000",
            "--s3-bucket",
            "artifacts",
            "--s3-access-key",
            "ak",
            "--s3-secret-key",
            "sk",
        ]))
        .unwrap();
        match config.storage {
            StorageBackend::ObjectStore(ref s3) => {
                assert_eq!(s3.bucket, "artifacts");
                assert!(s3.region.is_none());
            }
            ref other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn unknown_storage_type_is_rejected() {
        let err = ImageBuilderConfig::try_from(options(&["--storage-type", "tape"])).unwrap_err();
        assert!(err.contains("invalid storage type"));
    }

    #[test]
    fn empty_upload_token_counts_as_unset() {
        let config =
            ImageBuilderConfig::try_from(options(&["--upload-token", ""])).unwrap();
        assert!(config.upload_token.is_none());
    }

    #[test]
    fn poll_interval_parses_human_durations() {
        let config =
            ImageBuilderConfig::try_from(options(&["--poll-interval", "30s"])).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
    }
}
