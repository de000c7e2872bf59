//! Pluggable persistence for built disk images.
//!
//! One sink, three backends: a local directory, a shared mounted volume, and
//! an S3-compatible object store. The sink exposes streaming writes and
//! deletes only; callers never see backend-specific types. Disk-image
//! workloads hand their artifact to the sink through the engine's upload
//! endpoint, and the orchestrator later resolves the deterministic
//! `<base>/<name>/<format>.<ext>` location from the upload sentinel.

mod filesystem;
mod object_store;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tokio::io::AsyncRead;

pub use object_store::ObjectStoreConfig;

/// Default artifact root for the local backend.
pub const DEFAULT_LOCAL_BASE: &str = "/var/lib/flightctl/images";

/// Mount root under which shared volumes appear.
pub const SHARED_VOLUME_MOUNT_ROOT: &str = "/mnt/pvc";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid image name {0:?}")]
    InvalidName(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    ObjectStore(String),
    #[error("{0}")]
    Unsupported(String),
}

/// Which backend a stored artifact lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Local,
    SharedVolume,
    ObjectStore,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::SharedVolume => "shared-volume",
            StorageKind::ObjectStore => "object-store",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a stored artifact. `path` is a filesystem path for the
/// filesystem backends and an `s3://` URL for the object store; the metadata
/// map carries whatever the backend needs to delete the artifact again.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageRef {
    pub kind: StorageKind,
    pub path: String,
    pub size: u64,
    pub metadata: BTreeMap<String, String>,
}

/// Backend selection plus its settings.
#[derive(Clone, Debug)]
pub enum StorageBackend {
    Local { base_path: Option<PathBuf> },
    SharedVolume { volume_name: String },
    ObjectStore(ObjectStoreConfig),
}

/// File extension for an export format. AMI images are raw disk images under
/// a different name; unknown formats pass through unchanged.
pub fn extension_for(format: &str) -> &str {
    match format {
        "iso" => "iso",
        "qcow2" => "qcow2",
        "vmdk" => "vmdk",
        "raw" => "raw",
        "ami" => "raw",
        "tar" => "tar",
        other => other,
    }
}

/// Streaming artifact sink over the configured backend.
pub struct StorageSink {
    backend: StorageBackend,
}

impl StorageSink {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }

    pub fn kind(&self) -> StorageKind {
        match &self.backend {
            StorageBackend::Local { .. } => StorageKind::Local,
            StorageBackend::SharedVolume { .. } => StorageKind::SharedVolume,
            StorageBackend::ObjectStore(_) => StorageKind::ObjectStore,
        }
    }

    /// Root directory for the filesystem backends; `None` for the object
    /// store.
    pub fn base_path(&self) -> Option<PathBuf> {
        match &self.backend {
            StorageBackend::Local { base_path } => Some(
                base_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCAL_BASE)),
            ),
            StorageBackend::SharedVolume { volume_name } => {
                Some(PathBuf::from(SHARED_VOLUME_MOUNT_ROOT).join(volume_name))
            }
            StorageBackend::ObjectStore(_) => None,
        }
    }

    /// Deterministic artifact location for a build/format pair on the
    /// filesystem backends; `None` for the object store (downloads are not
    /// proxied from there).
    pub fn artifact_path(&self, name: &str, format: &str) -> Option<PathBuf> {
        let base = self.base_path()?;
        Some(
            base.join(name)
                .join(format!("{format}.{}", extension_for(format))),
        )
    }

    /// Stream an artifact into the backend without buffering it in full.
    /// On partial failure the destination is removed (filesystem) or the
    /// multipart upload aborted (object store).
    pub async fn stream_store<R>(
        &self,
        name: &str,
        format: &str,
        filename: &str,
        reader: R,
    ) -> Result<StorageRef, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_segment(name)?;
        validate_segment(format)?;

        match &self.backend {
            StorageBackend::Local { .. } | StorageBackend::SharedVolume { .. } => {
                let Some(target) = self.artifact_path(name, format) else {
                    return Err(StorageError::Unsupported(
                        "filesystem backend without a base path".to_string(),
                    ));
                };
                let (path, size) = filesystem::stream_to_file(&target, reader).await?;
                tracing::info!(%name, %format, path = %path.display(), size, "stored artifact");
                Ok(StorageRef {
                    kind: self.kind(),
                    path: path.display().to_string(),
                    size,
                    metadata: fs_metadata(name, format),
                })
            }
            StorageBackend::ObjectStore(config) => {
                let key = object_key(name, format);
                object_store::stream_put(config, &key, name, format, filename, reader).await?;
                tracing::info!(%name, %format, bucket = %config.bucket, %key, "stored artifact");
                let mut metadata = fs_metadata(name, format);
                metadata.insert("bucket".to_string(), config.bucket.clone());
                metadata.insert("key".to_string(), key.clone());
                Ok(StorageRef {
                    kind: StorageKind::ObjectStore,
                    path: format!("s3://{}/{}", config.bucket, key),
                    // Size is unknown after a streaming put.
                    size: 0,
                    metadata,
                })
            }
        }
    }

    /// Resolve the `uploaded:<name>/<format>` sentinel produced by a
    /// disk-image workload to the concrete artifact reference.
    pub async fn resolve_uploaded(
        &self,
        name: &str,
        format: &str,
    ) -> Result<StorageRef, StorageError> {
        validate_segment(name)?;
        validate_segment(format)?;

        match &self.backend {
            StorageBackend::Local { .. } | StorageBackend::SharedVolume { .. } => {
                let Some(path) = self.artifact_path(name, format) else {
                    return Err(StorageError::Unsupported(
                        "filesystem backend without a base path".to_string(),
                    ));
                };
                let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                Ok(StorageRef {
                    kind: self.kind(),
                    path: path.display().to_string(),
                    size,
                    metadata: fs_metadata(name, format),
                })
            }
            StorageBackend::ObjectStore(config) => {
                let key = object_key(name, format);
                let mut metadata = fs_metadata(name, format);
                metadata.insert("bucket".to_string(), config.bucket.clone());
                metadata.insert("key".to_string(), key.clone());
                Ok(StorageRef {
                    kind: StorageKind::ObjectStore,
                    path: format!("s3://{}/{}", config.bucket, key),
                    size: 0,
                    metadata,
                })
            }
        }
    }

    /// Remove a stored artifact.
    pub async fn delete(&self, reference: &StorageRef) -> Result<(), StorageError> {
        match reference.kind {
            StorageKind::Local | StorageKind::SharedVolume => {
                tokio::fs::remove_file(&reference.path).await?;
                Ok(())
            }
            StorageKind::ObjectStore => {
                let config = match &self.backend {
                    StorageBackend::ObjectStore(config) => config,
                    _ => {
                        return Err(StorageError::Unsupported(
                            "object-store reference on a filesystem sink".to_string(),
                        ))
                    }
                };
                let bucket = reference.metadata.get("bucket");
                let key = reference.metadata.get("key");
                match (bucket, key) {
                    (Some(bucket), Some(key)) => {
                        object_store::delete_object(config, bucket, key).await
                    }
                    _ => Err(StorageError::Unsupported(
                        "object-store reference is missing bucket or key".to_string(),
                    )),
                }
            }
        }
    }
}

fn object_key(name: &str, format: &str) -> String {
    format!("{name}/{format}.{}", extension_for(format))
}

fn fs_metadata(name: &str, format: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("image_name".to_string(), name.to_string()),
        ("image_type".to_string(), format.to_string()),
    ])
}

/// Names and formats become single path segments; reject anything that could
/// escape the artifact root.
fn validate_segment(segment: &str) -> Result<(), StorageError> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
    {
        return Err(StorageError::InvalidName(segment.to_string()));
    }
    Ok(())
}
