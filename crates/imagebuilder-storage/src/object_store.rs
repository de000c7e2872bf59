//! S3-compatible object-store backend.
//!
//! Uploads stream through a bounded multipart upload (8 MiB parts) so peak
//! memory stays at one part regardless of artifact size. Path-style
//! addressing keeps MinIO and other S3-compatible services working.

use std::collections::HashMap;

use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::StorageError;

const PART_SIZE: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;
const DEFAULT_REGION: &str = "us-east-1";

/// Connection settings for an S3-compatible endpoint.
#[derive(Clone, Debug)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub region: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

impl ObjectStoreConfig {
    fn region(&self) -> String {
        self.region
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }
}

fn client(config: &ObjectStoreConfig) -> Client {
    let credentials = Credentials::new(
        config.access_key.clone(),
        config.secret_key.clone(),
        None,
        None,
        "imagebuilder",
    );
    let conf = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .endpoint_url(&config.endpoint)
        .region(Region::new(config.region()))
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    Client::from_conf(conf)
}

/// Stream `reader` to `<bucket>/<key>` as a multipart upload, aborting the
/// upload on any failure so no orphaned parts accumulate.
pub(crate) async fn stream_put<R>(
    config: &ObjectStoreConfig,
    key: &str,
    image_name: &str,
    image_type: &str,
    filename: &str,
    mut reader: R,
) -> Result<(), StorageError>
where
    R: AsyncRead + Unpin + Send,
{
    let client = client(config);
    let metadata = HashMap::from([
        ("image-name".to_string(), image_name.to_string()),
        ("image-type".to_string(), image_type.to_string()),
        ("filename".to_string(), filename.to_string()),
    ]);

    let created = client
        .create_multipart_upload()
        .bucket(&config.bucket)
        .key(key)
        .set_metadata(Some(metadata))
        .send()
        .await
        .map_err(|e| StorageError::ObjectStore(format!("create multipart upload: {e}")))?;
    let upload_id = created
        .upload_id()
        .ok_or_else(|| StorageError::ObjectStore("upload id missing from response".to_string()))?
        .to_string();

    match upload_parts(&client, config, key, &upload_id, &mut reader).await {
        Ok(parts) => {
            client
                .complete_multipart_upload()
                .bucket(&config.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| StorageError::ObjectStore(format!("complete multipart upload: {e}")))?;
            Ok(())
        }
        Err(err) => {
            if let Err(abort_err) = client
                .abort_multipart_upload()
                .bucket(&config.bucket)
                .key(key)
                .upload_id(&upload_id)
                .send()
                .await
            {
                tracing::warn!(%key, error = %abort_err, "failed to abort multipart upload");
            }
            Err(err)
        }
    }
}

async fn upload_parts<R>(
    client: &Client,
    config: &ObjectStoreConfig,
    key: &str,
    upload_id: &str,
    reader: &mut R,
) -> Result<Vec<CompletedPart>, StorageError>
where
    R: AsyncRead + Unpin + Send,
{
    let mut parts = Vec::new();
    let mut part_number: i32 = 1;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let mut part = Vec::with_capacity(PART_SIZE);
        while part.len() < PART_SIZE {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            part.extend_from_slice(&chunk[..n]);
        }
        let last = part.len() < PART_SIZE;

        // An empty artifact still needs one (empty) part to complete.
        if part.is_empty() && part_number > 1 {
            break;
        }

        let uploaded = client
            .upload_part()
            .bucket(&config.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(part))
            .send()
            .await
            .map_err(|e| StorageError::ObjectStore(format!("upload part {part_number}: {e}")))?;

        parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .set_e_tag(uploaded.e_tag().map(str::to_string))
                .build(),
        );
        part_number += 1;

        if last {
            break;
        }
    }

    Ok(parts)
}

pub(crate) async fn delete_object(
    config: &ObjectStoreConfig,
    bucket: &str,
    key: &str,
) -> Result<(), StorageError> {
    client(config)
        .delete_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| StorageError::ObjectStore(format!("delete object: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_defaults_when_unset_or_empty() {
        let mut config = ObjectStoreConfig {
            endpoint: "http://minio:9000".to_string(),
            bucket: "artifacts".to_string(),
            region: None,
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
        };
        assert_eq!(config.region(), "us-east-1");
        config.region = Some(String::new());
        assert_eq!(config.region(), "us-east-1");
        config.region = Some("eu-west-1".to_string());
        assert_eq!(config.region(), "eu-west-1");
    }
}
