//! Gateway contracts over the cluster workload primitive and the resource
//! catalog. The engine only ever talks to these traits; production wires a
//! real cluster client and an HTTP catalog client, tests wire recording fakes.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use thiserror::Error;
use uuid::Uuid;

use crate::csr::CertificateSigningRequest;
use crate::resource::{ImageBuild, PatchOp};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("job {0} failed")]
    JobFailed(String),
    #[error("cluster api error: {0}")]
    Api(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflicting update for {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("catalog api error: {0}")]
    Api(String),
}

/// Thin interface over the cluster's job/secret/configmap/pod primitives.
/// Every job creation, deletion, log retrieval, and completion watch the
/// engine performs goes through this trait.
#[async_trait]
pub trait WorkloadGateway: Send + Sync {
    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job, GatewayError>;
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, GatewayError>;
    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Job>, GatewayError>;
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    /// Block until the named job reaches a terminal state, bounded by a
    /// 30-minute ceiling. `Ok(())` on success; `JobFailed` when the job
    /// reports a failed pod; `Timeout` at the ceiling. Deleting the job from
    /// another task surfaces here as an error.
    async fn await_job(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: ConfigMap,
    ) -> Result<ConfigMap, GatewayError>;
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, GatewayError>;
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret, GatewayError>;
    async fn get_secret(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>, GatewayError>;
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, GatewayError>;
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), GatewayError>;

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, GatewayError>;

    /// Tail of a pod's logs, capped at `tail_lines`.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        tail_lines: i64,
    ) -> Result<String, GatewayError>;
}

/// Interface over the versioned resource catalog: tenants, `ImageBuild`
/// resources and their status subresource, and the CSR API used for
/// enrollment certificates.
#[async_trait]
pub trait CatalogGateway: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<Uuid>, CatalogError>;

    async fn list_image_builds(&self, tenant: Uuid) -> Result<Vec<ImageBuild>, CatalogError>;
    async fn get_image_build(
        &self,
        tenant: Uuid,
        name: &str,
    ) -> Result<Option<ImageBuild>, CatalogError>;
    async fn delete_image_build(&self, tenant: Uuid, name: &str) -> Result<(), CatalogError>;

    /// Replace the whole status subresource so phase, message, and timestamps
    /// move atomically.
    async fn replace_status(&self, tenant: Uuid, build: &ImageBuild) -> Result<(), CatalogError>;

    /// JSON-patch against the resource; used exclusively for annotation
    /// changes to avoid lost updates against concurrent user edits.
    async fn patch_image_build(
        &self,
        tenant: Uuid,
        name: &str,
        patch: &[PatchOp],
    ) -> Result<(), CatalogError>;

    async fn create_csr(
        &self,
        tenant: Uuid,
        csr: CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, CatalogError>;
    async fn list_csrs(&self, tenant: Uuid)
        -> Result<Vec<CertificateSigningRequest>, CatalogError>;
}
