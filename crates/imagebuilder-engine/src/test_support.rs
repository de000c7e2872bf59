//! Recording fakes for the gateway traits, shared by the engine's test
//! modules.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use uuid::Uuid;

use imagebuilder_core::{
    CatalogError, CatalogGateway, CertificateSigningRequest, CsrStatus, GatewayError, ImageBuild,
    PatchOp, Phase, WorkloadGateway,
};

/// In-memory workload gateway that records every mutation.
#[derive(Default)]
pub struct FakeWorkloads {
    jobs: Mutex<HashMap<String, Job>>,
    config_maps: Mutex<HashMap<String, ConfigMap>>,
    secrets: Mutex<HashMap<String, Secret>>,
    pvcs: Mutex<HashMap<String, PersistentVolumeClaim>>,
    pods: Mutex<Vec<Pod>>,
    pod_logs: Mutex<HashMap<String, String>>,

    created_jobs: Mutex<Vec<String>>,
    deleted_jobs: Mutex<Vec<String>>,
    created_config_maps: Mutex<Vec<String>>,
    deleted_config_maps: Mutex<Vec<String>>,
    created_secrets: Mutex<Vec<String>>,
    deleted_secrets: Mutex<Vec<String>>,

    failing_jobs: Mutex<HashSet<String>>,
    await_delay: Mutex<Duration>,
}

impl FakeWorkloads {
    /// Make `await_job` report failure for the named job.
    pub fn fail_job(&self, name: &str) {
        self.failing_jobs.lock().unwrap().insert(name.to_string());
    }

    /// Delay completion of every `await_job` call, for in-flight tests.
    pub fn set_await_delay(&self, delay: Duration) {
        *self.await_delay.lock().unwrap() = delay;
    }

    /// Register a pod for a job with the given log content.
    pub fn add_pod(&self, job_name: &str, pod_name: &str, log: &str) {
        let labels = BTreeMap::from([("job-name".to_string(), job_name.to_string())]);
        self.add_pod_with(labels, pod_name, Utc::now(), log);
    }

    /// Register a pod carrying both the job and build ownership labels.
    pub fn add_build_pod(&self, build: &str, job_name: &str, pod_name: &str, log: &str) {
        let labels = BTreeMap::from([
            ("job-name".to_string(), job_name.to_string()),
            ("imagebuild".to_string(), build.to_string()),
        ]);
        self.add_pod_with(labels, pod_name, Utc::now(), log);
    }

    pub fn add_pod_with(
        &self,
        labels: BTreeMap<String, String>,
        pod_name: &str,
        created_at: DateTime<Utc>,
        log: &str,
    ) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                labels: Some(labels),
                creation_timestamp: Some(Time(created_at)),
                ..Default::default()
            },
            ..Default::default()
        };
        self.pods.lock().unwrap().push(pod);
        self.pod_logs
            .lock()
            .unwrap()
            .insert(pod_name.to_string(), log.to_string());
    }

    pub fn created_job_names(&self) -> Vec<String> {
        self.created_jobs.lock().unwrap().clone()
    }

    pub fn deleted_job_names(&self) -> Vec<String> {
        self.deleted_jobs.lock().unwrap().clone()
    }

    pub fn created_config_map_names(&self) -> Vec<String> {
        self.created_config_maps.lock().unwrap().clone()
    }

    pub fn deleted_config_map_names(&self) -> Vec<String> {
        self.deleted_config_maps.lock().unwrap().clone()
    }

    pub fn created_secret_names(&self) -> Vec<String> {
        self.created_secrets.lock().unwrap().clone()
    }

    pub fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.config_maps.lock().unwrap().get(name).cloned()
    }

    pub fn put_config_map(&self, name: &str, data: BTreeMap<String, String>) {
        self.config_maps.lock().unwrap().insert(
            name.to_string(),
            ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            },
        );
    }

    fn selector_matches(selector: &str, pod: &Pod) -> bool {
        if selector.is_empty() {
            return true;
        }
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        selector.split(',').all(|pair| match pair.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => false,
        })
    }
}

#[async_trait]
impl WorkloadGateway for FakeWorkloads {
    async fn create_job(&self, _namespace: &str, job: Job) -> Result<Job, GatewayError> {
        let name = job.metadata.name.clone().unwrap_or_default();
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&name) {
            return Err(GatewayError::AlreadyExists(format!("job {name}")));
        }
        jobs.insert(name.clone(), job.clone());
        self.created_jobs.lock().unwrap().push(name);
        Ok(job)
    }

    async fn get_job(&self, _namespace: &str, name: &str) -> Result<Option<Job>, GatewayError> {
        Ok(self.jobs.lock().unwrap().get(name).cloned())
    }

    async fn list_jobs(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Job>, GatewayError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .values()
            .filter(|job| {
                if label_selector.is_empty() {
                    return true;
                }
                let labels = job.metadata.labels.clone().unwrap_or_default();
                label_selector.split(',').all(|pair| match pair.split_once('=') {
                    Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
                    None => false,
                })
            })
            .cloned()
            .collect())
    }

    async fn delete_job(&self, _namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.deleted_jobs.lock().unwrap().push(name.to_string());
        match self.jobs.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound(format!("job {name}"))),
        }
    }

    async fn await_job(&self, _namespace: &str, name: &str) -> Result<(), GatewayError> {
        let delay = *self.await_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing_jobs.lock().unwrap().contains(name) {
            return Err(GatewayError::JobFailed(name.to_string()));
        }
        if !self.jobs.lock().unwrap().contains_key(name) {
            return Err(GatewayError::NotFound(format!("job {name}")));
        }
        Ok(())
    }

    async fn create_config_map(
        &self,
        _namespace: &str,
        config_map: ConfigMap,
    ) -> Result<ConfigMap, GatewayError> {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        let mut config_maps = self.config_maps.lock().unwrap();
        if config_maps.contains_key(&name) {
            return Err(GatewayError::AlreadyExists(format!("configmap {name}")));
        }
        config_maps.insert(name.clone(), config_map.clone());
        self.created_config_maps.lock().unwrap().push(name);
        Ok(config_map)
    }

    async fn get_config_map(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, GatewayError> {
        Ok(self.config_maps.lock().unwrap().get(name).cloned())
    }

    async fn delete_config_map(&self, _namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.deleted_config_maps.lock().unwrap().push(name.to_string());
        match self.config_maps.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound(format!("configmap {name}"))),
        }
    }

    async fn create_secret(&self, _namespace: &str, secret: Secret) -> Result<Secret, GatewayError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let mut secrets = self.secrets.lock().unwrap();
        if secrets.contains_key(&name) {
            return Err(GatewayError::AlreadyExists(format!("secret {name}")));
        }
        secrets.insert(name.clone(), secret.clone());
        self.created_secrets.lock().unwrap().push(name);
        Ok(secret)
    }

    async fn get_secret(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, GatewayError> {
        Ok(self.secrets.lock().unwrap().get(name).cloned())
    }

    async fn delete_secret(&self, _namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.deleted_secrets.lock().unwrap().push(name.to_string());
        match self.secrets.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound(format!("secret {name}"))),
        }
    }

    async fn create_pvc(
        &self,
        _namespace: &str,
        pvc: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, GatewayError> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.pvcs.lock().unwrap().insert(name, pvc.clone());
        Ok(pvc)
    }

    async fn delete_pvc(&self, _namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.pvcs.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_pods(
        &self,
        _namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, GatewayError> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| Self::selector_matches(label_selector, pod))
            .cloned()
            .collect())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod_name: &str,
        _tail_lines: i64,
    ) -> Result<String, GatewayError> {
        self.pod_logs
            .lock()
            .unwrap()
            .get(pod_name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("pod {pod_name}")))
    }
}

/// In-memory catalog that applies status replaces and annotation patches to
/// its stored builds, recording everything.
#[derive(Default)]
pub struct FakeCatalog {
    tenants: Mutex<Vec<Uuid>>,
    builds: Mutex<HashMap<(Uuid, String), ImageBuild>>,
    status_writes: Mutex<Vec<ImageBuild>>,
    patches: Mutex<Vec<(String, Vec<PatchOp>)>>,
    csrs: Mutex<Vec<CertificateSigningRequest>>,
    csr_status: Mutex<Option<CsrStatus>>,
    tenant_list_error: Mutex<bool>,
    freeze_stored_status: Mutex<bool>,
}

impl FakeCatalog {
    pub fn add_tenant(&self, tenant: Uuid) {
        self.tenants.lock().unwrap().push(tenant);
    }

    pub fn insert_build(&self, tenant: Uuid, build: ImageBuild) {
        let name = build.name().to_string();
        self.builds.lock().unwrap().insert((tenant, name), build);
    }

    pub fn build(&self, tenant: Uuid, name: &str) -> Option<ImageBuild> {
        self.builds
            .lock()
            .unwrap()
            .get(&(tenant, name.to_string()))
            .cloned()
    }

    /// Every status write recorded in order, filtered by build name.
    pub fn status_writes_for(&self, name: &str) -> Vec<ImageBuild> {
        self.status_writes
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.name() == name)
            .cloned()
            .collect()
    }

    /// Phase progression recorded by status writes for one build.
    pub fn phases_for(&self, name: &str) -> Vec<Phase> {
        self.status_writes_for(name)
            .iter()
            .filter_map(|b| b.phase())
            .collect()
    }

    pub fn patches_for(&self, name: &str) -> Vec<Vec<PatchOp>> {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, ops)| ops.clone())
            .collect()
    }

    pub fn submitted_csrs(&self) -> Vec<CertificateSigningRequest> {
        self.csrs.lock().unwrap().clone()
    }

    /// Every listed CSR reports this certificate as issued.
    pub fn sign_csrs_with(&self, certificate: &str) {
        *self.csr_status.lock().unwrap() = Some(CsrStatus {
            certificate: Some(certificate.to_string()),
            conditions: Vec::new(),
        });
    }

    pub fn set_csr_status(&self, status: CsrStatus) {
        *self.csr_status.lock().unwrap() = Some(status);
    }

    pub fn fail_tenant_listing(&self, fail: bool) {
        *self.tenant_list_error.lock().unwrap() = fail;
    }

    /// Record status writes without applying them to the stored build, so a
    /// build keeps its listed phase across reconcile ticks.
    pub fn freeze_stored_status(&self, freeze: bool) {
        *self.freeze_stored_status.lock().unwrap() = freeze;
    }
}

#[async_trait]
impl CatalogGateway for FakeCatalog {
    async fn list_tenants(&self) -> Result<Vec<Uuid>, CatalogError> {
        if *self.tenant_list_error.lock().unwrap() {
            return Err(CatalogError::Api("tenant listing unavailable".to_string()));
        }
        Ok(self.tenants.lock().unwrap().clone())
    }

    async fn list_image_builds(&self, tenant: Uuid) -> Result<Vec<ImageBuild>, CatalogError> {
        Ok(self
            .builds
            .lock()
            .unwrap()
            .iter()
            .filter(|((t, _), _)| *t == tenant)
            .map(|(_, build)| build.clone())
            .collect())
    }

    async fn get_image_build(
        &self,
        tenant: Uuid,
        name: &str,
    ) -> Result<Option<ImageBuild>, CatalogError> {
        Ok(self.build(tenant, name))
    }

    async fn delete_image_build(&self, tenant: Uuid, name: &str) -> Result<(), CatalogError> {
        self.builds
            .lock()
            .unwrap()
            .remove(&(tenant, name.to_string()));
        Ok(())
    }

    async fn replace_status(&self, tenant: Uuid, build: &ImageBuild) -> Result<(), CatalogError> {
        self.status_writes.lock().unwrap().push(build.clone());
        if *self.freeze_stored_status.lock().unwrap() {
            return Ok(());
        }
        let mut builds = self.builds.lock().unwrap();
        if let Some(stored) = builds.get_mut(&(tenant, build.name().to_string())) {
            stored.status = build.status.clone();
        }
        Ok(())
    }

    async fn patch_image_build(
        &self,
        tenant: Uuid,
        name: &str,
        patch: &[PatchOp],
    ) -> Result<(), CatalogError> {
        self.patches
            .lock()
            .unwrap()
            .push((name.to_string(), patch.to_vec()));

        let mut builds = self.builds.lock().unwrap();
        let Some(stored) = builds.get_mut(&(tenant, name.to_string())) else {
            return Err(CatalogError::NotFound(format!("imagebuild {name}")));
        };
        for op in patch {
            if op.op == "remove" {
                if let Some(key) = op.path.strip_prefix("/metadata/annotations/") {
                    let key = key.replace("~1", "/").replace("~0", "~");
                    stored.metadata.annotations.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn create_csr(
        &self,
        _tenant: Uuid,
        csr: CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, CatalogError> {
        self.csrs.lock().unwrap().push(csr.clone());
        Ok(csr)
    }

    async fn list_csrs(
        &self,
        _tenant: Uuid,
    ) -> Result<Vec<CertificateSigningRequest>, CatalogError> {
        let status = self.csr_status.lock().unwrap().clone();
        Ok(self
            .csrs
            .lock()
            .unwrap()
            .iter()
            .map(|csr| {
                let mut csr = csr.clone();
                csr.status = status.clone();
                csr
            })
            .collect())
    }
}
