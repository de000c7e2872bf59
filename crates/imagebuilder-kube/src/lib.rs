//! `WorkloadGateway` backed by a real cluster client.
//!
//! Client bootstrap follows the usual fallback chain: in-cluster service
//! account first, then `KUBECONFIG`, then `$HOME/.kube/config`. Job
//! completion is observed through a field-scoped watch; deleting a job from
//! another task surfaces to the watcher as an error, which is how mid-stage
//! cancellation works.

use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::watcher;
use kube::Client;

use imagebuilder_core::{GatewayError, WorkloadGateway};

/// Ceiling on waiting for a single job to reach a terminal state.
const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Cluster-backed gateway over jobs, configmaps, secrets, PVCs, and pods.
#[derive(Clone)]
pub struct KubeWorkloadGateway {
    client: Client,
}

impl KubeWorkloadGateway {
    /// Connect using in-cluster configuration when available, falling back
    /// to the local kubeconfig.
    pub async fn connect() -> Result<Self, GatewayError> {
        let client = Client::try_default()
            .await
            .map_err(|e| GatewayError::Api(format!("failed to create cluster client: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pvcs(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_kube_error(context: &str, err: kube::Error) -> GatewayError {
    match &err {
        kube::Error::Api(response) if response.code == 404 => {
            GatewayError::NotFound(context.to_string())
        }
        kube::Error::Api(response) if response.code == 409 => {
            GatewayError::AlreadyExists(context.to_string())
        }
        _ => GatewayError::Api(format!("{context}: {err}")),
    }
}

#[async_trait]
impl WorkloadGateway for KubeWorkloadGateway {
    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job, GatewayError> {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.jobs(namespace)
            .create(&PostParams::default(), &job)
            .await
            .map_err(|e| map_kube_error(&format!("job {namespace}/{name}"), e))
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, GatewayError> {
        self.jobs(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(&format!("job {namespace}/{name}"), e))
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Job>, GatewayError> {
        let params = ListParams::default().labels(label_selector);
        let list = self
            .jobs(namespace)
            .list(&params)
            .await
            .map_err(|e| map_kube_error(&format!("jobs in {namespace}"), e))?;
        Ok(list.items)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_kube_error(&format!("job {namespace}/{name}"), e))?;
        Ok(())
    }

    async fn await_job(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        let api = self.jobs(namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));

        let wait = async {
            let mut stream = watcher(api, config).boxed();
            loop {
                let event = stream
                    .try_next()
                    .await
                    .map_err(|e| GatewayError::Api(format!("watch for job {name}: {e}")))?
                    .ok_or_else(|| {
                        GatewayError::Api(format!("watch for job {name} ended unexpectedly"))
                    })?;

                match event {
                    watcher::Event::Apply(job) | watcher::Event::InitApply(job) => {
                        if let Some(status) = job.status.as_ref() {
                            if status.succeeded.unwrap_or(0) > 0 {
                                return Ok(());
                            }
                            if status.failed.unwrap_or(0) > 0 {
                                return Err(GatewayError::JobFailed(name.to_string()));
                            }
                        }
                    }
                    watcher::Event::Delete(_) => {
                        return Err(GatewayError::Api(format!(
                            "job {name} was deleted while waiting for completion"
                        )));
                    }
                    watcher::Event::Init | watcher::Event::InitDone => {}
                }
            }
        };

        match tokio::time::timeout(JOB_WAIT_TIMEOUT, wait).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(format!(
                "job {namespace}/{name} to complete"
            ))),
        }
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: ConfigMap,
    ) -> Result<ConfigMap, GatewayError> {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.config_maps(namespace)
            .create(&PostParams::default(), &config_map)
            .await
            .map_err(|e| map_kube_error(&format!("configmap {namespace}/{name}"), e))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, GatewayError> {
        self.config_maps(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(&format!("configmap {namespace}/{name}"), e))
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.config_maps(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(&format!("configmap {namespace}/{name}"), e))?;
        Ok(())
    }

    async fn create_secret(&self, namespace: &str, secret: Secret) -> Result<Secret, GatewayError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        self.secrets(namespace)
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| map_kube_error(&format!("secret {namespace}/{name}"), e))
    }

    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, GatewayError> {
        self.secrets(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(&format!("secret {namespace}/{name}"), e))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(&format!("secret {namespace}/{name}"), e))?;
        Ok(())
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, GatewayError> {
        let name = pvc.metadata.name.clone().unwrap_or_default();
        self.pvcs(namespace)
            .create(&PostParams::default(), &pvc)
            .await
            .map_err(|e| map_kube_error(&format!("pvc {namespace}/{name}"), e))
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), GatewayError> {
        self.pvcs(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error(&format!("pvc {namespace}/{name}"), e))?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<Pod>, GatewayError> {
        let params = if label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(label_selector)
        };
        let list = self
            .pods(namespace)
            .list(&params)
            .await
            .map_err(|e| map_kube_error(&format!("pods in {namespace}"), e))?;
        Ok(list.items)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod_name: &str,
        tail_lines: i64,
    ) -> Result<String, GatewayError> {
        let params = LogParams {
            tail_lines: Some(tail_lines),
            ..Default::default()
        };
        self.pods(namespace)
            .logs(pod_name, &params)
            .await
            .map_err(|e| map_kube_error(&format!("logs for pod {namespace}/{pod_name}"), e))
    }
}
