//! Periodic discovery of work: scans every tenant's builds, dispatches new
//! ones to the orchestrator, and routes cancel/retry annotations.
//!
//! The loop never dies on a transient catalog error; only cancelling its
//! token stops it. Builds run on detached tasks so shutting the loop down
//! does not kill an in-flight build mid-stage.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use imagebuilder_core::{
    CatalogGateway, ImageBuild, PatchOp, Phase, CANCEL_ANNOTATION, RETRY_ANNOTATION,
};

use crate::orchestrator::Orchestrator;

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);
/// Repeat cancel requests within this window are ignored.
const CANCEL_DEDUP_TTL: Duration = Duration::from_secs(2 * 60);

/// The polling reconciler.
pub struct ReconcileLoop {
    catalog: Arc<dyn CatalogGateway>,
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    cancel_dedup_ttl: Duration,
    /// At-most-once guard: one orchestrator task per build at any time.
    /// Shared with the spawned tasks, which remove their entry on exit.
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Only ever touched from the loop's own task.
    recently_cancelled: HashMap<String, Instant>,
}

impl ReconcileLoop {
    pub fn new(catalog: Arc<dyn CatalogGateway>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            catalog,
            orchestrator,
            interval: DEFAULT_TICK_INTERVAL,
            cancel_dedup_ttl: CANCEL_DEDUP_TTL,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            recently_cancelled: HashMap::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[cfg(test)]
    pub fn with_cancel_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.cancel_dedup_ttl = ttl;
        self
    }

    /// Run until `token` is cancelled. The first tick fires immediately.
    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(interval = ?self.interval, "reconcile loop running");
        self.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("reconcile loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
            }
        }
    }

    /// One reconcile pass over every tenant.
    pub async fn tick(&mut self) {
        self.sweep_recently_cancelled();

        let tenants = match self.catalog.list_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                tracing::error!(error = %err, "failed to list tenants");
                return;
            }
        };

        for tenant in tenants {
            self.reconcile_tenant(tenant).await;
        }
    }

    async fn reconcile_tenant(&mut self, tenant: Uuid) {
        let builds = match self.catalog.list_image_builds(tenant).await {
            Ok(builds) => builds,
            Err(err) => {
                tracing::error!(%tenant, error = %err, "failed to list image builds");
                return;
            }
        };

        for build in builds {
            if Self::is_processable(&build) {
                tracing::info!(%tenant, build = %build.name(), "found pending build");
                self.dispatch_build(tenant, build);
                continue;
            }

            if Self::is_cancelable(&build) {
                self.handle_cancellation(tenant, &build).await;
            }

            if Self::is_retriable(&build) {
                self.handle_retry(tenant, &build).await;
            }
        }
    }

    /// Builds the engine has not picked up yet.
    fn is_processable(build: &ImageBuild) -> bool {
        match build.phase() {
            None | Some(Phase::Pending) => true,
            Some(_) => false,
        }
    }

    /// Active builds with a user cancel request.
    fn is_cancelable(build: &ImageBuild) -> bool {
        build.phase().is_some_and(Phase::is_active) && build.annotation_is_true(CANCEL_ANNOTATION)
    }

    /// Failed builds with a user retry request.
    fn is_retriable(build: &ImageBuild) -> bool {
        build.phase() == Some(Phase::Failed) && build.annotation_is_true(RETRY_ANNOTATION)
    }

    /// Spawn one detached orchestrator task per build, guarded by the
    /// in-flight set.
    fn dispatch_build(&self, tenant: Uuid, build: ImageBuild) {
        let key = in_flight_key(tenant, build.name());
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(key.clone()) {
                tracing::debug!(build = %build.name(), "build already in flight, skipping");
                return;
            }
        }

        let orchestrator = self.orchestrator.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let name = build.name().to_string();
            if let Err(err) = orchestrator.build(tenant, &build).await {
                tracing::error!(build = %name, error = %err, "build failed");
            } else {
                tracing::info!(build = %name, "build finished");
            }
            in_flight.lock().unwrap().remove(&key);
        });
    }

    async fn handle_cancellation(&mut self, tenant: Uuid, build: &ImageBuild) {
        let key = in_flight_key(tenant, build.name());

        if let Some(last) = self.recently_cancelled.get(&key) {
            if last.elapsed() < self.cancel_dedup_ttl {
                tracing::debug!(build = %build.name(), "cancel recently handled, skipping duplicate");
                return;
            }
        }
        self.recently_cancelled.insert(key, Instant::now());

        tracing::info!(build = %build.name(), phase = ?build.phase(), "handling cancel request");
        if let Err(err) = self
            .orchestrator
            .cancel(tenant, build, "build cancelled by user request")
            .await
        {
            tracing::debug!(build = %build.name(), error = %err, "cancellation finished with error");
        }
    }

    async fn handle_retry(&mut self, tenant: Uuid, build: &ImageBuild) {
        let name = build.name().to_string();
        tracing::info!(build = %name, "retrying failed build");

        // Strip the annotation first so the next tick does not re-dispatch.
        let patch = [PatchOp::remove_annotation(RETRY_ANNOTATION)];
        if let Err(err) = self.catalog.patch_image_build(tenant, &name, &patch).await {
            tracing::warn!(build = %name, error = %err, "failed to remove retry annotation, skipping retry");
            return;
        }

        let key = in_flight_key(tenant, &name);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(key.clone()) {
                tracing::debug!(build = %name, "build already in flight, skipping retry");
                return;
            }
        }

        let orchestrator = self.orchestrator.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.rebuild(tenant, &name).await {
                tracing::error!(build = %name, error = %err, "retried build failed");
            }
            in_flight.lock().unwrap().remove(&key);
        });
    }

    fn sweep_recently_cancelled(&mut self) {
        let ttl = self.cancel_dedup_ttl;
        self.recently_cancelled.retain(|_, at| at.elapsed() <= ttl);
    }
}

fn in_flight_key(tenant: Uuid, name: &str) -> String {
    format!("{tenant}/{name}")
}

#[cfg(test)]
mod tests {
    use imagebuilder_core::{ImageBuildSpec, ImageBuildStatus, ResourceMeta};
    use imagebuilder_storage::{StorageBackend, StorageSink};

    use crate::containerfile::EnrollmentDefaults;
    use crate::test_support::{FakeCatalog, FakeWorkloads};

    use super::*;

    fn build_with_phase(name: &str, phase: Option<Phase>) -> ImageBuild {
        ImageBuild {
            metadata: ResourceMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: ImageBuildSpec {
                base_image: "quay.io/centos-bootc/centos-bootc:stream9".to_string(),
                ..Default::default()
            },
            status: phase.map(|phase| ImageBuildStatus {
                phase: Some(phase),
                ..Default::default()
            }),
        }
    }

    fn annotated(mut build: ImageBuild, key: &str) -> ImageBuild {
        build
            .metadata
            .annotations
            .insert(key.to_string(), "true".to_string());
        build
    }

    struct Harness {
        catalog: Arc<FakeCatalog>,
        workloads: Arc<FakeWorkloads>,
        reconciler: ReconcileLoop,
        tenant: Uuid,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let catalog = Arc::new(FakeCatalog::default());
        let workloads = Arc::new(FakeWorkloads::default());
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageSink::new(StorageBackend::Local {
            base_path: Some(dir.path().to_path_buf()),
        }));
        let orchestrator = Arc::new(Orchestrator::new(
            catalog.clone(),
            workloads.clone(),
            storage,
            "flightctl-builds",
            "http://imagebuilder.internal:9090",
            "upload-token",
            EnrollmentDefaults::default(),
        ));
        let reconciler = ReconcileLoop::new(catalog.clone(), orchestrator);
        let tenant = Uuid::new_v4();
        catalog.add_tenant(tenant);
        Harness {
            catalog,
            workloads,
            reconciler,
            tenant,
            _dir: dir,
        }
    }

    async fn settle() {
        // Let spawned build tasks run to completion.
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn classification_rules() {
        assert!(ReconcileLoop::is_processable(&build_with_phase("b", None)));
        assert!(ReconcileLoop::is_processable(&build_with_phase(
            "b",
            Some(Phase::Pending)
        )));
        assert!(!ReconcileLoop::is_processable(&build_with_phase(
            "b",
            Some(Phase::Building)
        )));
        assert!(!ReconcileLoop::is_processable(&build_with_phase(
            "b",
            Some(Phase::Failed)
        )));

        let cancelable = annotated(
            build_with_phase("b", Some(Phase::Building)),
            CANCEL_ANNOTATION,
        );
        assert!(ReconcileLoop::is_cancelable(&cancelable));
        let wrong_phase = annotated(
            build_with_phase("b", Some(Phase::Completed)),
            CANCEL_ANNOTATION,
        );
        assert!(!ReconcileLoop::is_cancelable(&wrong_phase));
        assert!(!ReconcileLoop::is_cancelable(&build_with_phase(
            "b",
            Some(Phase::Building)
        )));

        let retriable = annotated(build_with_phase("b", Some(Phase::Failed)), RETRY_ANNOTATION);
        assert!(ReconcileLoop::is_retriable(&retriable));
        assert!(!ReconcileLoop::is_retriable(&annotated(
            build_with_phase("b", Some(Phase::Building)),
            RETRY_ANNOTATION,
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pending_build_is_dispatched_once() {
        let mut h = harness();
        h.catalog
            .insert_build(h.tenant, build_with_phase("b1", None));
        // Keep the build both listed as pending and in flight across ticks,
        // so only the in-flight set prevents a double dispatch.
        h.catalog.freeze_stored_status(true);
        h.workloads.set_await_delay(Duration::from_millis(300));

        h.reconciler.tick().await;
        h.reconciler.tick().await;
        settle().await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        // The in-flight set kept the second tick from double-dispatching.
        assert_eq!(h.workloads.created_job_names(), vec!["build-b1"]);
        let building_writes = h
            .catalog
            .phases_for("b1")
            .into_iter()
            .filter(|phase| *phase == Phase::Building)
            .count();
        assert_eq!(building_writes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_cancel_requests_are_deduplicated() {
        let mut h = harness();
        let cancelable = annotated(
            build_with_phase("b2", Some(Phase::Building)),
            CANCEL_ANNOTATION,
        );
        h.catalog.insert_build(h.tenant, cancelable);

        h.reconciler.tick().await;
        // The fake re-adds the annotation to simulate a second user request
        // landing inside the dedup window.
        let again = annotated(
            build_with_phase("b2", Some(Phase::Building)),
            CANCEL_ANNOTATION,
        );
        h.catalog.insert_build(h.tenant, again);
        h.reconciler.tick().await;

        // One cancel: exactly one annotation-removal patch.
        assert_eq!(h.catalog.patches_for("b2").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_requests_are_honored_again_after_the_ttl() {
        let mut h = harness();
        h.reconciler = h.reconciler.with_cancel_dedup_ttl(Duration::from_millis(50));
        let cancelable = annotated(
            build_with_phase("b3", Some(Phase::Building)),
            CANCEL_ANNOTATION,
        );
        h.catalog.insert_build(h.tenant, cancelable.clone());

        h.reconciler.tick().await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        h.catalog.insert_build(h.tenant, cancelable);
        h.reconciler.tick().await;

        assert_eq!(h.catalog.patches_for("b3").len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_strips_annotation_and_redispatches() {
        let mut h = harness();
        let mut failed = annotated(build_with_phase("b4", Some(Phase::Failed)), RETRY_ANNOTATION);
        failed.status.as_mut().unwrap().logs = Some(vec!["old log".to_string()]);
        h.catalog.insert_build(h.tenant, failed);

        h.reconciler.tick().await;
        settle().await;

        // Annotation removed by patch.
        let stored = h.catalog.build(h.tenant, "b4").unwrap();
        assert!(!stored.annotation_is_true(RETRY_ANNOTATION));
        // The build ran again from the start.
        let phases = h.catalog.phases_for("b4");
        assert_eq!(phases.first(), Some(&Phase::Building));
        assert_eq!(phases.last(), Some(&Phase::Completed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tenant_listing_errors_do_not_kill_the_loop() {
        let mut h = harness();
        h.catalog.fail_tenant_listing(true);
        h.reconciler.tick().await;

        h.catalog.fail_tenant_listing(false);
        h.catalog
            .insert_build(h.tenant, build_with_phase("b5", Some(Phase::Pending)));
        h.reconciler.tick().await;
        settle().await;

        assert_eq!(h.workloads.created_job_names(), vec!["build-b5"]);
    }
}
