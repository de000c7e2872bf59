//! Per-build state machine: runs the pipeline stages in order, publishes
//! status after each transition, and honors cancellation between stages.
//!
//! Status transitions replace the whole status subresource so phase, message,
//! and timestamps move atomically; a failed status write is logged and
//! superseded by the next one. Annotation changes always go through
//! JSON-patch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use imagebuilder_core::{
    BootcImageRef, CatalogError, CatalogGateway, ExportFormat, GatewayError, ImageBuild, PatchOp,
    Phase, WorkloadGateway, CANCEL_ANNOTATION,
};
use imagebuilder_storage::StorageSink;

use crate::certificates::CertificateBroker;
use crate::container_build::ContainerBuildStage;
use crate::containerfile::{ContainerfileGenerator, EnrollmentDefaults};
use crate::disk_image::DiskImageBuildStage;
use crate::error::{EngineError, StageError};
use crate::names;
use crate::pod_logs::{collect_pod_logs, SNAPSHOT_TAIL_LINES};

/// Ceiling on one build, certificate issuance through artifact ingestion.
const DEFAULT_BUILD_DEADLINE: Duration = Duration::from_secs(2 * 60 * 60);
/// Bound on the between-stage cancellation probe.
const CANCEL_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Lifetime requested for enrollment certificates.
const ENROLLMENT_CERT_TTL_SECONDS: i64 = 365 * 24 * 3600;

/// Coordinates the complete build pipeline for one `ImageBuild` at a time.
pub struct Orchestrator {
    catalog: Arc<dyn CatalogGateway>,
    workloads: Arc<dyn WorkloadGateway>,
    storage: Arc<StorageSink>,
    certs: CertificateBroker,
    container_stage: ContainerBuildStage,
    disk_stage: DiskImageBuildStage,
    namespace: String,
    enrollment: EnrollmentDefaults,
    build_deadline: Duration,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogGateway>,
        workloads: Arc<dyn WorkloadGateway>,
        storage: Arc<StorageSink>,
        namespace: impl Into<String>,
        service_url: impl Into<String>,
        upload_token: impl Into<String>,
        enrollment: EnrollmentDefaults,
    ) -> Self {
        let namespace = namespace.into();
        Self {
            certs: CertificateBroker::new(catalog.clone()),
            container_stage: ContainerBuildStage::new(workloads.clone(), namespace.clone()),
            disk_stage: DiskImageBuildStage::new(
                workloads.clone(),
                namespace.clone(),
                service_url,
                upload_token,
            ),
            catalog,
            workloads,
            storage,
            namespace,
            enrollment,
            build_deadline: DEFAULT_BUILD_DEADLINE,
        }
    }

    #[cfg(test)]
    pub fn with_build_deadline(mut self, deadline: Duration) -> Self {
        self.build_deadline = deadline;
        self
    }

    /// Run the pipeline for one build to a terminal phase. Bounded by the
    /// two-hour build deadline.
    pub async fn build(&self, tenant: Uuid, build: &ImageBuild) -> Result<(), EngineError> {
        let mut build = build.clone();
        match tokio::time::timeout(self.build_deadline, self.run_pipeline(tenant, &mut build)).await
        {
            Ok(result) => result,
            Err(_) => {
                self.fail_build(
                    tenant,
                    &mut build,
                    EngineError::DeadlineExceeded(self.build_deadline),
                )
                .await
            }
        }
    }

    /// Re-run a build from scratch: mutable status fields (including logs
    /// from the previous failure) are cleared before re-entering the
    /// pipeline.
    pub async fn rebuild(&self, tenant: Uuid, name: &str) -> Result<(), EngineError> {
        tracing::info!(build = %name, "rebuilding");
        let Some(mut build) = self.catalog.get_image_build(tenant, name).await? else {
            return Err(CatalogError::NotFound(format!("imagebuild {name}")).into());
        };
        if let Some(status) = build.status.as_mut() {
            status.phase = None;
            status.message = None;
            status.container_image_ref = None;
            status.bootc_image_refs = None;
            status.start_time = None;
            status.completion_time = None;
            status.logs = None;
        }
        self.build(tenant, &build).await
    }

    async fn run_pipeline(
        &self,
        tenant: Uuid,
        build: &mut ImageBuild,
    ) -> Result<(), EngineError> {
        let name = build.name().to_string();
        tracing::info!(build = %name, "starting build pipeline");

        if self.is_cancelled(tenant, build).await {
            return self.cancel(tenant, build, "build cancelled before starting").await;
        }

        self.update_status(tenant, build, Phase::Building, "starting image build")
            .await;

        let mut enrollment_material: Option<(String, String)> = None;
        if build.spec.agent_config.is_some() {
            if self.is_cancelled(tenant, build).await {
                return self
                    .cancel(tenant, build, "build cancelled during certificate request")
                    .await;
            }
            match self
                .certs
                .request_enrollment_certificate(tenant, &name, ENROLLMENT_CERT_TTL_SECONDS)
                .await
            {
                Ok(material) => enrollment_material = Some(material),
                Err(err) => return self.fail_build(tenant, build, err).await,
            }
        }

        if self.is_cancelled(tenant, build).await {
            return self
                .cancel(tenant, build, "build cancelled before containerfile generation")
                .await;
        }

        let containerfile = {
            let mut generator = ContainerfileGenerator::new(&build.spec)
                .with_enrollment_defaults(self.enrollment.clone());
            if let Some((cert, key)) = enrollment_material.take() {
                generator = generator.with_enrollment_material(cert, key);
            }
            generator.generate()
        };
        let containerfile = match containerfile {
            Ok(containerfile) => containerfile,
            Err(err) => return self.fail_build(tenant, build, err).await,
        };
        tracing::debug!(build = %name, bytes = containerfile.len(), "generated containerfile");

        if self.is_cancelled(tenant, build).await {
            return self
                .cancel(tenant, build, "build cancelled before container image build")
                .await;
        }

        let image_ref = match self.container_stage.run(build, &containerfile).await {
            Ok(image_ref) => image_ref,
            Err(err) => return self.fail_build(tenant, build, err).await,
        };
        self.publish_container_image(tenant, build, &image_ref).await;

        let exports = build.spec.exports().to_vec();
        let mut bootc_refs: Vec<BootcImageRef> = Vec::new();
        let mut failed_exports: Vec<(ExportFormat, EngineError)> = Vec::new();

        if !exports.is_empty() {
            if self.is_cancelled(tenant, build).await {
                return self
                    .cancel(tenant, build, "build cancelled before disk image generation")
                    .await;
            }
            self.update_status(
                tenant,
                build,
                Phase::GeneratingImages,
                "building bootc disk images",
            )
            .await;

            for export in &exports {
                match self.disk_stage.run(build, &image_ref, export).await {
                    Ok(_sentinel) => {
                        match self
                            .storage
                            .resolve_uploaded(&name, export.format.as_str())
                            .await
                        {
                            Ok(stored) => bootc_refs.push(BootcImageRef {
                                format: export.format,
                                architecture: Some(export.architecture_or_default().to_string()),
                                storage_ref: stored.path,
                            }),
                            Err(err) => {
                                tracing::error!(
                                    build = %name,
                                    format = %export.format,
                                    error = %err,
                                    "failed to resolve stored disk image"
                                );
                                failed_exports.push((export.format, err.into()));
                            }
                        }
                    }
                    Err(err) => {
                        tracing::error!(
                            build = %name,
                            format = %export.format,
                            error = %err,
                            "disk image export failed"
                        );
                        failed_exports.push((export.format, err));
                    }
                }
            }

            // The build survives partial export failure, but not losing all
            // of them.
            if bootc_refs.is_empty() {
                let err = failed_exports.pop().map(|(_, err)| err).unwrap_or_else(|| {
                    StageError::new("all disk image exports failed", Vec::new()).into()
                });
                return self.fail_build(tenant, build, err).await;
            }
        }

        self.complete_build(tenant, build, &image_ref, bootc_refs, &failed_exports, exports.len())
            .await;
        // The registry secrets outlive the container stage only for the
        // disk-image jobs; nothing needs them now.
        self.remove_credential_secrets(&name).await;
        tracing::info!(build = %name, "build pipeline completed");
        Ok(())
    }

    /// Delete the per-build registry credential secrets, tolerating absence.
    async fn remove_credential_secrets(&self, build_name: &str) {
        for secret in [
            names::registry_secret_name(build_name),
            names::base_registry_secret_name(build_name),
        ] {
            match self.workloads.delete_secret(&self.namespace, &secret).await {
                Ok(()) => tracing::info!(secret = %secret, "deleted registry secret"),
                Err(GatewayError::NotFound(_)) => {}
                Err(err) => {
                    tracing::warn!(secret = %secret, error = %err, "failed to delete registry secret")
                }
            }
        }
    }

    /// Stop anything running for this build, harvest logs, clear the cancel
    /// annotation, and record the `Cancelled` phase. Safe to call when
    /// nothing is running.
    pub async fn cancel(
        &self,
        tenant: Uuid,
        build: &ImageBuild,
        reason: &str,
    ) -> Result<(), EngineError> {
        let name = build.name().to_string();
        tracing::info!(build = %name, %reason, "cancelling build");

        let selector = names::imagebuild_selector(&name);

        let pods = self
            .workloads
            .list_pods(&self.namespace, &selector)
            .await
            .unwrap_or_default();
        let logs = if pods.is_empty() {
            Vec::new()
        } else {
            collect_pod_logs(
                self.workloads.as_ref(),
                &self.namespace,
                &selector,
                SNAPSHOT_TAIL_LINES,
            )
            .await
        };

        match self.workloads.list_jobs(&self.namespace, &selector).await {
            Ok(jobs) => {
                for job in jobs {
                    let Some(job_name) = job.metadata.name.as_deref() else {
                        continue;
                    };
                    match self.workloads.delete_job(&self.namespace, job_name).await {
                        Ok(()) => tracing::info!(job = %job_name, "deleted job for cancelled build"),
                        Err(err) => {
                            tracing::warn!(job = %job_name, error = %err, "failed to delete job")
                        }
                    }
                }
            }
            Err(err) => tracing::warn!(build = %name, error = %err, "failed to list jobs to cancel"),
        }

        let config_map = names::containerfile_config_map_name(&name);
        if let Err(err) = self.workloads.delete_config_map(&self.namespace, &config_map).await {
            tracing::debug!(config_map = %config_map, error = %err, "containerfile configmap not deleted");
        }
        self.remove_credential_secrets(&name).await;

        self.remove_cancel_annotation(tenant, &name).await;

        let mut build = build.clone();
        let status = build.status_mut();
        status.phase = Some(Phase::Cancelled);
        status.message = Some(format!("build cancelled: {reason}"));
        status.completion_time = Some(Utc::now());
        if !logs.is_empty() {
            status.logs = Some(logs);
        }
        self.catalog.replace_status(tenant, &build).await?;

        tracing::info!(build = %name, "build cancelled");
        Ok(())
    }

    /// Patch-remove the cancel annotation; one retry after re-read on
    /// conflict.
    async fn remove_cancel_annotation(&self, tenant: Uuid, name: &str) {
        let patch = [PatchOp::remove_annotation(CANCEL_ANNOTATION)];
        match self.catalog.patch_image_build(tenant, name, &patch).await {
            Ok(()) => {}
            Err(CatalogError::Conflict(_)) => {
                let _ = self.catalog.get_image_build(tenant, name).await;
                if let Err(err) = self.catalog.patch_image_build(tenant, name, &patch).await {
                    tracing::warn!(build = %name, error = %err, "failed to remove cancel annotation after retry");
                }
            }
            Err(err) => {
                tracing::warn!(build = %name, error = %err, "failed to remove cancel annotation")
            }
        }
    }

    /// Re-read the resource to observe the latest cancel annotation; falls
    /// back to the in-memory copy when the catalog is unreachable.
    async fn is_cancelled(&self, tenant: Uuid, build: &ImageBuild) -> bool {
        let fresh = tokio::time::timeout(
            CANCEL_CHECK_TIMEOUT,
            self.catalog.get_image_build(tenant, build.name()),
        )
        .await;
        match fresh {
            Ok(Ok(Some(latest))) => latest.annotation_is_true(CANCEL_ANNOTATION),
            Ok(Ok(None)) => build.annotation_is_true(CANCEL_ANNOTATION),
            Ok(Err(err)) => {
                tracing::warn!(build = %build.name(), error = %err, "cancel check failed, using local copy");
                build.annotation_is_true(CANCEL_ANNOTATION)
            }
            Err(_) => {
                tracing::warn!(build = %build.name(), "cancel check timed out, using local copy");
                build.annotation_is_true(CANCEL_ANNOTATION)
            }
        }
    }

    async fn update_status(
        &self,
        tenant: Uuid,
        build: &mut ImageBuild,
        phase: Phase,
        message: &str,
    ) {
        let status = build.status_mut();
        status.phase = Some(phase);
        status.message = Some(message.to_string());
        if phase == Phase::Building && status.start_time.is_none() {
            status.start_time = Some(Utc::now());
        }
        if let Err(err) = self.catalog.replace_status(tenant, build).await {
            tracing::warn!(build = %build.name(), %phase, error = %err, "status write failed");
        }
    }

    async fn publish_container_image(
        &self,
        tenant: Uuid,
        build: &mut ImageBuild,
        image_ref: &str,
    ) {
        let status = build.status_mut();
        status.phase = Some(Phase::Pushing);
        status.message = Some("container image built successfully".to_string());
        status.container_image_ref = Some(image_ref.to_string());
        if let Err(err) = self.catalog.replace_status(tenant, build).await {
            tracing::warn!(build = %build.name(), error = %err, "status write failed");
        }
    }

    async fn complete_build(
        &self,
        tenant: Uuid,
        build: &mut ImageBuild,
        image_ref: &str,
        bootc_refs: Vec<BootcImageRef>,
        failed_exports: &[(ExportFormat, EngineError)],
        requested_exports: usize,
    ) {
        let status = build.status_mut();
        status.phase = Some(Phase::Completed);
        status.message = Some(if failed_exports.is_empty() {
            "image build completed successfully".to_string()
        } else {
            format!(
                "image build completed; {} of {requested_exports} disk image exports failed",
                failed_exports.len()
            )
        });
        status.container_image_ref = Some(image_ref.to_string());
        status.completion_time = Some(Utc::now());
        if !bootc_refs.is_empty() {
            status.bootc_image_refs = Some(bootc_refs);
        }
        if let Err(err) = self.catalog.replace_status(tenant, build).await {
            tracing::warn!(build = %build.name(), error = %err, "completion status write failed");
        }
    }

    async fn fail_build(
        &self,
        tenant: Uuid,
        build: &mut ImageBuild,
        err: EngineError,
    ) -> Result<(), EngineError> {
        tracing::error!(build = %build.name(), error = %err, "build failed");

        let status = build.status_mut();
        status.phase = Some(Phase::Failed);
        status.message = Some(format!("build failed: {err}"));
        status.completion_time = Some(Utc::now());
        if let Some(logs) = err.logs().filter(|logs| !logs.is_empty()) {
            status.logs = Some(logs.to_vec());
        }

        if let Err(write_err) = self.catalog.replace_status(tenant, build).await {
            tracing::error!(build = %build.name(), error = %write_err, "failed status write failed");
        }

        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use imagebuilder_core::{
        BootcExport, ImageBuildSpec, ImageBuildStatus, ResourceMeta,
    };
    use imagebuilder_storage::StorageBackend;

    use crate::test_support::{FakeCatalog, FakeWorkloads};

    use super::*;

    struct Harness {
        catalog: Arc<FakeCatalog>,
        workloads: Arc<FakeWorkloads>,
        orchestrator: Orchestrator,
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
        let orchestrator = Orchestrator::new(
            catalog.clone(),
            workloads.clone(),
            storage,
            "flightctl-builds",
            "http://imagebuilder.internal:9090",
            "upload-token",
            EnrollmentDefaults::default(),
        );
        Harness {
            catalog,
            workloads,
            orchestrator,
            tenant: Uuid::new_v4(),
            _dir: dir,
        }
    }

    fn build(name: &str, exports: Vec<BootcExport>) -> ImageBuild {
        ImageBuild {
            metadata: ResourceMeta {
                name: Some(name.to_string()),
                creation_timestamp: Some(Utc.with_ymd_and_hms(2025, 1, 4, 14, 30, 22).unwrap()),
                ..Default::default()
            },
            spec: ImageBuildSpec {
                base_image: "quay.io/centos-bootc/centos-bootc:stream9".to_string(),
                push_to_registry: Some(false),
                bootc_exports: (!exports.is_empty()).then_some(exports),
                ..Default::default()
            },
            status: None,
        }
    }

    fn export(format: ExportFormat) -> BootcExport {
        BootcExport {
            format,
            architecture: None,
        }
    }

    #[tokio::test]
    async fn happy_path_without_exports() {
        let h = harness();
        let b = build("b1", vec![]);
        h.catalog.insert_build(h.tenant, b.clone());

        h.orchestrator.build(h.tenant, &b).await.unwrap();

        assert_eq!(
            h.catalog.phases_for("b1"),
            vec![Phase::Building, Phase::Pushing, Phase::Completed]
        );

        let writes = h.catalog.status_writes_for("b1");
        let completed = writes.last().unwrap().status.as_ref().unwrap();
        assert_eq!(
            completed.container_image_ref.as_deref(),
            Some("b1:20250104-143022")
        );
        assert!(completed.completion_time.unwrap() >= completed.start_time.unwrap());
        assert!(completed.logs.is_none());

        assert_eq!(h.workloads.created_job_names(), vec!["build-b1"]);
        assert_eq!(h.workloads.deleted_job_names(), vec!["build-b1"]);
        assert_eq!(h.workloads.created_config_map_names(), vec!["containerfile-b1"]);
        assert_eq!(h.workloads.deleted_config_map_names(), vec!["containerfile-b1"]);
    }

    #[tokio::test]
    async fn happy_path_with_one_export() {
        let h = harness();
        let b = build("b2", vec![export(ExportFormat::Qcow2)]);
        h.catalog.insert_build(h.tenant, b.clone());

        h.orchestrator.build(h.tenant, &b).await.unwrap();

        assert_eq!(
            h.catalog.phases_for("b2"),
            vec![
                Phase::Building,
                Phase::Pushing,
                Phase::GeneratingImages,
                Phase::Completed
            ]
        );

        let writes = h.catalog.status_writes_for("b2");
        let refs = writes
            .last()
            .unwrap()
            .status
            .as_ref()
            .unwrap()
            .bootc_image_refs
            .clone()
            .unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].format, ExportFormat::Qcow2);
        assert_eq!(refs[0].architecture.as_deref(), Some("x86_64"));
        assert!(refs[0].storage_ref.ends_with("/b2/qcow2.qcow2"));

        assert_eq!(
            h.workloads.created_job_names(),
            vec!["build-b2", "bootc-b2-qcow2"]
        );
    }

    #[tokio::test]
    async fn container_build_failure_attaches_logs() {
        let h = harness();
        h.workloads.fail_job("build-b3");
        h.workloads
            .add_pod("build-b3", "build-b3-pod", "error: dnf install failed");
        let b = build("b3", vec![]);
        h.catalog.insert_build(h.tenant, b.clone());

        let err = h.orchestrator.build(h.tenant, &b).await.unwrap_err();
        assert!(err.logs().is_some());

        assert_eq!(h.catalog.phases_for("b3"), vec![Phase::Building, Phase::Failed]);
        let writes = h.catalog.status_writes_for("b3");
        let failed = writes.last().unwrap().status.as_ref().unwrap();
        assert!(failed.message.as_ref().unwrap().contains("build failed"));
        let logs = failed.logs.as_ref().unwrap();
        assert!(logs.iter().any(|l| l.contains("dnf install failed")));
        assert!(failed.completion_time.is_some());
    }

    #[tokio::test]
    async fn cancel_annotation_stops_the_build_before_it_starts() {
        let h = harness();
        let mut b = build("b4", vec![]);
        b.metadata
            .annotations
            .insert(CANCEL_ANNOTATION.to_string(), "true".to_string());
        h.catalog.insert_build(h.tenant, b.clone());

        h.orchestrator.build(h.tenant, &b).await.unwrap();

        let writes = h.catalog.status_writes_for("b4");
        let status = writes.last().unwrap().status.as_ref().unwrap();
        assert_eq!(status.phase, Some(Phase::Cancelled));
        assert!(status.message.as_ref().unwrap().contains("cancelled"));

        // The cancel annotation is removed by patch, not overwrite.
        let patches = h.catalog.patches_for("b4");
        assert_eq!(patches.len(), 1);
        assert_eq!(
            patches[0][0].path,
            "/metadata/annotations/imagebuilder.flightctl.io~1cancel"
        );
        let stored = h.catalog.build(h.tenant, "b4").unwrap();
        assert!(!stored.annotation_is_true(CANCEL_ANNOTATION));
        // Nothing was running, so nothing was created.
        assert!(h.workloads.created_job_names().is_empty());
    }

    #[tokio::test]
    async fn cancel_collects_logs_and_deletes_jobs() {
        let h = harness();
        let b = build("b5", vec![]);
        h.catalog.insert_build(h.tenant, b.clone());
        h.workloads
            .add_build_pod("b5", "build-b5", "build-b5-pod", "step 3/7 ...");
        let job = k8s_openapi::api::batch::v1::Job {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("build-b5".to_string()),
                labels: Some(names::owned_labels("b5")),
                ..Default::default()
            },
            ..Default::default()
        };
        h.workloads
            .create_job("flightctl-builds", job)
            .await
            .unwrap();

        h.orchestrator
            .cancel(h.tenant, &b, "build cancelled by user request")
            .await
            .unwrap();

        assert_eq!(h.workloads.deleted_job_names(), vec!["build-b5"]);
        let writes = h.catalog.status_writes_for("b5");
        let status = writes.last().unwrap().status.as_ref().unwrap();
        assert_eq!(status.phase, Some(Phase::Cancelled));
        let logs = status.logs.as_ref().unwrap();
        assert!(logs.iter().any(|l| l.contains("step 3/7")));
    }

    #[tokio::test]
    async fn partial_export_failure_still_completes() {
        let h = harness();
        h.workloads.fail_job("bootc-b6-iso");
        h.workloads.add_pod("bootc-b6-iso", "bootc-b6-iso-pod", "iso build exploded");
        let b = build("b6", vec![export(ExportFormat::Qcow2), export(ExportFormat::Iso)]);
        h.catalog.insert_build(h.tenant, b.clone());

        h.orchestrator.build(h.tenant, &b).await.unwrap();

        let writes = h.catalog.status_writes_for("b6");
        let status = writes.last().unwrap().status.as_ref().unwrap();
        assert_eq!(status.phase, Some(Phase::Completed));
        assert!(status.message.as_ref().unwrap().contains("1 of 2"));
        let refs = status.bootc_image_refs.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].format, ExportFormat::Qcow2);
    }

    #[tokio::test]
    async fn all_exports_failing_fails_the_build() {
        let h = harness();
        h.workloads.fail_job("bootc-b7-qcow2");
        let b = build("b7", vec![export(ExportFormat::Qcow2)]);
        h.catalog.insert_build(h.tenant, b.clone());

        let err = h.orchestrator.build(h.tenant, &b).await.unwrap_err();
        assert!(matches!(err, EngineError::Stage(_)));

        let writes = h.catalog.status_writes_for("b7");
        assert_eq!(
            writes.last().unwrap().status.as_ref().unwrap().phase,
            Some(Phase::Failed)
        );
    }

    #[tokio::test]
    async fn rebuild_clears_previous_status() {
        let h = harness();
        let mut b = build("b8", vec![]);
        b.status = Some(ImageBuildStatus {
            phase: Some(Phase::Failed),
            message: Some("build failed: boom".to_string()),
            container_image_ref: Some("b8:stale".to_string()),
            logs: Some(vec!["old failure log".to_string()]),
            completion_time: Some(Utc::now()),
            start_time: Some(Utc::now()),
            ..Default::default()
        });
        h.catalog.insert_build(h.tenant, b);

        h.orchestrator.rebuild(h.tenant, "b8").await.unwrap();

        let writes = h.catalog.status_writes_for("b8");
        let first = writes.first().unwrap().status.as_ref().unwrap();
        assert_eq!(first.phase, Some(Phase::Building));
        assert!(first.logs.is_none());
        assert!(first.container_image_ref.is_none());
        assert_eq!(
            writes.last().unwrap().status.as_ref().unwrap().phase,
            Some(Phase::Completed)
        );
    }

    #[tokio::test]
    async fn deadline_overrun_fails_the_build() {
        let h = harness();
        let orchestrator = Orchestrator::new(
            h.catalog.clone(),
            h.workloads.clone(),
            Arc::new(StorageSink::new(StorageBackend::Local { base_path: None })),
            "flightctl-builds",
            "http://imagebuilder.internal:9090",
            "upload-token",
            EnrollmentDefaults::default(),
        )
        .with_build_deadline(Duration::from_millis(10));
        h.workloads.set_await_delay(Duration::from_secs(5));
        let b = build("b9", vec![]);
        h.catalog.insert_build(h.tenant, b.clone());

        let err = orchestrator.build(h.tenant, &b).await.unwrap_err();
        assert!(matches!(err, EngineError::DeadlineExceeded(_)));

        let writes = h.catalog.status_writes_for("b9");
        let status = writes.last().unwrap().status.as_ref().unwrap();
        assert_eq!(status.phase, Some(Phase::Failed));
        assert!(status.message.as_ref().unwrap().contains("deadline"));
    }

    #[tokio::test]
    async fn agent_config_triggers_certificate_issuance() {
        let h = harness();
        h.catalog
            .sign_csrs_with("-----BEGIN CERTIFICATE-----\nissued\n-----END CERTIFICATE-----");
        let mut b = build("b10", vec![]);
        b.spec.agent_config = Some(Default::default());
        h.catalog.insert_build(h.tenant, b.clone());

        // The broker polls on a 5 s cadence; the first poll finds the signed
        // CSR, so the test stays fast in real time via tokio's auto-advance.
        tokio::time::pause();
        h.orchestrator.build(h.tenant, &b).await.unwrap();
        tokio::time::resume();

        assert_eq!(h.catalog.submitted_csrs().len(), 1);
        let writes = h.catalog.status_writes_for("b10");
        assert_eq!(
            writes.last().unwrap().status.as_ref().unwrap().phase,
            Some(Phase::Completed)
        );
    }
}
