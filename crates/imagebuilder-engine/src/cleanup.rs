//! Startup cleanup of orphaned build resources, guarded by a cluster-wide
//! lease so only one replica sweeps.
//!
//! The lease is a configmap created with create-if-not-exists semantics. A
//! stale lease (older than the lease window) is reclaimed by deleting it and
//! retrying the create once. Expiry is advisory: the worst outcome of a
//! stale-lease race is a duplicate sweep, which is idempotent.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use imagebuilder_core::{CatalogGateway, GatewayError, Phase, WorkloadGateway};

use crate::error::EngineError;
use crate::names::{containerfile_config_map_name, BUILD_JOB_PREFIX};

/// Name of the lease object in the build namespace.
pub const CLEANUP_LOCK_NAME: &str = "imagebuilder-cleanup-lock";

/// Deletes workloads and configmaps whose owning build is gone or inactive.
pub struct CleanupReconciler {
    catalog: Arc<dyn CatalogGateway>,
    workloads: Arc<dyn WorkloadGateway>,
    namespace: String,
    holder: String,
    lease_duration: Duration,
    orphan_age: Duration,
}

impl CleanupReconciler {
    pub fn new(
        catalog: Arc<dyn CatalogGateway>,
        workloads: Arc<dyn WorkloadGateway>,
        namespace: impl Into<String>,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            workloads,
            namespace: namespace.into(),
            holder: holder.into(),
            lease_duration: Duration::minutes(5),
            orphan_age: Duration::hours(1),
        }
    }

    /// One cleanup pass. Never blocks startup: the caller logs errors and
    /// continues.
    pub async fn run(&self) -> Result<(), EngineError> {
        tracing::info!("starting cleanup of orphaned build resources");

        if !self.try_acquire_lease().await? {
            tracing::info!("another instance is performing cleanup, skipping");
            return Ok(());
        }
        tracing::info!(holder = %self.holder, "cleanup lease acquired");

        let result = self.sweep().await;
        self.release_lease().await;
        result
    }

    async fn sweep(&self) -> Result<(), EngineError> {
        let active = self.active_build_names().await;
        tracing::info!(count = active.len(), "found active builds");

        let pods = self.workloads.list_pods(&self.namespace, "").await?;

        let mut orphaned_jobs = HashSet::new();
        let mut orphaned_config_maps = HashSet::new();
        let now = Utc::now();

        for pod in &pods {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            let Some(job_name) = labels.get("job-name") else {
                continue;
            };
            let Some(build_name) = job_name.strip_prefix(BUILD_JOB_PREFIX) else {
                continue;
            };

            if active.contains(build_name) {
                tracing::debug!(job = %job_name, build = %build_name, "build still active, keeping");
                continue;
            }

            let created: Option<DateTime<Utc>> =
                pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
            let old_enough = created.is_some_and(|at| now - at > self.orphan_age);
            if !old_enough {
                tracing::debug!(job = %job_name, "pod too recent, keeping");
                continue;
            }

            orphaned_jobs.insert(job_name.clone());
            orphaned_config_maps.insert(containerfile_config_map_name(build_name));
        }

        tracing::info!(
            jobs = orphaned_jobs.len(),
            config_maps = orphaned_config_maps.len(),
            "found orphaned resources"
        );

        for job_name in &orphaned_jobs {
            tracing::info!(job = %job_name, "deleting orphaned job");
            if let Err(err) = self.workloads.delete_job(&self.namespace, job_name).await {
                tracing::warn!(job = %job_name, error = %err, "failed to delete orphaned job");
            }
        }
        for config_map in &orphaned_config_maps {
            tracing::info!(config_map = %config_map, "deleting orphaned configmap");
            if let Err(err) = self
                .workloads
                .delete_config_map(&self.namespace, config_map)
                .await
            {
                tracing::warn!(config_map = %config_map, error = %err, "failed to delete orphaned configmap");
            }
        }

        tracing::info!(
            jobs = orphaned_jobs.len(),
            config_maps = orphaned_config_maps.len(),
            "cleanup completed"
        );
        Ok(())
    }

    /// Builds in a phase whose workloads must never be deleted, across all
    /// tenants. Listing errors leave the tenant out rather than aborting;
    /// missing names are simply not protected.
    async fn active_build_names(&self) -> HashSet<String> {
        let mut active = HashSet::new();

        let tenants = match self.catalog.list_tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                tracing::warn!(error = %err, "failed to list tenants for cleanup");
                return active;
            }
        };

        for tenant in tenants {
            let builds = match self.catalog.list_image_builds(tenant).await {
                Ok(builds) => builds,
                Err(err) => {
                    tracing::warn!(%tenant, error = %err, "failed to list builds for cleanup");
                    continue;
                }
            };
            for build in builds {
                let protected = match build.phase() {
                    Some(phase) => phase.is_active() || phase == Phase::Pending,
                    None => true,
                };
                if protected {
                    active.insert(build.name().to_string());
                }
            }
        }

        active
    }

    /// Create-if-not-exists on the lease configmap. A second create attempt
    /// is made after reclaiming a stale or malformed lease.
    async fn try_acquire_lease(&self) -> Result<bool, EngineError> {
        for attempt in 0..2 {
            let lease = self.lease_config_map(Utc::now());
            match self
                .workloads
                .create_config_map(&self.namespace, lease)
                .await
            {
                Ok(_) => return Ok(true),
                Err(GatewayError::AlreadyExists(_)) => {}
                Err(err) => return Err(err.into()),
            }
            if attempt == 1 {
                return Ok(false);
            }

            let Some(existing) = self
                .workloads
                .get_config_map(&self.namespace, CLEANUP_LOCK_NAME)
                .await?
            else {
                // The holder released between our create and get; retry the
                // create once.
                continue;
            };

            let data = existing.data.unwrap_or_default();
            let held_at = data
                .get("timestamp")
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|at| at.with_timezone(&Utc));

            match held_at {
                Some(at) if Utc::now() - at > self.lease_duration => {
                    tracing::info!(
                        held_for = %(Utc::now() - at),
                        "cleanup lease is stale, reclaiming"
                    );
                }
                Some(at) => {
                    let holder = data.get("holder").cloned().unwrap_or_default();
                    tracing::info!(%holder, acquired = %at, "cleanup lease is held");
                    return Ok(false);
                }
                None => {
                    tracing::warn!("cleanup lease has no valid timestamp, reclaiming");
                }
            }

            if let Err(err) = self
                .workloads
                .delete_config_map(&self.namespace, CLEANUP_LOCK_NAME)
                .await
            {
                tracing::warn!(error = %err, "failed to delete stale cleanup lease");
                return Ok(false);
            }
        }
        Ok(false)
    }

    async fn release_lease(&self) {
        match self
            .workloads
            .delete_config_map(&self.namespace, CLEANUP_LOCK_NAME)
            .await
        {
            Ok(()) => tracing::info!("cleanup lease released"),
            Err(err) => tracing::warn!(error = %err, "failed to release cleanup lease"),
        }
    }

    fn lease_config_map(&self, now: DateTime<Utc>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(CLEANUP_LOCK_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("holder".to_string(), self.holder.clone()),
                ("timestamp".to_string(), now.to_rfc3339()),
            ])),
            ..Default::default()
        }
    }
}
