//! Container-build stage: materializes the containerfile and credentials on
//! the cluster, runs a buildah job to completion, and harvests logs when it
//! fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, PodSpec,
    PodTemplateSpec, ResourceRequirements, Secret, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use imagebuilder_core::{ImageBuild, RegistryCredentials, WorkloadGateway};

use crate::error::{EngineError, StageError};
use crate::names;
use crate::pod_logs::{collect_pod_logs, FAILURE_TAIL_LINES};
use crate::registry::{base_image_registry, image_reference, registry_url};

const BUILDER_IMAGE: &str = "quay.io/buildah/stable:latest";
const JOB_BACKOFF_LIMIT: i32 = 2;
const JOB_TTL_SECONDS: i32 = 3_600;

/// Builds and optionally pushes a container image inside a cluster job.
pub struct ContainerBuildStage {
    workloads: Arc<dyn WorkloadGateway>,
    namespace: String,
}

impl ContainerBuildStage {
    pub fn new(workloads: Arc<dyn WorkloadGateway>, namespace: impl Into<String>) -> Self {
        Self {
            workloads,
            namespace: namespace.into(),
        }
    }

    /// Run the build job to completion and return the image reference.
    /// Secrets survive this stage; disk-image jobs still need them.
    pub async fn run(
        &self,
        build: &ImageBuild,
        containerfile: &str,
    ) -> Result<String, EngineError> {
        let build_name = build.name();
        let image = image_reference(build);
        let job_name = names::build_job_name(build_name);

        tracing::info!(build = %build_name, %image, job = %job_name, "starting container build");

        let config_map_name = self.ensure_containerfile(build, containerfile).await?;

        let dest_secret = match destination_credentials(build) {
            Some(credentials) => Some(
                self.ensure_secret(build, &names::registry_secret_name(build_name), credentials)
                    .await?,
            ),
            None => None,
        };
        let base_secret = match build.spec.base_registry_credentials.as_ref() {
            Some(credentials) => Some(
                self.ensure_secret(
                    build,
                    &names::base_registry_secret_name(build_name),
                    credentials,
                )
                .await?,
            ),
            None => None,
        };

        let job = self.build_job(
            &job_name,
            &image,
            &config_map_name,
            dest_secret.as_deref(),
            base_secret.as_deref(),
            build,
        );
        let created = self.workloads.create_job(&self.namespace, job).await?;
        let created_name = created.metadata.name.as_deref().unwrap_or(&job_name);

        let outcome = self.workloads.await_job(&self.namespace, created_name).await;

        if let Err(err) = outcome {
            let logs = collect_pod_logs(
                self.workloads.as_ref(),
                &self.namespace,
                &names::job_pod_selector(&job_name),
                FAILURE_TAIL_LINES,
            )
            .await;
            tracing::error!(job = %job_name, error = %err, lines = logs.len(), "container build job failed");

            let _ = self.workloads.delete_job(&self.namespace, created_name).await;
            let _ = self
                .workloads
                .delete_config_map(&self.namespace, &config_map_name)
                .await;

            return Err(StageError::new(format!("build job failed: {err}"), logs).into());
        }

        tracing::info!(build = %build_name, %image, "container image built");

        let _ = self.workloads.delete_job(&self.namespace, created_name).await;
        let _ = self
            .workloads
            .delete_config_map(&self.namespace, &config_map_name)
            .await;

        Ok(image)
    }

    /// Create the containerfile configmap, reusing an existing one so a
    /// retried build does not fail on the leftover.
    async fn ensure_containerfile(
        &self,
        build: &ImageBuild,
        containerfile: &str,
    ) -> Result<String, EngineError> {
        let name = names::containerfile_config_map_name(build.name());

        if self
            .workloads
            .get_config_map(&self.namespace, &name)
            .await?
            .is_some()
        {
            tracing::info!(config_map = %name, "containerfile configmap already exists, reusing");
            return Ok(name);
        }

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(names::owned_labels(build.name())),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "Containerfile".to_string(),
                containerfile.to_string(),
            )])),
            ..Default::default()
        };
        self.workloads
            .create_config_map(&self.namespace, config_map)
            .await?;
        Ok(name)
    }

    async fn ensure_secret(
        &self,
        build: &ImageBuild,
        name: &str,
        credentials: &RegistryCredentials,
    ) -> Result<String, EngineError> {
        if self
            .workloads
            .get_secret(&self.namespace, name)
            .await?
            .is_some()
        {
            tracing::info!(secret = %name, "registry secret already exists, reusing");
            return Ok(name.to_string());
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(names::owned_labels(build.name())),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(BTreeMap::from([
                ("username".to_string(), credentials.username.clone()),
                ("password".to_string(), credentials.password.clone()),
            ])),
            ..Default::default()
        };
        self.workloads.create_secret(&self.namespace, secret).await?;
        Ok(name.to_string())
    }

    /// Definition of the buildah job. The container assembles a registry auth
    /// file from whichever credential secrets are mounted, builds with bounded
    /// retries, and pushes when the spec asks for it.
    fn build_job(
        &self,
        job_name: &str,
        image: &str,
        config_map_name: &str,
        dest_secret: Option<&str>,
        base_secret: Option<&str>,
        build: &ImageBuild,
    ) -> Job {
        let script = build_script(
            &base_image_registry(&build.spec.base_image),
            &registry_url(build),
            image,
            build.spec.push_to_registry.unwrap_or(false),
        );

        let mut volumes = vec![
            Volume {
                name: "containerfile".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map_name.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "varlibcontainers".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ];
        let mut mounts = vec![
            VolumeMount {
                name: "containerfile".to_string(),
                mount_path: "/containerfile".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "varlibcontainers".to_string(),
                mount_path: "/var/lib/containers".to_string(),
                ..Default::default()
            },
        ];

        if let Some(secret) = dest_secret {
            volumes.push(secret_volume("dest-registry-auth", secret));
            mounts.push(read_only_mount("dest-registry-auth", "/dest-registry-auth"));
        }
        if let Some(secret) = base_secret {
            volumes.push(secret_volume("base-registry-auth", secret));
            mounts.push(read_only_mount("base-registry-auth", "/base-registry-auth"));
        }

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(names::owned_labels(build.name())),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(JOB_BACKOFF_LIMIT),
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                template: PodTemplateSpec {
                    // Pods carry the ownership label too, so cancellation can
                    // find them by selector.
                    metadata: Some(ObjectMeta {
                        labels: Some(names::owned_labels(build.name())),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "buildah".to_string(),
                            image: Some(BUILDER_IMAGE.to_string()),
                            command: Some(vec![
                                "/bin/sh".to_string(),
                                "-c".to_string(),
                                script,
                            ]),
                            security_context: Some(SecurityContext {
                                privileged: Some(true),
                                capabilities: Some(Capabilities {
                                    add: Some(vec![
                                        "NET_ADMIN".to_string(),
                                        "SYS_ADMIN".to_string(),
                                    ]),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            volume_mounts: Some(mounts),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&[("cpu", "1"), ("memory", "2Gi")])),
                                limits: Some(quantities(&[("cpu", "4"), ("memory", "8Gi")])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn destination_credentials(build: &ImageBuild) -> Option<&RegistryCredentials> {
    build
        .spec
        .container_registry
        .as_ref()
        .and_then(|r| r.credentials.as_ref())
}

fn secret_volume(volume_name: &str, secret_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn read_only_mount(volume_name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume_name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

fn quantities(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn build_script(base_registry: &str, dest_registry: &str, image: &str, push: bool) -> String {
    format!(
        r#"set -e

mkdir -p /run/containers/0
AUTH_ENTRIES=""
if [ -f /base-registry-auth/username ] && [ -f /base-registry-auth/password ]; then
    BASE_AUTH=$(printf '%s:%s' "$(cat /base-registry-auth/username)" "$(cat /base-registry-auth/password)" | base64 -w 0)
    AUTH_ENTRIES="\"{base_registry}\": {{\"auth\": \"${{BASE_AUTH}}\"}}"
fi
if [ -f /dest-registry-auth/username ] && [ -f /dest-registry-auth/password ]; then
    DEST_AUTH=$(printf '%s:%s' "$(cat /dest-registry-auth/username)" "$(cat /dest-registry-auth/password)" | base64 -w 0)
    if [ -n "$AUTH_ENTRIES" ]; then
        AUTH_ENTRIES="${{AUTH_ENTRIES}},"
    fi
    AUTH_ENTRIES="${{AUTH_ENTRIES}}\"{dest_registry}\": {{\"auth\": \"${{DEST_AUTH}}\"}}"
fi
printf '{{\n  "auths": {{\n    %s\n  }}\n}}\n' "$AUTH_ENTRIES" > /run/containers/0/auth.json

mkdir -p /workspace
cd /workspace

MAX_RETRIES=5
RETRY_COUNT=0
until buildah bud --format=docker --layers --retry 5 --retry-delay 10s -f /containerfile/Containerfile -t {image} . ; do
    RETRY_COUNT=$((RETRY_COUNT+1))
    if [ $RETRY_COUNT -ge $MAX_RETRIES ]; then
        echo "build failed after $MAX_RETRIES attempts"
        exit 1
    fi
    echo "build attempt $RETRY_COUNT failed, retrying in 15 seconds..."
    sleep 15
done

if [ "{push}" = "true" ]; then
    buildah push --retry 5 --retry-delay 10s {image}
fi
"#
    )
}
