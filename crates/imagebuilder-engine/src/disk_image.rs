//! Disk-image stage: one privileged bootc-image-builder job per requested
//! export. The job writes its artifact to scratch space and uploads it back
//! through the engine's ingest endpoint, so nothing ever transits the
//! orchestrator process.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, HostPathVolumeSource, PodSecurityContext,
    PodSpec, PodTemplateSpec, ResourceRequirements, SeccompProfile, SecurityContext,
    SELinuxOptions, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use imagebuilder_core::{BootcExport, ImageBuild, WorkloadGateway};

use crate::error::{EngineError, StageError};
use crate::names;
use crate::pod_logs::{collect_pod_logs, FAILURE_TAIL_LINES};
use crate::registry::registry_url;

const BOOTC_BUILDER_IMAGE: &str = "quay.io/centos-bootc/bootc-image-builder:latest";
const JOB_BACKOFF_LIMIT: i32 = 2;
const JOB_TTL_SECONDS: i32 = 3_600;
const SCRATCH_SIZE_LIMIT: &str = "20Gi";

/// Runs bootc-image-builder jobs, one export at a time.
pub struct DiskImageBuildStage {
    workloads: Arc<dyn WorkloadGateway>,
    namespace: String,
    service_url: String,
    upload_token: String,
}

impl DiskImageBuildStage {
    pub fn new(
        workloads: Arc<dyn WorkloadGateway>,
        namespace: impl Into<String>,
        service_url: impl Into<String>,
        upload_token: impl Into<String>,
    ) -> Self {
        Self {
            workloads,
            namespace: namespace.into(),
            service_url: service_url.into(),
            upload_token: upload_token.into(),
        }
    }

    /// Build one export and return the `uploaded:<name>/<format>` sentinel the
    /// storage sink resolves to a concrete artifact reference.
    pub async fn run(
        &self,
        build: &ImageBuild,
        container_image_ref: &str,
        export: &BootcExport,
    ) -> Result<String, EngineError> {
        let build_name = build.name();
        let job_name = names::bootc_job_name(build_name, export.format);
        let architecture = export.architecture_or_default();

        tracing::info!(
            build = %build_name,
            format = %export.format,
            %architecture,
            image = %container_image_ref,
            "starting disk image build"
        );

        let job = self.bootc_job(&job_name, container_image_ref, export, build);
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
            tracing::error!(job = %job_name, error = %err, lines = logs.len(), "disk image job failed");

            let _ = self.workloads.delete_job(&self.namespace, created_name).await;

            return Err(StageError::new(
                format!("disk image job for {} failed: {err}", export.format),
                logs,
            )
            .into());
        }

        tracing::info!(build = %build_name, format = %export.format, "disk image built and uploaded");
        let _ = self.workloads.delete_job(&self.namespace, created_name).await;

        Ok(format!("uploaded:{build_name}/{}", export.format))
    }

    /// Definition of the bootc-image-builder job. The pod runs privileged and
    /// unconfined: the builder needs writable /sys, loop devices, and chroot.
    fn bootc_job(
        &self,
        job_name: &str,
        container_image_ref: &str,
        export: &BootcExport,
        build: &ImageBuild,
    ) -> Job {
        let build_name = build.name();
        let output_path = format!("/output/{build_name}/{}", export.format);
        let script = bootc_script(
            &output_path,
            &registry_url(build),
            container_image_ref,
            export.format.as_str(),
            export.architecture_or_default(),
            build_name,
        );

        let registry_secret = build
            .spec
            .has_destination_credentials()
            .then(|| names::registry_secret_name(build_name));

        let mut volumes = vec![
            Volume {
                name: "output".to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    size_limit: Some(Quantity(SCRATCH_SIZE_LIMIT.to_string())),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "containers-storage".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            Volume {
                name: "sys".to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: "/sys".to_string(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            },
        ];
        let mut mounts = vec![
            VolumeMount {
                name: "output".to_string(),
                mount_path: "/output".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "containers-storage".to_string(),
                mount_path: "/var/lib/containers".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "sys".to_string(),
                mount_path: "/sys".to_string(),
                ..Default::default()
            },
        ];
        if let Some(secret) = registry_secret.as_deref() {
            volumes.push(secret_volume("registry-auth", secret));
            mounts.push(VolumeMount {
                name: "registry-auth".to_string(),
                mount_path: "/registry-auth".to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let mut labels = names::owned_labels(build_name);
        labels.insert("type".to_string(), "bootc".to_string());

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(JOB_BACKOFF_LIMIT),
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(names::owned_labels(build_name)),
                        annotations: Some(BTreeMap::from([
                            (
                                "container.apparmor.security.beta.kubernetes.io/bootc-builder"
                                    .to_string(),
                                "unconfined".to_string(),
                            ),
                            (
                                "seccomp.security.alpha.kubernetes.io/pod".to_string(),
                                "unconfined".to_string(),
                            ),
                        ])),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        security_context: Some(PodSecurityContext {
                            run_as_user: Some(0),
                            run_as_group: Some(0),
                            fs_group: Some(0),
                            seccomp_profile: Some(SeccompProfile {
                                type_: "Unconfined".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        containers: vec![Container {
                            name: "bootc-builder".to_string(),
                            image: Some(BOOTC_BUILDER_IMAGE.to_string()),
                            command: Some(vec![
                                "/bin/sh".to_string(),
                                "-c".to_string(),
                                script,
                            ]),
                            env: Some(vec![
                                EnvVar {
                                    name: "UPLOAD_TOKEN".to_string(),
                                    value: Some(self.upload_token.clone()),
                                    ..Default::default()
                                },
                                EnvVar {
                                    name: "IMAGEBUILDER_UPLOAD_URL".to_string(),
                                    value: Some(self.service_url.clone()),
                                    ..Default::default()
                                },
                            ]),
                            security_context: Some(SecurityContext {
                                privileged: Some(true),
                                allow_privilege_escalation: Some(true),
                                read_only_root_filesystem: Some(false),
                                capabilities: Some(Capabilities {
                                    add: Some(
                                        [
                                            "SYS_ADMIN",
                                            "MKNOD",
                                            "SYS_CHROOT",
                                            "SETFCAP",
                                            "SYS_MODULE",
                                            "NET_ADMIN",
                                            "MAC_ADMIN",
                                        ]
                                        .iter()
                                        .map(|c| c.to_string())
                                        .collect(),
                                    ),
                                    ..Default::default()
                                }),
                                se_linux_options: Some(SELinuxOptions {
                                    type_: Some("unconfined_t".to_string()),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }),
                            volume_mounts: Some(mounts),
                            resources: Some(ResourceRequirements {
                                requests: Some(quantities(&[("cpu", "2"), ("memory", "4Gi")])),
                                limits: Some(quantities(&[("cpu", "8"), ("memory", "16Gi")])),
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

fn quantities(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn secret_volume(volume_name: &str, secret_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        secret: Some(k8s_openapi::api::core::v1::SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn bootc_script(
    output_path: &str,
    registry: &str,
    image: &str,
    image_type: &str,
    architecture: &str,
    build_name: &str,
) -> String {
    format!(
        r#"set -e

if mount | grep -q 'on /sys type sysfs.*ro'; then
    mount -o remount,rw /sys || echo "warning: could not remount /sys read-write"
else
    mount -t sysfs sysfs /sys 2>/dev/null || true
fi

mkdir -p /var/lib/containers/storage/overlay \
         /var/lib/containers/storage/overlay-images \
         /var/lib/containers/storage/overlay-layers \
         /var/lib/containers/storage/vfs \
         /var/lib/containers/storage/vfs-images \
         /var/lib/containers/storage/vfs-layers \
         /var/lib/containers/cache \
         /var/lib/containers/sigstore
mkdir -p {output_path}

mkdir -p /etc/containers
cat > /etc/containers/registries.conf <<'EOF'
unqualified-search-registries = ["localhost:5000", "docker.io"]
short-name-mode = "permissive"
EOF

if [ -f /registry-auth/username ] && [ -f /registry-auth/password ]; then
    mkdir -p /run/containers/0
    cat > /run/containers/0/auth.json <<EOF
{{
  "auths": {{
    "{registry}": {{
      "auth": "$(printf '%s:%s' "$(cat /registry-auth/username)" "$(cat /registry-auth/password)" | base64 -w 0)"
    }}
  }}
}}
EOF
fi

echo "pulling container image {image}"
podman pull {image} || {{
    echo "ERROR: failed to pull {image}"
    podman images || true
    exit 1
}}

bootc-image-builder build \
    --type {image_type} \
    --output {output_path} \
    {image}

ls -lh {output_path}

ARTIFACT_FILE=$(find {output_path} -type f \( -name "*.iso" -o -name "*.qcow2" -o -name "*.raw" -o -name "*.vmdk" -o -name "*.ami" -o -name "*.tar" \) | head -n 1)
if [ -z "$ARTIFACT_FILE" ]; then
    echo "ERROR: no artifact found in {output_path}"
    exit 1
fi
echo "uploading $ARTIFACT_FILE"

curl -X POST \
    -H "Authorization: Bearer ${{UPLOAD_TOKEN}}" \
    -F "imageName={build_name}" \
    -F "imageType={image_type}" \
    -F "architecture={architecture}" \
    -F "file=@${{ARTIFACT_FILE}}" \
    -f \
    ${{IMAGEBUILDER_UPLOAD_URL}}/api/v1/imagebuilds/upload || {{
        echo "ERROR: artifact upload failed"
        exit 1
    }}

echo "artifact uploaded"
"#
    )
}
