//! The `ImageBuild` resource model: spec, status, metadata, and the control
//! annotations observed by the engine.
//!
//! Field names follow the catalog's wire format (camelCase JSON). The spec is
//! immutable once created; everything the engine reports lands on the status
//! subresource.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation requesting cancellation of an active build.
pub const CANCEL_ANNOTATION: &str = "imagebuilder.flightctl.io/cancel";
/// Annotation requesting a re-run of a failed build.
pub const RETRY_ANNOTATION: &str = "imagebuilder.flightctl.io/retry";

/// Label attached to every cluster resource owned by a build; the value is the
/// build name. This selector is authoritative for cleanup and log harvesting.
pub const IMAGEBUILD_LABEL: &str = "imagebuild";
/// Shared app label on all resources materialized by the engine.
pub const APP_LABEL_VALUE: &str = "flightctl-imagebuilder";

/// Lifecycle phase of an `ImageBuild`. Absence of a phase means the build has
/// never been observed by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    Pending,
    Building,
    Pushing,
    GeneratingImages,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    /// Terminal phases are never left except by an explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    /// Phases during which a cancel annotation is honored.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Phase::Building | Phase::Pushing | Phase::GeneratingImages
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Building => "Building",
            Phase::Pushing => "Pushing",
            Phase::GeneratingImages => "GeneratingImages",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
            Phase::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource metadata shared with the catalog.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Disk-image form factors derivable from a built container image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Iso,
    Qcow2,
    Vmdk,
    Raw,
    Ami,
    Tar,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Iso => "iso",
            ExportFormat::Qcow2 => "qcow2",
            ExportFormat::Vmdk => "vmdk",
            ExportFormat::Raw => "raw",
            ExportFormat::Ami => "ami",
            ExportFormat::Tar => "tar",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested disk-image export.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootcExport {
    #[serde(rename = "type")]
    pub format: ExportFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

impl BootcExport {
    /// Architecture with the platform default applied.
    pub fn architecture_or_default(&self) -> &str {
        self.architecture.as_deref().unwrap_or("x86_64")
    }
}

/// Credentials for a container registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// Destination registry for the built container image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerRegistry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<RegistryCredentials>,
}

/// A user baked into the image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildUser {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
}

/// A file written into the image at build time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildFile {
    pub path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// A script written into the image and executed during the build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildScript {
    pub path: String,
    pub content: String,
}

/// A systemd unit installed into the image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemdUnit {
    pub name: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Image customizations applied on top of the base image.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Customizations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<BuildUser>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<BuildFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<BuildScript>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub systemd_units: Vec<SystemdUnit>,
    /// SSH keys authorized for root.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_epel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_podman: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub copr_repos: Vec<String>,
}

/// Enrollment endpoint overrides supplied by the user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentService {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_ui_endpoint: Option<String>,
}

/// TPM settings for the device agent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TpmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_file_path: Option<String>,
}

/// Device-agent configuration baked into the image. Its presence triggers
/// enrollment certificate issuance during the build.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_enrollment_service: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrollment_service: Option<EnrollmentService>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_fetch_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_update_interval: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_info: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_info_custom: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_info_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpm: Option<TpmConfig>,
}

/// Desired state of a build. Immutable once created.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildSpec {
    pub base_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customizations: Option<Customizations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<AgentConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_registry: Option<ContainerRegistry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_registry_credentials: Option<RegistryCredentials>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_to_registry: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootc_exports: Option<Vec<BootcExport>>,
}

impl ImageBuildSpec {
    pub fn exports(&self) -> &[BootcExport] {
        self.bootc_exports.as_deref().unwrap_or(&[])
    }

    pub fn has_destination_credentials(&self) -> bool {
        self.container_registry
            .as_ref()
            .and_then(|r| r.credentials.as_ref())
            .is_some()
    }
}

/// Reference to a stored disk image on the status subresource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootcImageRef {
    #[serde(rename = "type")]
    pub format: ExportFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub storage_ref: String,
}

/// Reported state of a build.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuildStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_image_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootc_image_refs: Option<Vec<BootcImageRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Harvested pod logs; attached only on failure or cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
}

/// The unit of work the engine reconciles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuild {
    #[serde(default)]
    pub metadata: ResourceMeta,
    pub spec: ImageBuildSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ImageBuildStatus>,
}

impl ImageBuild {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// True when the named annotation is present with value `"true"`.
    pub fn annotation_is_true(&self, key: &str) -> bool {
        self.metadata
            .annotations
            .get(key)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn status_mut(&mut self) -> &mut ImageBuildStatus {
        self.status.get_or_insert_with(ImageBuildStatus::default)
    }
}

/// One JSON-patch operation against a catalog resource. Annotation mutations
/// go through patches so concurrent user edits are never clobbered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

impl PatchOp {
    /// `remove` of an annotation; `/` inside the key is escaped as `~1` per
    /// RFC 6901.
    pub fn remove_annotation(key: &str) -> Self {
        let escaped = key.replace('~', "~0").replace('/', "~1");
        PatchOp {
            op: "remove".to_string(),
            path: format!("/metadata/annotations/{escaped}"),
            value: None,
        }
    }
}
