//! Cluster resource naming for build-owned objects.

use imagebuilder_core::{ExportFormat, APP_LABEL_VALUE, IMAGEBUILD_LABEL};

use std::collections::BTreeMap;

/// Prefix of container-build job names.
pub const BUILD_JOB_PREFIX: &str = "build-";
/// Prefix of disk-image job names.
pub const BOOTC_JOB_PREFIX: &str = "bootc-";
/// Prefix of containerfile configmap names.
pub const CONTAINERFILE_PREFIX: &str = "containerfile-";

pub fn build_job_name(build: &str) -> String {
    format!("{BUILD_JOB_PREFIX}{build}")
}

pub fn bootc_job_name(build: &str, format: ExportFormat) -> String {
    format!("{BOOTC_JOB_PREFIX}{build}-{format}")
}

pub fn containerfile_config_map_name(build: &str) -> String {
    format!("{CONTAINERFILE_PREFIX}{build}")
}

pub fn registry_secret_name(build: &str) -> String {
    format!("registry-{build}")
}

pub fn base_registry_secret_name(build: &str) -> String {
    format!("base-registry-{build}")
}

/// Label selector matching every resource owned by a build.
pub fn imagebuild_selector(build: &str) -> String {
    format!("{IMAGEBUILD_LABEL}={build}")
}

/// Label selector for the pods of one job.
pub fn job_pod_selector(job_name: &str) -> String {
    format!("job-name={job_name}")
}

/// Labels stamped on every resource the engine materializes.
pub fn owned_labels(build: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_LABEL_VALUE.to_string()),
        (IMAGEBUILD_LABEL.to_string(), build.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_ownership_convention() {
        assert_eq!(build_job_name("b1"), "build-b1");
        assert_eq!(bootc_job_name("b1", ExportFormat::Qcow2), "bootc-b1-qcow2");
        assert_eq!(containerfile_config_map_name("b1"), "containerfile-b1");
        assert_eq!(registry_secret_name("b1"), "registry-b1");
        assert_eq!(base_registry_secret_name("b1"), "base-registry-b1");
        assert_eq!(imagebuild_selector("b1"), "imagebuild=b1");
        assert_eq!(job_pod_selector("build-b1"), "job-name=build-b1");
    }
}
