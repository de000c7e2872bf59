//! Registry URL normalization and image reference construction.

use chrono::{DateTime, Utc};

use imagebuilder_core::ImageBuild;

/// Registry assumed when the spec names none.
pub const DEFAULT_REGISTRY: &str = "localhost:5000";
/// Registry implied by short image references.
pub const DOCKER_HUB_REGISTRY: &str = "docker.io";

/// Strip `http(s)://` prefixes and any trailing slash from a registry URL.
pub fn normalize_registry_url(url: &str) -> String {
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    url.trim_end_matches('/').to_string()
}

/// Normalized destination registry for a build, falling back to
/// [`DEFAULT_REGISTRY`].
pub fn registry_url(build: &ImageBuild) -> String {
    match build
        .spec
        .container_registry
        .as_ref()
        .and_then(|r| r.url.as_deref())
        .filter(|u| !u.is_empty())
    {
        Some(url) => normalize_registry_url(url),
        None => DEFAULT_REGISTRY.to_string(),
    }
}

/// Registry portion of an arbitrary image reference. A first path segment
/// containing `.`, `:`, or equal to `localhost` is a registry host; anything
/// else (short names, org/name pairs) resolves to Docker Hub.
pub fn base_image_registry(image_ref: &str) -> String {
    let without_digest = image_ref.split('@').next().unwrap_or(image_ref);
    let mut parts = without_digest.split('/');
    let first = parts.next().unwrap_or_default();
    if parts.next().is_none() {
        return DOCKER_HUB_REGISTRY.to_string();
    }
    if first.contains('.') || first.contains(':') || first.eq_ignore_ascii_case("localhost") {
        first.to_string()
    } else {
        DOCKER_HUB_REGISTRY.to_string()
    }
}

/// Whether an image reference already names its registry.
pub fn is_full_image_reference(image_ref: &str) -> bool {
    let mut parts = image_ref.split('/');
    let first = parts.next().unwrap_or_default();
    parts.next().is_some()
        && (first.contains('.') || first.contains(':') || first.eq_ignore_ascii_case("localhost"))
}

/// Full image reference for a build.
///
/// A registry URL with a path component is treated as a complete image name
/// and used as-is when it already carries a tag after its last slash;
/// otherwise a timestamp tag derived from the resource's creation time is
/// appended. A bare host becomes `<host>/<name>:<tag>`; no URL at all yields
/// `<name>:<tag>`.
pub fn image_reference(build: &ImageBuild) -> String {
    let tag = timestamp_tag(build.metadata.creation_timestamp.as_ref());

    if let Some(url) = build
        .spec
        .container_registry
        .as_ref()
        .and_then(|r| r.url.as_deref())
        .filter(|u| !u.is_empty())
    {
        let url = normalize_registry_url(url);
        if url.contains('/') {
            if has_tag_after_last_slash(&url) {
                return url;
            }
            return format!("{url}:{tag}");
        }
        return format!("{url}/{}:{tag}", build.name());
    }

    format!("{}:{tag}", build.name())
}

fn has_tag_after_last_slash(image: &str) -> bool {
    match (image.rfind(':'), image.rfind('/')) {
        (Some(colon), Some(slash)) => colon > slash,
        _ => false,
    }
}

fn timestamp_tag(created: Option<&DateTime<Utc>>) -> String {
    match created {
        Some(ts) => ts.format("%Y%m%d-%H%M%S").to_string(),
        None => "latest".to_string(),
    }
}
