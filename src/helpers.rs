use chrono::{SecondsFormat, Utc};

/// Prefix shared by every revision-record storage key.
pub const REVISION_KEY_PREFIX: &str = "agent.release.v1";

/// Current UTC time as RFC 3339 with second precision, the format kubectl
/// writes into `restartedAt` annotations.
pub fn utc_now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ── Naming helpers ────────────────────────────────────────────────────────────

/// Storage key of the revision record for a release: `"<prefix>.<releaseName>"`.
pub fn revision_storage_key(release_name: &str) -> String {
    format!("{REVISION_KEY_PREFIX}.{release_name}")
}

/// Inverse of [`revision_storage_key`]. `None` for keys this agent did not write.
pub fn release_name_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(REVISION_KEY_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|name| !name.is_empty())
}

/// Name of the image pull secret injected into a release's values.
pub fn pull_secret_name(release_name: &str) -> String {
    format!("{release_name}-registry-auth")
}

/// Host part of a registry or repository reference, without scheme or path.
///
/// `oci://ghcr.io/acme/charts/app` → `ghcr.io`
pub fn registry_host(reference: &str) -> &str {
    let rest = reference
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(reference);
    rest.split('/').next().unwrap_or(rest)
}
