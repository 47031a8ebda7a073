//! Data exchanged with the control plane and persisted by the agent.
//!
//! Desired state arrives as [`AgentResource`] / [`DeploymentSpec`]; what is
//! actually running is tracked as a [`RevisionRecord`]. Rendered manifests are
//! decoded into `DynamicObject`s only for the duration of one operation.

use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── Desired state ─────────────────────────────────────────────────────────────

/// Everything the control plane wants running in the agent's namespace.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResource {
    pub namespace: String,
    #[serde(default)]
    pub deployments: Vec<ReleaseDescriptor>,
}

/// One release the control plane wants installed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDescriptor {
    pub deployment_id: String,
    pub revision_id: String,
    pub release_name: String,
    pub chart_url: String,
    pub chart_name: String,
    pub chart_version: String,
    #[serde(default)]
    pub values: serde_json::Value,
    #[serde(default)]
    pub force_restart: bool,
}

/// Input to a single reconciliation. A spec without a release descriptor
/// carries no chart and can only be used for read-only or removal work.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseDescriptor>,
}

impl DeploymentSpec {
    pub fn new(namespace: impl Into<String>, release: ReleaseDescriptor) -> Self {
        Self {
            namespace: namespace.into(),
            release: Some(release),
        }
    }

    /// The release descriptor, or a config error naming the namespace.
    pub fn release(&self) -> Result<&ReleaseDescriptor> {
        self.release.as_ref().ok_or_else(|| {
            Error::config(format!(
                "deployment spec for namespace {} has no release",
                self.namespace
            ))
        })
    }

    pub fn release_mut(&mut self) -> Result<&mut ReleaseDescriptor> {
        let ns = &self.namespace;
        self.release.as_mut().ok_or_else(|| {
            Error::config(format!("deployment spec for namespace {ns} has no release"))
        })
    }
}

// ── Revision record ───────────────────────────────────────────────────────────

/// Identity of the release revision currently installed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevisionRecord {
    pub release_name: String,
    pub revision_id: String,
    pub package_manager_revision: u32,
    #[serde(default)]
    pub deployment_id: String,
}

/// Current version of the stored record payload.
pub const REVISION_RECORD_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct VersionedRecord {
    version: u32,
    #[serde(flatten)]
    record: RevisionRecord,
}

impl RevisionRecord {
    /// Encode as the versioned JSON payload written to storage.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&VersionedRecord {
            version: REVISION_RECORD_VERSION,
            record: self.clone(),
        })?)
    }

    /// Decode a stored payload, rejecting versions this agent does not know.
    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        let stored: VersionedRecord = serde_json::from_slice(bytes)?;
        if stored.version != REVISION_RECORD_VERSION {
            return Err(Error::config(format!(
                "revision record for {} has unsupported version {}",
                stored.record.release_name, stored.version
            )));
        }
        Ok(stored.record)
    }
}

// ── Status reporting ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    Ok,
    Progressing,
    Error,
}

/// Status line sent upstream for a desired-state revision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub revision_id: String,
    #[serde(rename = "type")]
    pub status_type: StatusType,
    pub message: String,
}

// ── Rendered manifests ────────────────────────────────────────────────────────

/// Decode a multi-document YAML manifest into dynamic objects.
///
/// Empty documents (helm emits them for templates that render nothing) are
/// skipped. A document without `apiVersion`, `kind` or `metadata.name` is an
/// error that names its position.
pub fn decode_manifest(manifest: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(manifest).enumerate() {
        let value = serde_yaml::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        let value: serde_json::Value = serde_json::to_value(value)?;
        for field in ["/apiVersion", "/kind", "/metadata/name"] {
            if value.pointer(field).and_then(|v| v.as_str()).is_none() {
                return Err(Error::config(format!(
                    "manifest document {index} is missing {}",
                    field[1..].replace('/', ".")
                )));
            }
        }
        objects.push(serde_json::from_value(value)?);
    }
    Ok(objects)
}
