//! Per-kind health evaluation of live workload objects.
//!
//! Kinds are looked up in a [`KindRegistry`] rather than matched in a central
//! conditional; supporting another kind means registering a
//! [`KindCapability`] for it.

use std::collections::HashMap;

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::debug;

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::model::StatusType;

use super::helpers::{object_gvk, object_kind, object_namespace};

/// Health check run against the live copy of an object.
pub type HealthCheck = fn(&DynamicObject) -> Result<()>;

/// What the agent knows how to do with one kind.
#[derive(Clone, Copy)]
pub struct KindCapability {
    pub health: Option<HealthCheck>,
    /// Whether a pod-template annotation bump restarts it.
    pub restartable: bool,
}

/// Kind name → capability.
pub struct KindRegistry {
    kinds: HashMap<String, KindCapability>,
}

impl Default for KindRegistry {
    fn default() -> Self {
        Self::empty()
            .register(
                "Deployment",
                KindCapability {
                    health: Some(replica_health),
                    restartable: true,
                },
            )
            .register(
                "StatefulSet",
                KindCapability {
                    health: Some(replica_health),
                    restartable: true,
                },
            )
            .register(
                "DaemonSet",
                KindCapability {
                    health: Some(daemonset_health),
                    restartable: true,
                },
            )
    }
}

impl KindRegistry {
    /// A registry that knows no kinds.
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    pub fn register(mut self, kind: &str, capability: KindCapability) -> Self {
        self.kinds.insert(kind.to_string(), capability);
        self
    }

    pub fn capability(&self, kind: &str) -> Option<&KindCapability> {
        self.kinds.get(kind)
    }

    pub fn is_restartable(&self, kind: &str) -> bool {
        self.capability(kind).is_some_and(|c| c.restartable)
    }

    /// Run the kind's health check on `obj`. Unknown kinds are healthy.
    pub fn check(&self, obj: &DynamicObject) -> Result<()> {
        match self.capability(object_kind(obj)).and_then(|c| c.health) {
            Some(health) => health(obj),
            None => Ok(()),
        }
    }
}

// ── Health checks ─────────────────────────────────────────────────────────────

fn int_field(obj: &DynamicObject, pointer: &str) -> Option<i64> {
    obj.data.pointer(pointer).and_then(|v| v.as_i64())
}

fn unhealthy(obj: &DynamicObject, reason: String) -> Error {
    Error::Health {
        kind: object_kind(obj).to_string(),
        name: obj.name_any(),
        reason,
    }
}

/// Unhealthy while fewer replicas are ready than `spec.replicas` (default 1).
/// Serves both Deployments and StatefulSets, which share these status fields.
pub fn replica_health(obj: &DynamicObject) -> Result<()> {
    let desired = int_field(obj, "/spec/replicas").unwrap_or(1);
    let ready = int_field(obj, "/status/readyReplicas").unwrap_or(0);
    if ready < desired {
        return Err(unhealthy(obj, format!("{ready} of {desired} replicas ready")));
    }
    Ok(())
}

/// Unhealthy while any daemon pod is reported unavailable.
pub fn daemonset_health(obj: &DynamicObject) -> Result<()> {
    let unavailable = int_field(obj, "/status/numberUnavailable").unwrap_or(0);
    if unavailable > 0 {
        return Err(unhealthy(obj, format!("{unavailable} pods unavailable")));
    }
    Ok(())
}

// ── Evaluation against the cluster ────────────────────────────────────────────

/// Fetch the live copy of a rendered object and check its health. The object
/// is looked up in the namespace it names, `namespace` otherwise.
pub async fn evaluate(
    cluster: &dyn Cluster,
    kinds: &KindRegistry,
    namespace: &str,
    obj: &DynamicObject,
) -> Result<()> {
    if kinds.capability(object_kind(obj)).and_then(|c| c.health).is_none() {
        return Ok(());
    }
    let kind = cluster.resolve(&object_gvk(obj)?).await?;
    let name = obj.name_any();
    let namespace = object_namespace(obj, namespace);
    let live = cluster
        .get(&kind, kind.scope(namespace), &name)
        .await?
        .ok_or_else(|| unhealthy(obj, "not found".to_string()))?;
    kinds.check(&live)?;
    debug!(%namespace, kind = %object_kind(obj), %name, "healthy");
    Ok(())
}

/// Health of a whole release, reduced to a status line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthVerdict {
    pub status: StatusType,
    pub message: String,
}

impl HealthVerdict {
    pub fn healthy(&self) -> bool {
        self.status == StatusType::Ok
    }
}

/// Reduce per-object results: failed health checks mean the release is still
/// progressing; any other failure is an error.
pub fn verdict(results: Vec<Result<()>>) -> HealthVerdict {
    let errors: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    if errors.is_empty() {
        return HealthVerdict {
            status: StatusType::Ok,
            message: "all resources healthy".to_string(),
        };
    }
    let status = if errors.iter().all(|e| matches!(e, Error::Health { .. })) {
        StatusType::Progressing
    } else {
        StatusType::Error
    };
    let message = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    HealthVerdict { status, message }
}
