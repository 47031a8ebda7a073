//! Idempotent get-then-create-or-update of rendered objects.
//!
//! Each object is resolved to its REST resource through discovery, looked up
//! by name, then created when absent or replaced when present. The replace
//! carries the live `resourceVersion`, so an edit made between the read and
//! the write is rejected with a conflict rather than overwritten.

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::debug;

use crate::cluster::Cluster;
use crate::error::{Error, Result};

use super::helpers::{join_bounded, object_gvk, object_kind, object_namespace};

/// Apply every object, at most `concurrency` at a time. All objects are
/// attempted; failures come back joined, in input order.
pub async fn apply(
    cluster: &dyn Cluster,
    namespace: &str,
    objects: &[DynamicObject],
    concurrency: usize,
) -> Result<()> {
    join_bounded(objects, concurrency, |obj| async move {
        apply_one(cluster, namespace, obj)
            .await
            .map(|_| ())
            .map_err(|e| Error::apply(object_kind(obj), obj.name_any(), e))
    })
    .await
}

/// Create or replace a single object and return what the API server stored.
pub async fn apply_one(
    cluster: &dyn Cluster,
    namespace: &str,
    obj: &DynamicObject,
) -> Result<DynamicObject> {
    let kind = cluster.resolve(&object_gvk(obj)?).await?;
    let name = obj.name_any();

    let mut desired = obj.clone();
    desired.metadata.namespace = if kind.namespaced {
        Some(object_namespace(obj, namespace).to_string())
    } else {
        None
    };
    let scope = desired.metadata.namespace.clone();

    match cluster.get(&kind, scope.as_deref(), &name).await? {
        None => {
            debug!(namespace = ?scope, kind = %object_kind(obj), %name, "creating");
            cluster.create(&kind, scope.as_deref(), &desired).await
        }
        Some(live) => {
            debug!(namespace = ?scope, kind = %object_kind(obj), %name, "updating");
            desired.metadata.resource_version = live.metadata.resource_version;
            cluster.update(&kind, scope.as_deref(), &desired).await
        }
    }
}
