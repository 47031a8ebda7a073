//! Forced rolling restart of a release's workloads.
//!
//! For each restartable object in the release manifest, the pod-template
//! `restartedAt` annotation is bumped on a copy, the two-way merge patch
//! between original and copy is computed, and that patch is sent to the API
//! server. One object failing never stops the others.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::controller::actions::ActionContext;
use crate::error::{Error, Result};
use crate::helm::PackageManager;
use crate::helpers::utc_now_rfc3339;
use crate::model::decode_manifest;

use super::helpers::{
    is_empty_patch, join_bounded, object_gvk, object_kind, object_label, object_namespace,
    two_way_merge_patch, RESTARTED_AT_ANNOTATION,
};
use super::status::KindRegistry;

/// Set the restart annotation on the pod template of an encoded object.
/// `None` when the object has no pod template to annotate.
fn mark_restarted(encoded: &Value, restarted_at: &str) -> Option<Value> {
    let mut modified = encoded.clone();
    let template = modified.pointer_mut("/spec/template")?.as_object_mut()?;
    let metadata = template
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    let annotations = metadata
        .as_object_mut()?
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if !annotations.is_object() {
        *annotations = Value::Object(Map::new());
    }
    annotations.as_object_mut()?.insert(
        RESTARTED_AT_ANNOTATION.to_string(),
        Value::String(restarted_at.to_string()),
    );
    Some(modified)
}

/// Patch that restarts `obj`, or `None` when there is nothing to send
/// (no pod template, or the annotation already has this value).
pub fn restart_patch(obj: &DynamicObject, restarted_at: &str) -> Result<Option<Value>> {
    let original = serde_json::to_value(obj)?;
    let Some(modified) = mark_restarted(&original, restarted_at) else {
        return Ok(None);
    };
    let patch = two_way_merge_patch(&original, &modified);
    Ok((!is_empty_patch(&patch)).then_some(patch))
}

async fn restart_one(
    cluster: &dyn Cluster,
    kinds: &KindRegistry,
    namespace: &str,
    obj: &DynamicObject,
    restarted_at: &str,
) -> Result<()> {
    let label = object_label(obj);
    if !kinds.is_restartable(object_kind(obj)) {
        debug!(%namespace, object = %label, "kind does not restart, skipping");
        return Ok(());
    }
    let patch = match restart_patch(obj, restarted_at) {
        Ok(Some(patch)) => patch,
        Ok(None) => {
            warn!(%namespace, object = %label, "no pod template to annotate, skipping");
            return Ok(());
        }
        Err(e) => {
            warn!(%namespace, object = %label, error = %e, "cannot encode object, skipping");
            return Ok(());
        }
    };

    let wrap = |e: Error| Error::apply(object_kind(obj), obj.name_any(), e);
    let namespace = object_namespace(obj, namespace);
    let kind = cluster.resolve(&object_gvk(obj).map_err(wrap)?).await.map_err(wrap)?;
    cluster
        .patch(&kind, kind.scope(namespace), &obj.name_any(), &patch)
        .await
        .map_err(wrap)?;
    debug!(%namespace, object = %label, "restart patch applied");
    Ok(())
}

/// Restart every restartable object in `objects`, at most `concurrency` at a
/// time. Patch failures are collected and returned together.
pub async fn restart_objects(
    cluster: &dyn Cluster,
    kinds: &KindRegistry,
    namespace: &str,
    objects: &[DynamicObject],
    concurrency: usize,
) -> Result<()> {
    let restarted_at = utc_now_rfc3339();
    let restarted_at = restarted_at.as_str();
    join_bounded(objects, concurrency, |obj| {
        restart_one(cluster, kinds, namespace, obj, restarted_at)
    })
    .await
}

/// Force a rolling restart of everything the release's current revision
/// rendered.
pub async fn force_restart(
    cluster: &dyn Cluster,
    helm: &dyn PackageManager,
    kinds: &KindRegistry,
    ctx: &ActionContext,
    release_name: &str,
    concurrency: usize,
) -> Result<()> {
    let namespace = ctx.namespace();
    let manifest = helm.manifest(ctx, release_name).await?;
    let objects = decode_manifest(&manifest)?;
    info!(%namespace, release = %release_name, objects = objects.len(), "forcing restart");
    restart_objects(cluster, kinds, namespace, &objects, concurrency).await
}
