//! Shared helpers for controller modules.
//!
//! Object identity (GVK parsing, log labels), the JSON merge-patch
//! primitives used by the restart path and the in-memory cluster, and the
//! bounded fan-out shared by the applier and restart loops. Pure naming
//! helpers live in `crate::helpers` instead.

use std::future::Future;

use futures::stream::{self, StreamExt};
use kube::api::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Field manager name sent with every write this agent makes.
pub const FIELD_MANAGER: &str = "release-agent";

/// Pod-template annotation bumped to force a rolling restart (same key kubectl uses).
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Split an `apiVersion` into `(group, version)`; the core group is `""`.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Group/version/kind of a decoded object.
pub fn object_gvk(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj.types.as_ref().ok_or_else(|| {
        Error::config(format!("object {} has no apiVersion/kind", obj.name_any()))
    })?;
    let (group, version) = split_api_version(&types.api_version);
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

/// Kind of a decoded object, or `"Unknown"` when the type meta is missing.
pub fn object_kind(obj: &DynamicObject) -> &str {
    obj.types
        .as_ref()
        .map(|t| t.kind.as_str())
        .unwrap_or("Unknown")
}

/// Namespace a rendered object belongs in: the one it names, else `default`.
pub fn object_namespace<'a>(obj: &'a DynamicObject, default: &'a str) -> &'a str {
    obj.metadata.namespace.as_deref().unwrap_or(default)
}

/// `Kind/name` label used in logs.
pub fn object_label(obj: &DynamicObject) -> String {
    format!("{}/{}", object_kind(obj), obj.name_any())
}

// ── Merge patches ─────────────────────────────────────────────────────────────

/// Compute the patch that turns `original` into `modified`.
///
/// Maps are diffed key by key; a key missing from `modified` becomes `null`.
/// Any other value that differs is replaced wholesale, which matches strategic
/// merge semantics for everything a restart touches (annotation maps).
pub fn two_way_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(orig), Value::Object(modi)) => Value::Object(diff_maps(orig, modi)),
        _ if original == modified => Value::Object(Map::new()),
        _ => modified.clone(),
    }
}

fn diff_maps(orig: &Map<String, Value>, modi: &Map<String, Value>) -> Map<String, Value> {
    let mut patch = Map::new();
    for (key, new) in modi {
        match (orig.get(key), new) {
            (Some(old), new) if old == new => {}
            (Some(Value::Object(old)), Value::Object(new)) => {
                let nested = diff_maps(old, new);
                if !nested.is_empty() {
                    patch.insert(key.clone(), Value::Object(nested));
                }
            }
            _ => {
                patch.insert(key.clone(), new.clone());
            }
        }
    }
    for key in orig.keys() {
        if !modi.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    patch
}

/// True when a patch produced by [`two_way_merge_patch`] changes nothing.
pub fn is_empty_patch(patch: &Value) -> bool {
    patch.as_object().is_some_and(|m| m.is_empty())
}

/// Apply a JSON merge patch (RFC 7386) to `target` in place.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else { return };
    for (key, value) in patch {
        if value.is_null() {
            map.remove(key);
        } else {
            apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

// ── Bounded fan-out ───────────────────────────────────────────────────────────

/// Run `f` over every item with at most `limit` in flight. Every item is
/// attempted; failures are joined in input order.
pub async fn join_bounded<'a, T, F, Fut>(items: &'a [T], limit: usize, f: F) -> Result<()>
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = Result<()>> + 'a,
{
    let mut results: Vec<(usize, Result<()>)> = stream::iter(items.iter().enumerate())
        .map(|(index, item)| {
            let fut = f(item);
            async move { (index, fut.await) }
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;
    results.sort_by_key(|(index, _)| *index);
    Error::join(results.into_iter().filter_map(|(_, r)| r.err()).collect())
}
