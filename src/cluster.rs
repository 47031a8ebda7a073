//! Dynamic access to cluster objects by group/version/kind.
//!
//! [`Cluster`] is the seam between the controller modules and the API server:
//! [`KubeCluster`] resolves kinds through discovery (cached for the process
//! lifetime) and talks to the API server; [`InMemoryCluster`] keeps objects in
//! a map so reconciliation can be exercised without a cluster. Its `patch`
//! applies a plain JSON merge, which matches strategic merge only for the map
//! fields the agent patches; `tests/integration/kube_backed.rs` covers the
//! real API server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams,
    PostParams,
};
use kube::core::ErrorResponse;
use kube::discovery::{self, Scope};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

use crate::controller::helpers::{apply_merge_patch, object_gvk, split_api_version, FIELD_MANAGER};
use crate::error::{Error, Result};

/// A kind resolved to its REST endpoint.
#[derive(Clone, Debug)]
pub struct ResolvedKind {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

impl ResolvedKind {
    /// Namespace to address an object of this kind in: the target namespace for
    /// namespaced kinds, none for cluster-scoped ones.
    pub fn scope<'a>(&self, namespace: &'a str) -> Option<&'a str> {
        self.namespaced.then_some(namespace)
    }
}

/// Trait abstracting dynamic object access so tests can substitute an in-memory cluster.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Map a group/version/kind to its REST resource.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind>;

    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    async fn create(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Replace an existing object.
    async fn update(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Send a strategic merge patch.
    async fn patch(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject>;

    /// Delete an object. One that is already gone is not an error.
    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<()>;
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
}

// ── Production implementation ─────────────────────────────────────────────────

/// Production implementation backed by kube-rs dynamic APIs.
pub struct KubeCluster {
    client: Client,
    mappings: Mutex<HashMap<String, ResolvedKind>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            mappings: Mutex::new(HashMap::new()),
        }
    }

    fn api(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if kind.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &kind.api_resource)
            }
            _ => Api::all_with(self.client.clone(), &kind.api_resource),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind> {
        let key = gvk_key(gvk);
        let cached = self.lock_mappings().get(&key).cloned();
        if let Some(kind) = cached {
            return Ok(kind);
        }

        let (api_resource, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        let kind = ResolvedKind {
            api_resource,
            namespaced: matches!(caps.scope, Scope::Namespaced),
        };
        debug!(%key, plural = %kind.api_resource.plural, "resolved kind");
        self.lock_mappings().insert(key, kind.clone());
        Ok(kind)
    }

    async fn get(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(kind, namespace).get_opt(name).await?)
    }

    async fn create(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(kind, namespace)
            .create(&Self::post_params(), obj)
            .await?)
    }

    async fn update(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        Ok(self
            .api(kind, namespace)
            .replace(&obj.name_any(), &Self::post_params(), obj)
            .await?)
    }

    async fn patch(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self
            .api(kind, namespace)
            .patch(name, &params, &Patch::Strategic(patch))
            .await?)
    }

    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<()> {
        match self
            .api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(%name, "already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl KubeCluster {
    fn lock_mappings(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResolvedKind>> {
        self.mappings.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── In-memory implementation ──────────────────────────────────────────────────

/// Operations on [`InMemoryCluster`] that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    Get,
    Create,
    Update,
    Patch,
    Delete,
}

/// Kinds the in-memory cluster treats as cluster-scoped.
const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
];

type ObjectKey = (String, String, String);

#[derive(Default)]
struct InMemoryState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    unknown_kinds: HashSet<String>,
    failures: HashSet<(ClusterOp, String)>,
    patches: Vec<(String, Value)>,
    writes: usize,
    next_version: u64,
}

/// In-memory cluster for tests. Objects are keyed by plural resource,
/// namespace and name; every write bumps `resourceVersion`.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<InMemoryState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `resolve` fail for a kind, as discovery does for kinds the API
    /// server does not serve.
    pub fn forget_kind(&self, kind: &str) {
        self.lock().unknown_kinds.insert(kind.to_string());
    }

    /// Make every `op` against the object called `name` fail.
    pub fn fail_on(&self, op: ClusterOp, name: &str) {
        self.lock().failures.insert((op, name.to_string()));
    }

    /// Store an object as-is (e.g. with a populated status), bypassing failures.
    pub fn insert(&self, namespace: &str, obj: DynamicObject) -> Result<()> {
        let gvk = object_gvk(&obj)?;
        let kind = local_resolve(&gvk);
        let key = object_key(&kind, kind.scope(namespace), &obj.name_any());
        let mut state = self.lock();
        let obj = stamp(&mut state, obj, kind.scope(namespace));
        state.objects.insert(key, obj);
        Ok(())
    }

    /// Look an object up by kind and name.
    pub fn object(
        &self,
        api_version: &str,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Option<DynamicObject> {
        let (group, version) = split_api_version(api_version);
        let resolved = local_resolve(&GroupVersionKind::gvk(group, version, kind));
        let key = object_key(&resolved, resolved.scope(namespace), name);
        self.lock().objects.get(&key).cloned()
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of successful create/update/patch calls.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Names and bodies of every successful patch, in order.
    pub fn patches(&self) -> Vec<(String, Value)> {
        self.lock().patches.clone()
    }

    fn check(&self, op: ClusterOp, name: &str) -> Result<()> {
        if self.lock().failures.contains(&(op, name.to_string())) {
            return Err(api_error(500, "InternalError", format!("{op:?} {name} rejected")));
        }
        Ok(())
    }
}

fn local_resolve(gvk: &GroupVersionKind) -> ResolvedKind {
    ResolvedKind {
        api_resource: ApiResource::from_gvk(gvk),
        namespaced: !CLUSTER_SCOPED.contains(&gvk.kind.as_str()),
    }
}

fn object_key(kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> ObjectKey {
    let ar = &kind.api_resource;
    (
        format!("{}/{}", ar.api_version, ar.plural),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn stamp(state: &mut InMemoryState, mut obj: DynamicObject, namespace: Option<&str>) -> DynamicObject {
    state.next_version += 1;
    obj.metadata.resource_version = Some(state.next_version.to_string());
    obj.metadata.namespace = namespace.map(str::to_string);
    obj
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

#[async_trait::async_trait]
impl Cluster for InMemoryCluster {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind> {
        if self.lock().unknown_kinds.contains(&gvk.kind) {
            return Err(Error::NotFound(format!(
                "no API resource serves {}",
                gvk_key(gvk)
            )));
        }
        Ok(local_resolve(gvk))
    }

    async fn get(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.check(ClusterOp::Get, name)?;
        let key = object_key(kind, namespace, name);
        Ok(self.lock().objects.get(&key).cloned())
    }

    async fn create(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = obj.name_any();
        self.check(ClusterOp::Create, &name)?;
        let key = object_key(kind, namespace, &name);
        let mut state = self.lock();
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }
        let stored = stamp(&mut state, obj.clone(), namespace);
        state.objects.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn update(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let name = obj.name_any();
        self.check(ClusterOp::Update, &name)?;
        let key = object_key(kind, namespace, &name);
        let mut state = self.lock();
        let Some(current) = state.objects.get(&key) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        if obj.metadata.resource_version.is_some()
            && obj.metadata.resource_version != current.metadata.resource_version
        {
            return Err(api_error(409, "Conflict", format!("{name} has been modified")));
        }
        let stored = stamp(&mut state, obj.clone(), namespace);
        state.objects.insert(key, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn patch(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<DynamicObject> {
        self.check(ClusterOp::Patch, name)?;
        let key = object_key(kind, namespace, name);
        let mut state = self.lock();
        let Some(current) = state.objects.get(&key) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        let mut value = serde_json::to_value(current)?;
        apply_merge_patch(&mut value, patch);
        let patched: DynamicObject = serde_json::from_value(value)?;
        let stored = stamp(&mut state, patched, namespace);
        state.objects.insert(key, stored.clone());
        state.patches.push((name.to_string(), patch.clone()));
        state.writes += 1;
        Ok(stored)
    }

    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<()> {
        self.check(ClusterOp::Delete, name)?;
        let key = object_key(kind, namespace, name);
        let mut state = self.lock();
        if state.objects.remove(&key).is_some() {
            state.writes += 1;
        }
        Ok(())
    }
}
