//! Shared test harness for reconciler integration tests.
//!
//! Every test builds its own [`Harness`]: an in-memory cluster, package
//! manager, revision store and control plane wired into a reconciler
//! `Context`, so tests can run in parallel without sharing state.
//!
//! Tests of the kube-backed implementations share one envtest API server
//! instead; each gets its own namespaces for isolation. There is no kubelet
//! or scheduler in envtest, so workload status never changes on its own.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use envtest::Environment;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DynamicObject, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use release_agent::cluster::InMemoryCluster;
use release_agent::control_plane::{RecordingControlPlane, RegistryCredentials, StaticRegistryAuth};
use release_agent::controller::actions::ActionFactory;
use release_agent::controller::reconciler::Context;
use release_agent::controller::status::KindRegistry;
use release_agent::helm::InMemoryPackageManager;
use release_agent::model::ReleaseDescriptor;
use release_agent::revision_store::InMemoryRevisionStore;

pub const NS: &str = "shop";

/// What the `web` chart renders: one Deployment and one Service.
pub const WEB_MANIFEST: &str = r#"---
# Source: web/templates/deployment.yaml
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 2
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: registry.example.com/web:1.0.0
---
# Source: web/templates/service.yaml
apiVersion: v1
kind: Service
metadata:
  name: web
spec:
  ports:
    - port: 80
"#;

pub struct Harness {
    pub cluster: Arc<InMemoryCluster>,
    pub helm: Arc<InMemoryPackageManager>,
    pub store: Arc<InMemoryRevisionStore>,
    pub control_plane: Arc<RecordingControlPlane>,
    pub auth: Arc<StaticRegistryAuth>,
    pub ctx: Context,
}

impl Harness {
    /// Harness whose charts are public.
    pub fn new() -> Self {
        Self::with_auth(StaticRegistryAuth::public())
    }

    pub fn with_auth(auth: StaticRegistryAuth) -> Self {
        let cluster = Arc::new(InMemoryCluster::new());
        let helm = Arc::new(InMemoryPackageManager::new().with_chart("web", WEB_MANIFEST));
        let store = Arc::new(InMemoryRevisionStore::new());
        let control_plane = Arc::new(RecordingControlPlane::new());
        let auth = Arc::new(auth);
        let ctx = Context {
            cluster: cluster.clone(),
            helm: helm.clone(),
            store: store.clone(),
            control_plane: control_plane.clone(),
            actions: ActionFactory::new(
                std::env::temp_dir().join("release-agent-tests"),
                false,
                auth.clone(),
            ),
            kinds: KindRegistry::default(),
            apply_concurrency: 4,
        };
        Self {
            cluster,
            helm,
            store,
            control_plane,
            auth,
            ctx,
        }
    }
}

/// Desired release of the `web` chart from an OCI registry.
pub fn descriptor(release_name: &str, revision_id: &str) -> ReleaseDescriptor {
    ReleaseDescriptor {
        deployment_id: format!("dep-{release_name}"),
        revision_id: revision_id.to_string(),
        release_name: release_name.to_string(),
        chart_url: "oci://registry.example.com/charts".to_string(),
        chart_name: "web".to_string(),
        chart_version: "1.0.0".to_string(),
        values: json!({
            "replicaCount": 2,
            "imagePullSecrets": [],
        }),
        force_restart: false,
    }
}

pub fn credentials() -> RegistryCredentials {
    RegistryCredentials {
        host: "registry.example.com".to_string(),
        username: "robot".to_string(),
        password: "s3cret".to_string(),
    }
}

pub fn object(value: Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

/// Deployment with a pod template and the given replica counts.
pub fn deployment(name: &str, desired: i64, ready: i64) -> DynamicObject {
    object(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name },
        "spec": {
            "replicas": desired,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "containers": [{ "name": name, "image": "nginx" }] }
            }
        },
        "status": { "readyReplicas": ready }
    }))
}

pub fn config_map(name: &str) -> DynamicObject {
    object(json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name },
        "data": { "key": "value" }
    }))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared API server (one envtest server per test binary)
// ═══════════════════════════════════════════════════════════════════════════════

/// Counter for generating unique namespace names.
static NS_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Holds the envtest server, a kube Client, and the tokio runtime that owns
/// the client's connections. All three live for the entire process.
struct SharedEnv {
    client: Client,
    // The client's buffer task runs here, so it outlives the per-test
    // `#[tokio::test]` runtimes.
    _runtime: tokio::runtime::Runtime,
    _server: envtest::Server,
}

// SAFETY: envtest::Server only holds the kubeconfig of the spawned server.
unsafe impl Send for SharedEnv {}
unsafe impl Sync for SharedEnv {}

/// Singleton, initialised on first use and never torn down.
static SHARED: OnceLock<SharedEnv> = OnceLock::new();

fn init_shared() -> SharedEnv {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("warn,release_agent=debug"))
        .try_init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build shared runtime");

    let (client, server) = rt.block_on(async {
        let mut env = Environment::default();
        let server = env.create().expect("failed to start envtest server");
        let kubeconfig = server.kubeconfig().expect("failed to get kubeconfig");
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .expect("failed to build config");
        let client = Client::try_from(config).expect("failed to create client");
        (client, server)
    });

    SharedEnv {
        client,
        _runtime: rt,
        _server: server,
    }
}

/// Get (or create) the shared envtest environment.
///
/// Initialization runs on a dedicated OS thread so `block_on` is never called
/// from inside a `#[tokio::test]` runtime.
fn shared() -> &'static SharedEnv {
    SHARED.get_or_init(|| {
        std::thread::spawn(init_shared)
            .join()
            .expect("shared env init thread panicked")
    })
}

/// Per-test context against the shared API server: a client and a fresh
/// namespace.
pub struct ClusterContext {
    pub client: Client,
    pub ns: String,
}

impl ClusterContext {
    pub async fn new() -> Self {
        let client = shared().client.clone();
        let ns = create_namespace(&client).await;
        Self { client, ns }
    }

    /// Another fresh namespace, for tests that check isolation.
    pub async fn extra_namespace(&self) -> String {
        create_namespace(&self.client).await
    }
}

async fn create_namespace(client: &Client) -> String {
    let id = NS_COUNTER.fetch_add(1, Ordering::SeqCst);
    let ns = format!("agent-test-{id}");
    let api: Api<Namespace> = Api::all(client.clone());
    let obj: Namespace = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": { "name": &ns }
    }))
    .unwrap();
    api.create(&PostParams::default(), &obj)
        .await
        .expect("failed to create test namespace");
    ns
}
