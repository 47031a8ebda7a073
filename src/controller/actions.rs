//! Per-namespace package-manager action contexts.
//!
//! The namespace wiring (storage driver, working directories, registry
//! config location, plain-HTTP mode) is built once per namespace and cached
//! for the process lifetime. Registry credentials are short-lived, so they are
//! resolved again on every build that carries a spec and are never cached.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::control_plane::{RegistryAuthResolver, RegistryCredentials};
use crate::error::{Error, Result};
use crate::model::DeploymentSpec;

/// Release state is persisted by the package manager as in-cluster Secrets.
pub const STORAGE_DRIVER: &str = "secret";

/// Cached, credential-free configuration for one namespace.
#[derive(Debug, PartialEq, Eq)]
pub struct ActionConfig {
    pub namespace: String,
    pub storage_driver: &'static str,
    pub plain_http: bool,
    /// Scratch space for downloaded charts and rendered values files.
    pub work_dir: PathBuf,
    pub registry_config: PathBuf,
    /// Repositories added with credentials for this namespace.
    pub repository_config: PathBuf,
    pub repository_cache: PathBuf,
}

impl ActionConfig {
    fn new(root: &std::path::Path, namespace: &str, plain_http: bool) -> Self {
        let work_dir = root.join(namespace);
        Self {
            namespace: namespace.to_string(),
            storage_driver: STORAGE_DRIVER,
            plain_http,
            registry_config: work_dir.join("registry").join("config.json"),
            repository_config: work_dir.join("repository").join("repositories.yaml"),
            repository_cache: work_dir.join("repository-cache"),
            work_dir,
        }
    }
}

/// Everything one package-manager action needs.
#[derive(Clone, Debug)]
pub struct ActionContext {
    pub config: Arc<ActionConfig>,
    pub credentials: Option<RegistryCredentials>,
}

impl ActionContext {
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }
}

/// Builds [`ActionContext`]s. Safe to share between concurrent reconciles of
/// different namespaces.
pub struct ActionFactory {
    root: PathBuf,
    plain_http: bool,
    auth: Arc<dyn RegistryAuthResolver>,
    configs: Mutex<HashMap<String, Arc<ActionConfig>>>,
}

impl ActionFactory {
    pub fn new(
        root: impl Into<PathBuf>,
        plain_http: bool,
        auth: Arc<dyn RegistryAuthResolver>,
    ) -> Self {
        Self {
            root: root.into(),
            plain_http,
            auth,
            configs: Mutex::new(HashMap::new()),
        }
    }

    /// Context for `namespace`. Credentials are resolved only when a spec is
    /// given; uninstall and read-only work pass `None`.
    pub async fn build(
        &self,
        namespace: &str,
        spec: Option<&DeploymentSpec>,
    ) -> Result<ActionContext> {
        let config = self.config_for(namespace);
        let credentials = match spec {
            Some(spec) => self.auth.resolve(spec).await.map_err(|e| {
                Error::registry(format!(
                    "resolving credentials for namespace {namespace}: {e}"
                ))
            })?,
            None => None,
        };
        Ok(ActionContext {
            config,
            credentials,
        })
    }

    /// Number of namespaces with a cached configuration.
    pub fn cached_namespaces(&self) -> usize {
        self.lock().len()
    }

    fn config_for(&self, namespace: &str) -> Arc<ActionConfig> {
        let mut configs = self.lock();
        configs
            .entry(namespace.to_string())
            .or_insert_with(|| {
                debug!(%namespace, "building action configuration");
                Arc::new(ActionConfig::new(&self.root, namespace, self.plain_http))
            })
            .clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ActionConfig>>> {
        self.configs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
