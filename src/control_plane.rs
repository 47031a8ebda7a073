//! Client side of the control-plane API.
//!
//! The agent pulls its desired state, pushes per-release status and node
//! metrics, and asks for short-lived registry credentials before pulling a
//! private chart. Every request carries the target's bearer token.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{Error, Result};
use crate::metrics::NodeMetricsReport;
use crate::model::{AgentResource, DeploymentSpec, DeploymentStatus};

/// Short-lived credentials for one chart registry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
}

/// Produces registry credentials for the chart a deployment spec references.
#[async_trait::async_trait]
pub trait RegistryAuthResolver: Send + Sync {
    /// `Ok(None)` when the chart is public.
    async fn resolve(&self, spec: &DeploymentSpec) -> Result<Option<RegistryCredentials>>;
}

/// Desired-state source and report sink.
#[async_trait::async_trait]
pub trait ControlPlane: Send + Sync {
    async fn fetch_resource(&self) -> Result<AgentResource>;

    async fn report_status(&self, status: &DeploymentStatus) -> Result<()>;

    async fn report_metrics(&self, metrics: &NodeMetricsReport) -> Result<()>;
}

// ── HTTP implementation ───────────────────────────────────────────────────────

/// Production implementation talking to the control plane over HTTPS.
#[derive(Clone)]
pub struct HttpControlPlane {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/agent/{path}", self.base_url)
    }
}

#[async_trait::async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_resource(&self) -> Result<AgentResource> {
        let resource = self
            .http
            .get(self.url("resource"))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json::<AgentResource>()
            .await?;
        debug!(
            namespace = %resource.namespace,
            deployments = resource.deployments.len(),
            "fetched desired state"
        );
        Ok(resource)
    }

    async fn report_status(&self, status: &DeploymentStatus) -> Result<()> {
        self.http
            .post(self.url("status"))
            .bearer_auth(&self.token)
            .json(status)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn report_metrics(&self, metrics: &NodeMetricsReport) -> Result<()> {
        self.http
            .post(self.url("metrics"))
            .bearer_auth(&self.token)
            .json(metrics)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RegistryAuthResolver for HttpControlPlane {
    async fn resolve(&self, spec: &DeploymentSpec) -> Result<Option<RegistryCredentials>> {
        let release = spec.release()?;
        let resp = self
            .http
            .post(self.url("registry-auth"))
            .bearer_auth(&self.token)
            .json(&json!({
                "deploymentId": release.deployment_id,
                "chartUrl": release.chart_url,
            }))
            .send()
            .await
            .map_err(|e| Error::registry(format!("requesting credentials: {e}")))?;

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let creds = resp
            .error_for_status()
            .map_err(|e| Error::registry(format!("credential request rejected: {e}")))?
            .json::<RegistryCredentials>()
            .await
            .map_err(|e| Error::registry(format!("decoding credentials: {e}")))?;
        Ok(Some(creds))
    }
}

// ── Test doubles ──────────────────────────────────────────────────────────────

/// Fixed-answer resolver for tests. Counts how often it was asked.
#[derive(Default)]
pub struct StaticRegistryAuth {
    credentials: Option<RegistryCredentials>,
    fail: bool,
    calls: AtomicUsize,
}

impl StaticRegistryAuth {
    pub fn public() -> Self {
        Self::default()
    }

    pub fn with(credentials: RegistryCredentials) -> Self {
        Self {
            credentials: Some(credentials),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RegistryAuthResolver for StaticRegistryAuth {
    async fn resolve(&self, _spec: &DeploymentSpec) -> Result<Option<RegistryCredentials>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::registry("token exchange refused"));
        }
        Ok(self.credentials.clone())
    }
}

/// In-memory control plane for tests: serves a settable desired state and
/// records everything reported to it.
#[derive(Default)]
pub struct RecordingControlPlane {
    resource: Mutex<AgentResource>,
    statuses: Mutex<Vec<DeploymentStatus>>,
    metrics: Mutex<Vec<NodeMetricsReport>>,
}

impl RecordingControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_resource(&self, resource: AgentResource) {
        *self.resource.lock().unwrap_or_else(|e| e.into_inner()) = resource;
    }

    pub fn statuses(&self) -> Vec<DeploymentStatus> {
        self.statuses.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn metrics(&self) -> Vec<NodeMetricsReport> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn fetch_resource(&self) -> Result<AgentResource> {
        Ok(self.resource.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn report_status(&self, status: &DeploymentStatus) -> Result<()> {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(status.clone());
        Ok(())
    }

    async fn report_metrics(&self, metrics: &NodeMetricsReport) -> Result<()> {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(metrics.clone());
        Ok(())
    }
}
