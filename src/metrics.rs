//! Node capacity and usage reporting.
//!
//! Capacity comes from `v1/Node` status, usage from the `metrics.k8s.io`
//! NodeMetrics API. Clusters without metrics-server still report capacity,
//! with usage as zero.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlane;
use crate::error::{Error, Result};

/// Reports are never sent more often than this.
pub const MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Aggregate node metrics sent upstream.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetricsReport {
    pub node_count: u32,
    pub cpu_capacity_cores: f64,
    pub cpu_usage_cores: f64,
    pub memory_capacity_bytes: u64,
    pub memory_usage_bytes: u64,
}

/// Parse a Kubernetes quantity into its plain numeric value.
fn parse_quantity(s: &str) -> Result<f64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::config("empty quantity"));
    }

    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-' && c != '+')
        .unwrap_or(s.len());
    let (num_str, suffix) = s.split_at(num_end);

    let num: f64 = num_str
        .parse()
        .map_err(|e| Error::config(format!("invalid quantity {s:?}: {e}")))?;

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        other => {
            return Err(Error::config(format!(
                "unknown quantity suffix {other:?} in {s:?}"
            )))
        }
    };

    Ok(num * multiplier)
}

/// CPU quantity in cores (`"250m"` → 0.25).
pub fn parse_cpu(s: &str) -> Result<f64> {
    parse_quantity(s)
}

/// Memory quantity in bytes (`"1Ki"` → 1024).
pub fn parse_memory(s: &str) -> Result<u64> {
    Ok(parse_quantity(s)?.round() as u64)
}

fn usage_field<'a>(obj: &'a DynamicObject, field: &str) -> Option<&'a str> {
    obj.data.get("usage")?.get(field)?.as_str()
}

/// Sum node capacity and usage. Unparseable quantities are skipped with a warning.
pub fn aggregate(nodes: &[Node], usage: &[DynamicObject]) -> NodeMetricsReport {
    let mut report = NodeMetricsReport {
        node_count: nodes.len() as u32,
        ..Default::default()
    };

    for node in nodes {
        let Some(capacity) = node.status.as_ref().and_then(|s| s.capacity.as_ref()) else {
            continue;
        };
        if let Some(cpu) = capacity.get("cpu") {
            match parse_cpu(&cpu.0) {
                Ok(cores) => report.cpu_capacity_cores += cores,
                Err(e) => warn!(node = %node.name_any(), error = %e, "ignoring cpu capacity"),
            }
        }
        if let Some(memory) = capacity.get("memory") {
            match parse_memory(&memory.0) {
                Ok(bytes) => report.memory_capacity_bytes += bytes,
                Err(e) => warn!(node = %node.name_any(), error = %e, "ignoring memory capacity"),
            }
        }
    }

    for metrics in usage {
        if let Some(cpu) = usage_field(metrics, "cpu") {
            match parse_cpu(cpu) {
                Ok(cores) => report.cpu_usage_cores += cores,
                Err(e) => warn!(node = %metrics.name_any(), error = %e, "ignoring cpu usage"),
            }
        }
        if let Some(memory) = usage_field(metrics, "memory") {
            match parse_memory(memory) {
                Ok(bytes) => report.memory_usage_bytes += bytes,
                Err(e) => warn!(node = %metrics.name_any(), error = %e, "ignoring memory usage"),
            }
        }
    }

    report
}

/// Periodically collects node metrics and reports them upstream.
pub struct MetricsReporter {
    client: Client,
    control_plane: Arc<dyn ControlPlane>,
    interval: Duration,
}

impl MetricsReporter {
    /// `interval` is raised to [`MIN_INTERVAL`] when shorter.
    pub fn new(client: Client, control_plane: Arc<dyn ControlPlane>, interval: Duration) -> Self {
        Self {
            client,
            control_plane,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Take one snapshot of the cluster's nodes.
    pub async fn collect(&self) -> Result<NodeMetricsReport> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = nodes.list(&ListParams::default()).await?.items;

        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "NodeMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "nodes");
        let node_metrics: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let usage = match node_metrics.list(&ListParams::default()).await {
            Ok(list) => list.items,
            Err(kube::Error::Api(resp)) if resp.code == 404 || resp.code == 503 => {
                warn!(code = resp.code, "node metrics API unavailable, reporting zero usage");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(aggregate(&nodes, &usage))
    }

    /// Report forever. Failures are logged and retried on the next tick.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "starting metrics reporter");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = match self.collect().await {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, "collecting node metrics failed");
                    continue;
                }
            };
            debug!(
                nodes = report.node_count,
                cpu_usage = report.cpu_usage_cores,
                memory_usage = report.memory_usage_bytes,
                "reporting node metrics"
            );
            if let Err(e) = self.control_plane.report_metrics(&report).await {
                warn!(error = %e, "reporting node metrics failed");
            }
        }
    }
}
