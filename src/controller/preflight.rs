//! Chart resolution and values preparation before an install or upgrade.

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::controller::actions::ActionContext;
use crate::error::{Error, Result};
use crate::helm::{ChartSource, LoadedChart, PackageManager};
use crate::helpers::pull_secret_name;
use crate::model::{DeploymentSpec, ReleaseDescriptor};

const IMAGE_PULL_SECRETS: &str = "imagePullSecrets";

/// Work out where a release's chart lives from the shape of its URL.
///
/// - `oci://…` is registry-hosted; the chart name is appended unless the
///   reference already ends with it.
/// - `http(s)://…/<file>.tgz` is a packaged archive.
/// - any other `http(s)://` URL is a chart repository serving `chart_name`.
pub fn chart_source(release: &ReleaseDescriptor) -> Result<ChartSource> {
    let url = release.chart_url.trim().trim_end_matches('/');
    let chart = release.chart_name.trim();

    if url.starts_with("oci://") {
        let reference = if chart.is_empty() || url.ends_with(&format!("/{chart}")) {
            url.to_string()
        } else {
            format!("{url}/{chart}")
        };
        return Ok(ChartSource::Oci { reference });
    }

    if url.starts_with("https://") || url.starts_with("http://") {
        if url.ends_with(".tgz") {
            return Ok(ChartSource::Archive {
                url: url.to_string(),
            });
        }
        if chart.is_empty() {
            return Err(Error::chart(format!(
                "release {} uses repository {url} but names no chart",
                release.release_name
            )));
        }
        return Ok(ChartSource::Repository {
            repo_url: url.to_string(),
            chart_name: chart.to_string(),
        });
    }

    Err(Error::chart(format!(
        "release {} has unsupported chart URL {:?}",
        release.release_name, release.chart_url
    )))
}

/// Append `secret_name` to every `imagePullSecrets` list in `values`, at any
/// depth of nested maps. Returns the number of lists changed.
///
/// No list is created where none exists. Entries follow the shape already
/// used by the list (bare strings or `{name: …}` objects, the latter for
/// empty lists), and a name already present is not added twice.
pub fn inject_pull_secret(values: &mut Value, secret_name: &str) -> usize {
    let Value::Object(map) = values else {
        return 0;
    };
    let mut changed = 0;
    for (key, value) in map.iter_mut() {
        if key == IMAGE_PULL_SECRETS {
            if let Value::Array(list) = value {
                if append_secret(list, secret_name) {
                    changed += 1;
                }
            }
            continue;
        }
        changed += inject_pull_secret(value, secret_name);
    }
    changed
}

fn append_secret(list: &mut Vec<Value>, secret_name: &str) -> bool {
    let present = list.iter().any(|entry| match entry {
        Value::String(name) => name == secret_name,
        other => other.get("name").and_then(Value::as_str) == Some(secret_name),
    });
    if present {
        return false;
    }
    if list.iter().any(Value::is_string) {
        list.push(Value::String(secret_name.to_string()));
    } else {
        list.push(json!({ "name": secret_name }));
    }
    true
}

fn preflight_error(release_name: &str, namespace: &str, e: Error) -> Error {
    Error::chart(format!(
        "preflight of release {release_name} in namespace {namespace} failed: {e}"
    ))
}

/// Locate and load the deployment's chart, then inject the release's pull secret
/// into its values. Any failure names the release and namespace.
pub async fn resolve(
    helm: &dyn PackageManager,
    ctx: &ActionContext,
    spec: &mut DeploymentSpec,
) -> Result<LoadedChart> {
    let namespace = ctx.namespace();
    let release = spec.release_mut()?;

    let source = chart_source(release)
        .map_err(|e| preflight_error(&release.release_name, namespace, e))?;
    debug!(%namespace, release = %release.release_name, ?source, "resolving chart");

    let chart = helm
        .pull(ctx, &source, &release.chart_version)
        .await
        .map_err(|e| preflight_error(&release.release_name, namespace, e))?;

    let secret = pull_secret_name(&release.release_name);
    let injected = inject_pull_secret(&mut release.values, &secret);
    info!(
        %namespace,
        release = %release.release_name,
        chart = %chart.metadata.name,
        version = %chart.metadata.version,
        injected,
        "chart resolved"
    );
    Ok(chart)
}
