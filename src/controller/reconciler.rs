//! Release reconciler: the main loop.
//!
//! Each pass pulls the desired state from the control plane, converges every
//! desired release (install, upgrade or nothing), uninstalls recorded releases
//! that are no longer desired, and reports per-release health upstream. A
//! failure leaves the stored revision record untouched, so the next pass
//! retries from the last recorded state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{DynamicObject, GroupVersionKind, ObjectMeta};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::control_plane::{ControlPlane, RegistryCredentials};
use crate::error::{Error, Result};
use crate::helm::{ActionOptions, PackageManager, ReleaseRequest};
use crate::helpers::pull_secret_name;
use crate::model::{
    decode_manifest, AgentResource, DeploymentSpec, DeploymentStatus, RevisionRecord, StatusType,
};
use crate::revision_store::RevisionStore;

use super::actions::{ActionContext, ActionFactory};
use super::state_machine::{matching, ReleaseAction, ReleaseSnapshot};
use super::status::{evaluate, verdict, HealthVerdict, KindRegistry};
use super::{applier, preflight, restart};

// ── Shared context passed to every reconcile call ─────────────────────────────

pub struct Context {
    pub cluster: Arc<dyn Cluster>,
    pub helm: Arc<dyn PackageManager>,
    pub store: Arc<dyn RevisionStore>,
    pub control_plane: Arc<dyn ControlPlane>,
    pub actions: ActionFactory,
    pub kinds: KindRegistry,
    /// Upper bound on concurrent per-object API calls in apply and restart.
    pub apply_concurrency: usize,
}

/// What one reconcile of a release did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub action: ReleaseAction,
    /// The record stored after the action (the existing one when unchanged).
    pub record: Option<RevisionRecord>,
}

// ── Agent loop ────────────────────────────────────────────────────────────────

/// Poll the control plane every `interval` and reconcile `namespace`. Runs
/// forever; errors are logged and retried on the next tick.
pub async fn run(ctx: Arc<Context>, namespace: String, interval: Duration) {
    info!(%namespace, interval_secs = interval.as_secs(), "starting release reconciler");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let mut resource = match ctx.control_plane.fetch_resource().await {
            Ok(resource) => resource,
            Err(e) => {
                warn!(%namespace, error = %e, "fetching desired state failed");
                continue;
            }
        };
        if resource.namespace != namespace {
            if !resource.namespace.is_empty() {
                warn!(
                    %namespace,
                    requested = %resource.namespace,
                    "desired state targets another namespace, reconciling the agent's own"
                );
            }
            resource.namespace = namespace.clone();
        }
        if let Err(e) = reconcile_target(&ctx, &resource).await {
            warn!(%namespace, error = %e, "reconcile pass finished with errors");
        }
    }
}

// ── Target reconciliation ─────────────────────────────────────────────────────

/// Converge the namespace onto `resource`: every desired release is
/// reconciled and reported, every recorded release not desired is
/// uninstalled. One release failing does not stop the others.
pub async fn reconcile_target(ctx: &Context, resource: &AgentResource) -> Result<()> {
    let namespace = &resource.namespace;
    let mut errors = Vec::new();

    for release in &resource.deployments {
        let spec = DeploymentSpec::new(namespace.clone(), release.clone());
        let status = match reconcile_release(ctx, &spec).await {
            Ok(_) => {
                let health = release_health(ctx, namespace, &release.release_name).await;
                DeploymentStatus {
                    revision_id: release.revision_id.clone(),
                    status_type: health.status,
                    message: health.message,
                }
            }
            Err(e) => {
                let status = DeploymentStatus {
                    revision_id: release.revision_id.clone(),
                    status_type: StatusType::Error,
                    message: e.to_string(),
                };
                errors.push(e);
                status
            }
        };
        if let Err(e) = ctx.control_plane.report_status(&status).await {
            warn!(%namespace, release = %release.release_name, error = %e, "reporting status failed");
        }
    }

    let desired: HashSet<&str> = resource
        .deployments
        .iter()
        .map(|d| d.release_name.as_str())
        .collect();
    match ctx.store.list(namespace).await {
        Ok(records) => {
            for record in records {
                if desired.contains(record.release_name.as_str()) {
                    continue;
                }
                info!(%namespace, release = %record.release_name, "release no longer desired");
                if let Err(e) = uninstall_release(ctx, namespace, &record.release_name).await {
                    errors.push(e);
                }
            }
        }
        Err(e) => errors.push(e),
    }

    Error::join(errors)
}

// ── Single release ────────────────────────────────────────────────────────────

/// Install or upgrade the deployment's release when its recorded revision differs
/// from the desired one. The revision record is written only after the
/// package manager succeeded.
pub async fn reconcile_release(ctx: &Context, spec: &DeploymentSpec) -> Result<ReconcileOutcome> {
    let release = spec.release()?;
    let namespace = spec.namespace.as_str();
    let release_name = release.release_name.as_str();

    let record = ctx.store.get(namespace, release_name).await?;
    let release_exists = match record {
        Some(_) => true,
        None => {
            let lookup = ctx.actions.build(namespace, None).await?;
            let existing = ctx.helm.status(&lookup, release_name).await?;
            if let Some(info) = &existing {
                warn!(
                    %namespace,
                    release = %release_name,
                    package_manager_revision = info.revision,
                    "release exists without a revision record, adopting it"
                );
            }
            existing.is_some()
        }
    };
    let snapshot = ReleaseSnapshot::observe(record.as_ref(), Some(release), release_exists);
    let Some(transition) = matching(&snapshot) else {
        debug!(%namespace, release = %release_name, revision = %release.revision_id, "release up to date");
        return Ok(ReconcileOutcome {
            action: ReleaseAction::Unchanged,
            record,
        });
    };
    info!(
        %namespace,
        release = %release_name,
        action = %transition.action,
        guard = transition.guard_name,
        "release transition"
    );

    let action_ctx = ctx.actions.build(namespace, Some(spec)).await?;
    let (action, record) = match transition.action {
        ReleaseAction::Install | ReleaseAction::Upgrade => {
            let record = install_or_upgrade(ctx, &action_ctx, spec, transition.action).await?;
            (transition.action, Some(record))
        }
        ReleaseAction::Uninstall => {
            uninstall_release(ctx, namespace, release_name).await?;
            (ReleaseAction::Uninstall, None)
        }
        ReleaseAction::Unchanged => (ReleaseAction::Unchanged, record),
    };

    if release.force_restart && matches!(action, ReleaseAction::Install | ReleaseAction::Upgrade) {
        restart::force_restart(
            ctx.cluster.as_ref(),
            ctx.helm.as_ref(),
            &ctx.kinds,
            &action_ctx,
            release_name,
            ctx.apply_concurrency,
        )
        .await?;
    }

    Ok(ReconcileOutcome { action, record })
}

async fn install_or_upgrade(
    ctx: &Context,
    action_ctx: &ActionContext,
    spec: &DeploymentSpec,
    action: ReleaseAction,
) -> Result<RevisionRecord> {
    let namespace = spec.namespace.as_str();
    let mut spec = spec.clone();
    let chart = preflight::resolve(ctx.helm.as_ref(), action_ctx, &mut spec).await?;
    let release = spec.release()?;

    if let Some(creds) = &action_ctx.credentials {
        ensure_pull_secret(ctx, namespace, &release.release_name, creds).await?;
    }

    let info = match action {
        ReleaseAction::Install => {
            let req = ReleaseRequest {
                release_name: &release.release_name,
                chart: &chart,
                values: &release.values,
                options: ActionOptions::install(),
            };
            ctx.helm.install(action_ctx, &req).await?
        }
        _ => {
            let req = ReleaseRequest {
                release_name: &release.release_name,
                chart: &chart,
                values: &release.values,
                options: ActionOptions::upgrade(),
            };
            ctx.helm.upgrade(action_ctx, &req).await?
        }
    };

    let record = RevisionRecord {
        release_name: release.release_name.clone(),
        revision_id: release.revision_id.clone(),
        package_manager_revision: info.revision,
        deployment_id: release.deployment_id.clone(),
    };
    ctx.store.put(namespace, &record).await?;
    info!(
        %namespace,
        release = %record.release_name,
        revision = %record.revision_id,
        package_manager_revision = record.package_manager_revision,
        "{action} succeeded"
    );
    Ok(record)
}

/// Remove a release, its image pull secret and its revision record. Safe to
/// repeat.
pub async fn uninstall_release(ctx: &Context, namespace: &str, release_name: &str) -> Result<()> {
    let action_ctx = ctx.actions.build(namespace, None).await?;
    ctx.helm
        .uninstall(&action_ctx, release_name, &ActionOptions::uninstall())
        .await?;
    remove_pull_secret(ctx, namespace, release_name).await?;
    ctx.store.delete(namespace, release_name).await?;
    info!(%namespace, release = %release_name, "release uninstalled");
    Ok(())
}

/// Evaluate every object the release's current revision rendered.
pub async fn release_health(ctx: &Context, namespace: &str, release_name: &str) -> HealthVerdict {
    let objects = match release_objects(ctx, namespace, release_name).await {
        Ok(objects) => objects,
        Err(e) => {
            return HealthVerdict {
                status: StatusType::Error,
                message: format!("reading manifest of release {release_name}: {e}"),
            }
        }
    };
    let mut results = Vec::with_capacity(objects.len());
    for obj in &objects {
        results.push(evaluate(ctx.cluster.as_ref(), &ctx.kinds, namespace, obj).await);
    }
    verdict(results)
}

async fn release_objects(
    ctx: &Context,
    namespace: &str,
    release_name: &str,
) -> Result<Vec<DynamicObject>> {
    let action_ctx = ctx.actions.build(namespace, None).await?;
    let manifest = ctx.helm.manifest(&action_ctx, release_name).await?;
    decode_manifest(&manifest)
}

// ── Registry pull secret ──────────────────────────────────────────────────────

/// `kubernetes.io/dockerconfigjson` Secret carrying `creds`, named by
/// [`pull_secret_name`].
pub fn pull_secret(
    namespace: &str,
    release_name: &str,
    creds: &RegistryCredentials,
) -> Result<DynamicObject> {
    let mut auths = serde_json::Map::new();
    auths.insert(
        creds.host.clone(),
        json!({ "username": creds.username, "password": creds.password }),
    );
    let config = json!({ "auths": auths });
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(pull_secret_name(release_name)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/dockerconfigjson".to_string()),
        data: Some(
            [(
                ".dockerconfigjson".to_string(),
                ByteString(serde_json::to_vec(&config)?),
            )]
            .into(),
        ),
        ..Default::default()
    };
    Ok(serde_json::from_value(serde_json::to_value(&secret)?)?)
}

/// Delete the release's image pull secret, if there is one.
pub async fn remove_pull_secret(ctx: &Context, namespace: &str, release_name: &str) -> Result<()> {
    let kind = ctx
        .cluster
        .resolve(&GroupVersionKind::gvk("", "v1", "Secret"))
        .await?;
    ctx.cluster
        .delete(&kind, kind.scope(namespace), &pull_secret_name(release_name))
        .await
}

/// Create or refresh the release's image pull secret so the names injected
/// into its values resolve.
pub async fn ensure_pull_secret(
    ctx: &Context,
    namespace: &str,
    release_name: &str,
    creds: &RegistryCredentials,
) -> Result<()> {
    let secret = pull_secret(namespace, release_name, creds)?;
    applier::apply(
        ctx.cluster.as_ref(),
        namespace,
        std::slice::from_ref(&secret),
        ctx.apply_concurrency,
    )
    .await
}
