use serde_json::json;

use super::common::*;
use release_agent::cluster::ClusterOp;
use release_agent::controller::reconciler::{reconcile_release, uninstall_release};
use release_agent::controller::state_machine::ReleaseAction;
use release_agent::control_plane::StaticRegistryAuth;
use release_agent::model::DeploymentSpec;
use release_agent::revision_store::RevisionStore;

/// First revision installs, a new revision id upgrades, and the package
/// manager revision strictly increases.
#[tokio::test]
async fn install_then_upgrade() -> anyhow::Result<()> {
    let h = Harness::new();

    let r1 = reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r1"))).await?;
    assert_eq!(r1.action, ReleaseAction::Install);
    let r1 = r1.record.expect("record after install");
    assert_eq!(r1.revision_id, "r1");
    assert_eq!(r1.package_manager_revision, 1);
    assert_eq!(r1.deployment_id, "dep-web");

    let r2 = reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r2"))).await?;
    assert_eq!(r2.action, ReleaseAction::Upgrade);
    let r2 = r2.record.expect("record after upgrade");
    assert_eq!(r2.revision_id, "r2");
    assert!(r2.package_manager_revision > r1.package_manager_revision);

    assert_eq!(h.store.get(NS, "web").await?, Some(r2));
    assert_eq!(
        h.helm.calls(),
        vec!["status:web", "pull:web", "install:web", "pull:web", "upgrade:web"]
    );
    Ok(())
}

/// Reconciling the recorded revision again touches nothing.
#[tokio::test]
async fn same_revision_is_unchanged() -> anyhow::Result<()> {
    let h = Harness::new();
    let spec = DeploymentSpec::new(NS, descriptor("web", "r1"));

    reconcile_release(&h.ctx, &spec).await?;
    let calls = h.helm.calls().len();

    let again = reconcile_release(&h.ctx, &spec).await?;
    assert_eq!(again.action, ReleaseAction::Unchanged);
    assert_eq!(again.record.map(|r| r.package_manager_revision), Some(1));
    assert_eq!(h.helm.calls().len(), calls, "no package manager work expected");
    Ok(())
}

/// A failed upgrade leaves the last recorded revision authoritative.
#[tokio::test]
async fn failed_upgrade_keeps_previous_record() -> anyhow::Result<()> {
    let h = Harness::new();
    reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r1"))).await?;

    h.helm.fail("upgrade", "web");
    let err = reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r2")))
        .await
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("upgrade"), "{msg}");
    assert!(msg.contains(NS), "{msg}");

    let record = h.store.get(NS, "web").await?.expect("record survives");
    assert_eq!(record.revision_id, "r1");
    assert_eq!(h.helm.revision(NS, "web"), Some(1));

    // The next pass retries the same upgrade.
    h.helm.heal();
    let retried = reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r2"))).await?;
    assert_eq!(retried.action, ReleaseAction::Upgrade);
    Ok(())
}

/// A chart that cannot be resolved fails preflight before anything is installed.
#[tokio::test]
async fn unresolvable_chart_fails_preflight() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut release = descriptor("web", "r1");
    release.chart_name = "missing".to_string();

    let err = reconcile_release(&h.ctx, &DeploymentSpec::new(NS, release))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("preflight of release web"), "{err}");
    assert_eq!(h.store.get(NS, "web").await?, None);
    assert_eq!(h.helm.calls(), vec!["status:web", "pull:missing"]);
    Ok(())
}

/// A failing record write is reported as an error of the pass. The release
/// was installed anyway, so the next pass upgrades it in place instead of
/// installing it again, and the pass after that has nothing to do.
#[tokio::test]
async fn failed_record_write_converges_on_retry() -> anyhow::Result<()> {
    let h = Harness::new();
    let spec = DeploymentSpec::new(NS, descriptor("web", "r1"));
    h.store.fail_puts(true);

    assert!(reconcile_release(&h.ctx, &spec).await.is_err());
    assert_eq!(h.store.get(NS, "web").await?, None);
    assert_eq!(h.helm.revision(NS, "web"), Some(1));

    h.store.fail_puts(false);
    let retried = reconcile_release(&h.ctx, &spec).await?;
    assert_eq!(retried.action, ReleaseAction::Upgrade);
    let record = retried.record.expect("record after retry");
    assert_eq!(record.revision_id, "r1");
    assert_eq!(record.package_manager_revision, 2);
    assert_eq!(h.store.get(NS, "web").await?, Some(record));

    let settled = reconcile_release(&h.ctx, &spec).await?;
    assert_eq!(settled.action, ReleaseAction::Unchanged);
    assert_eq!(
        h.helm.calls().iter().filter(|c| c.starts_with("install:")).count(),
        1
    );
    Ok(())
}

/// Uninstall is harmless to repeat and removes the record and the
/// release's pull secret.
#[tokio::test]
async fn uninstall_twice_is_a_noop() -> anyhow::Result<()> {
    let h = Harness::with_auth(StaticRegistryAuth::with(credentials()));
    reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r1"))).await?;
    assert!(h.cluster.object("v1", "Secret", NS, "web-registry-auth").is_some());

    uninstall_release(&h.ctx, NS, "web").await?;
    uninstall_release(&h.ctx, NS, "web").await?;

    assert_eq!(h.store.get(NS, "web").await?, None);
    assert_eq!(h.helm.revision(NS, "web"), None);
    assert!(h.cluster.object("v1", "Secret", NS, "web-registry-auth").is_none());
    Ok(())
}

/// A pull secret that cannot be deleted fails the uninstall and keeps the
/// record, so the next pass tries again.
#[tokio::test]
async fn pull_secret_delete_failure_keeps_record() -> anyhow::Result<()> {
    let h = Harness::with_auth(StaticRegistryAuth::with(credentials()));
    reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r1"))).await?;
    h.cluster.fail_on(ClusterOp::Delete, "web-registry-auth");

    assert!(uninstall_release(&h.ctx, NS, "web").await.is_err());
    assert!(h.store.get(NS, "web").await?.is_some());
    Ok(())
}

/// Private charts: credentials are fetched on every install/upgrade, a pull
/// secret is created and its name injected into the values.
#[tokio::test]
async fn private_chart_gets_pull_secret() -> anyhow::Result<()> {
    let h = Harness::with_auth(StaticRegistryAuth::with(credentials()));

    reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r1"))).await?;
    reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r2"))).await?;

    assert_eq!(h.auth.calls(), 2, "credentials resolved per action");
    assert_eq!(h.ctx.actions.cached_namespaces(), 1);
    assert_eq!(
        h.helm.pull_credentials(),
        vec![Some(credentials()), Some(credentials())]
    );

    let values = h.helm.values(NS, "web").expect("release values");
    assert_eq!(
        values["imagePullSecrets"],
        json!([{ "name": "web-registry-auth" }])
    );

    let secret = h
        .cluster
        .object("v1", "Secret", NS, "web-registry-auth")
        .expect("pull secret created");
    assert_eq!(secret.data["type"], "kubernetes.io/dockerconfigjson");
    assert!(secret.data["data"][".dockerconfigjson"].is_string());
    Ok(())
}

/// Credential failures abort before anything is pulled or installed.
#[tokio::test]
async fn credential_failure_aborts() -> anyhow::Result<()> {
    let h = Harness::with_auth(StaticRegistryAuth::failing());

    let err = reconcile_release(&h.ctx, &DeploymentSpec::new(NS, descriptor("web", "r1")))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("namespace shop"), "{err}");
    assert_eq!(h.helm.calls(), vec!["status:web"]);
    assert_eq!(h.store.get(NS, "web").await?, None);
    Ok(())
}

/// `forceRestart` bumps the pod template of the rendered workloads after the
/// upgrade.
#[tokio::test]
async fn force_restart_after_upgrade() -> anyhow::Result<()> {
    let h = Harness::new();
    h.cluster.insert(NS, deployment("web", 2, 2))?;

    let mut release = descriptor("web", "r1");
    release.force_restart = true;
    reconcile_release(&h.ctx, &DeploymentSpec::new(NS, release)).await?;

    let patches = h.cluster.patches();
    assert_eq!(patches.len(), 1, "only the Deployment restarts");
    assert_eq!(patches[0].0, "web");

    let live = h
        .cluster
        .object("apps/v1", "Deployment", NS, "web")
        .expect("deployment");
    let annotation = live
        .data
        .pointer("/spec/template/metadata/annotations/kubectl.kubernetes.io~1restartedAt");
    assert!(annotation.and_then(|v| v.as_str()).is_some());
    Ok(())
}
