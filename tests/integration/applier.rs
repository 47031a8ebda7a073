use serde_json::json;

use super::common::*;
use release_agent::cluster::ClusterOp;
use release_agent::controller::applier::apply;
use release_agent::error::Error;

fn cluster_role(name: &str) -> kube::api::DynamicObject {
    object(json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRole",
        "metadata": { "name": name },
        "rules": []
    }))
}

/// Applying the same objects twice succeeds and leaves the same state.
#[tokio::test]
async fn apply_is_idempotent() -> anyhow::Result<()> {
    let h = Harness::new();
    let objects = vec![
        config_map("settings"),
        deployment("web", 1, 0),
        cluster_role("reader"),
    ];

    apply(h.cluster.as_ref(), NS, &objects, 2).await?;
    assert_eq!(h.cluster.len(), 3);
    assert_eq!(h.cluster.writes(), 3);

    apply(h.cluster.as_ref(), NS, &objects, 2).await?;
    assert_eq!(h.cluster.len(), 3);
    assert_eq!(h.cluster.writes(), 6);

    let cm = h
        .cluster
        .object("v1", "ConfigMap", NS, "settings")
        .expect("configmap");
    assert_eq!(cm.metadata.namespace.as_deref(), Some(NS));
    assert_eq!(cm.data["data"]["key"], "value");

    let role = h
        .cluster
        .object("rbac.authorization.k8s.io/v1", "ClusterRole", NS, "reader")
        .expect("cluster role");
    assert_eq!(role.metadata.namespace, None);
    Ok(())
}

/// An object that names its own namespace keeps it.
#[tokio::test]
async fn explicit_namespace_is_kept() -> anyhow::Result<()> {
    let h = Harness::new();
    let mut cm = config_map("elsewhere");
    cm.metadata.namespace = Some("other".to_string());

    apply(h.cluster.as_ref(), NS, &[cm], 1).await?;
    assert!(h.cluster.object("v1", "ConfigMap", "other", "elsewhere").is_some());
    assert!(h.cluster.object("v1", "ConfigMap", NS, "elsewhere").is_none());
    Ok(())
}

/// Failures are collected in input order while the rest still apply.
#[tokio::test]
async fn failures_are_aggregated_in_order() -> anyhow::Result<()> {
    let h = Harness::new();
    h.cluster.forget_kind("Widget");
    h.cluster.fail_on(ClusterOp::Create, "c");
    let widget = object(json!({
        "apiVersion": "example.com/v1",
        "kind": "Widget",
        "metadata": { "name": "a" }
    }));
    let objects = vec![widget, config_map("b"), config_map("c"), config_map("d")];

    let err = apply(h.cluster.as_ref(), NS, &objects, 4).await.unwrap_err();
    let Error::Aggregate(errors) = &err else {
        panic!("expected aggregate, got {err}");
    };
    assert_eq!(errors.len(), 2);
    assert!(errors[0].to_string().starts_with("Widget a:"), "{}", errors[0]);
    assert!(errors[1].to_string().starts_with("ConfigMap c:"), "{}", errors[1]);

    assert!(h.cluster.object("v1", "ConfigMap", NS, "b").is_some());
    assert!(h.cluster.object("v1", "ConfigMap", NS, "d").is_some());
    Ok(())
}

/// A lookup failure other than not-found is fatal for that object only.
#[tokio::test]
async fn lookup_failure_skips_write() -> anyhow::Result<()> {
    let h = Harness::new();
    h.cluster.fail_on(ClusterOp::Get, "b");

    let err = apply(h.cluster.as_ref(), NS, &[config_map("a"), config_map("b")], 1)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ConfigMap b"), "{err}");
    assert!(h.cluster.object("v1", "ConfigMap", NS, "b").is_none());
    assert_eq!(h.cluster.writes(), 1);
    Ok(())
}
