use std::sync::Arc;

use super::common::*;
use release_agent::control_plane::StaticRegistryAuth;
use release_agent::controller::actions::{ActionFactory, STORAGE_DRIVER};
use release_agent::model::DeploymentSpec;

fn factory(auth: StaticRegistryAuth) -> (ActionFactory, Arc<StaticRegistryAuth>) {
    let auth = Arc::new(auth);
    let factory = ActionFactory::new("/tmp/agent-work", true, auth.clone());
    (factory, auth)
}

/// Namespace wiring is built once; credentials are resolved on every build
/// that carries a spec and never when it does not.
#[tokio::test]
async fn config_is_cached_credentials_are_not() -> anyhow::Result<()> {
    let (factory, auth) = factory(StaticRegistryAuth::with(credentials()));
    let spec = DeploymentSpec::new(NS, descriptor("web", "r1"));

    let first = factory.build(NS, Some(&spec)).await?;
    let second = factory.build(NS, Some(&spec)).await?;
    let read_only = factory.build(NS, None).await?;

    assert!(Arc::ptr_eq(&first.config, &second.config));
    assert!(Arc::ptr_eq(&first.config, &read_only.config));
    assert_eq!(auth.calls(), 2);
    assert_eq!(first.credentials, Some(credentials()));
    assert_eq!(read_only.credentials, None);

    assert_eq!(first.namespace(), NS);
    assert_eq!(first.config.storage_driver, STORAGE_DRIVER);
    assert!(first.config.plain_http);
    assert!(first.config.work_dir.ends_with(NS));
    assert!(first.config.registry_config.starts_with(&first.config.work_dir));
    assert!(first.config.repository_config.starts_with(&first.config.work_dir));
    Ok(())
}

/// Different namespaces get separate configurations, built concurrently.
#[tokio::test]
async fn namespaces_are_isolated() -> anyhow::Result<()> {
    let (factory, _) = factory(StaticRegistryAuth::public());
    let factory = Arc::new(factory);

    let handles: Vec<_> = ["a", "b", "c", "a", "b", "c"]
        .into_iter()
        .map(|ns| {
            let factory = factory.clone();
            tokio::spawn(async move { factory.build(ns, None).await })
        })
        .collect();
    for handle in handles {
        handle.await??;
    }

    assert_eq!(factory.cached_namespaces(), 3);
    let a = factory.build("a", None).await?;
    let b = factory.build("b", None).await?;
    assert_ne!(a.config.work_dir, b.config.work_dir);
    Ok(())
}

/// Without a spec no credentials are requested, even from a failing resolver.
#[tokio::test]
async fn read_only_build_skips_auth() -> anyhow::Result<()> {
    let (factory, auth) = factory(StaticRegistryAuth::failing());
    factory.build(NS, None).await?;
    assert_eq!(auth.calls(), 0);

    let spec = DeploymentSpec::new(NS, descriptor("web", "r1"));
    assert!(factory.build(NS, Some(&spec)).await.is_err());
    Ok(())
}
