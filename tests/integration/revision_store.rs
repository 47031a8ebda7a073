use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use release_agent::model::RevisionRecord;
use release_agent::revision_store::{FileRevisionStore, InMemoryRevisionStore, RevisionStore};

fn scratch_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "release-agent-{tag}-{}-{nanos}",
        std::process::id()
    ))
}

fn record(name: &str, revision: u32) -> RevisionRecord {
    RevisionRecord {
        release_name: name.to_string(),
        revision_id: format!("rev-{revision}"),
        package_manager_revision: revision,
        deployment_id: format!("dep-{name}"),
    }
}

/// Behaviour every backend shares, exercised in `ns` with `other` as a
/// second namespace that must stay isolated.
pub async fn exercise(store: &dyn RevisionStore, ns: &str, other: &str) -> anyhow::Result<()> {
    assert_eq!(store.get(ns, "web").await?, None);
    assert!(store.list(ns).await?.is_empty());

    store.put(ns, &record("web", 1)).await?;
    store.put(ns, &record("api", 1)).await?;
    store.put(ns, &record("web", 2)).await?;
    store.put(other, &record("web", 7)).await?;

    assert_eq!(store.get(ns, "web").await?, Some(record("web", 2)));
    assert_eq!(
        store.list(ns).await?,
        vec![record("api", 1), record("web", 2)]
    );

    store.delete(ns, "web").await?;
    store.delete(ns, "web").await?;
    assert_eq!(store.get(ns, "web").await?, None);
    assert_eq!(store.get(other, "web").await?, Some(record("web", 7)));
    Ok(())
}

#[tokio::test]
async fn in_memory_store_contract() -> anyhow::Result<()> {
    exercise(&InMemoryRevisionStore::new(), "shop", "other").await
}

#[tokio::test]
async fn file_store_contract() -> anyhow::Result<()> {
    let dir = scratch_dir("store");
    let result = exercise(&FileRevisionStore::new(&dir), "shop", "other").await;
    let _ = std::fs::remove_dir_all(&dir);
    result
}

/// Files the store did not write are ignored by `list`.
#[tokio::test]
async fn file_store_ignores_foreign_files() -> anyhow::Result<()> {
    let dir = scratch_dir("foreign");
    let store = FileRevisionStore::new(&dir);
    store.put("shop", &record("web", 1)).await?;
    std::fs::write(dir.join("shop").join("notes.txt"), "hello")?;
    std::fs::write(dir.join("shop").join("other.json"), "{}")?;

    let listed = store.list("shop").await;
    let _ = std::fs::remove_dir_all(&dir);
    assert_eq!(listed?, vec![record("web", 1)]);
    Ok(())
}

/// Records written by a newer agent are refused rather than misread.
#[tokio::test]
async fn file_store_rejects_unknown_version() -> anyhow::Result<()> {
    let dir = scratch_dir("version");
    let store = FileRevisionStore::new(&dir);
    std::fs::create_dir_all(dir.join("shop"))?;
    std::fs::write(
        dir.join("shop").join("agent.release.v1.web.json"),
        r#"{"version":2,"releaseName":"web","revisionId":"r","packageManagerRevision":1}"#,
    )?;

    let result = store.get("shop", "web").await;
    let _ = std::fs::remove_dir_all(&dir);
    assert!(result.is_err());
    Ok(())
}
