//! Durable record of which release revision is installed.
//!
//! One [`RevisionRecord`] per release name per namespace, stored under
//! [`revision_storage_key`]. Writes are last-writer-wins: a namespace is owned
//! by exactly one agent process.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

use crate::controller::helpers::FIELD_MANAGER;
use crate::error::{Error, Result};
use crate::helpers::{release_name_from_key, revision_storage_key};
use crate::model::RevisionRecord;

/// Label marking a Secret as a revision record.
pub const RECORD_LABEL: &str = "release-agent.io/revision-record";
/// Label carrying the release name a record belongs to.
pub const RELEASE_LABEL: &str = "release-agent.io/release";
/// Secret data key holding the encoded record.
pub const PAYLOAD_KEY: &str = "release";

/// Trait abstracting revision-record storage so backends can be swapped.
#[async_trait::async_trait]
pub trait RevisionStore: Send + Sync {
    /// `Ok(None)` when no record exists for the release.
    async fn get(&self, namespace: &str, release_name: &str) -> Result<Option<RevisionRecord>>;

    /// Store the whole record or fail; never a partial write.
    async fn put(&self, namespace: &str, record: &RevisionRecord) -> Result<()>;

    async fn list(&self, namespace: &str) -> Result<Vec<RevisionRecord>>;

    /// Remove the record. Removing a missing record is not an error.
    async fn delete(&self, namespace: &str, release_name: &str) -> Result<()>;
}

// ── Secret backend ────────────────────────────────────────────────────────────

/// Build the Secret that stores `record`.
pub fn record_secret(namespace: &str, record: &RevisionRecord) -> Result<Secret> {
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(revision_storage_key(&record.release_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (RECORD_LABEL.to_string(), "true".to_string()),
                (RELEASE_LABEL.to_string(), record.release_name.clone()),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            PAYLOAD_KEY.to_string(),
            ByteString(record.to_payload()?),
        )])),
        ..Default::default()
    })
}

/// Decode the record stored in `secret`.
pub fn record_from_secret(secret: &Secret) -> Result<RevisionRecord> {
    let payload = secret
        .data
        .as_ref()
        .and_then(|d| d.get(PAYLOAD_KEY))
        .ok_or_else(|| {
            Error::config(format!(
                "secret {} has no {PAYLOAD_KEY} payload",
                secret.name_any()
            ))
        })?;
    RevisionRecord::from_payload(&payload.0)
}

/// Records stored as labelled Secrets in the target namespace.
pub struct SecretRevisionStore {
    client: Client,
}

impl SecretRevisionStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl RevisionStore for SecretRevisionStore {
    async fn get(&self, namespace: &str, release_name: &str) -> Result<Option<RevisionRecord>> {
        let key = revision_storage_key(release_name);
        match self.api(namespace).get_opt(&key).await? {
            Some(secret) => Ok(Some(record_from_secret(&secret)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, namespace: &str, record: &RevisionRecord) -> Result<()> {
        let secret = record_secret(namespace, record)?;
        let key = revision_storage_key(&record.release_name);
        self.api(namespace)
            .patch(
                &key,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await?;
        debug!(
            %namespace,
            release = %record.release_name,
            revision = record.package_manager_revision,
            "stored revision record"
        );
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<RevisionRecord>> {
        let params = ListParams::default().labels(&format!("{RECORD_LABEL}=true"));
        let secrets = self.api(namespace).list(&params).await?;
        let mut records = Vec::with_capacity(secrets.items.len());
        for secret in &secrets.items {
            match record_from_secret(secret) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    %namespace,
                    secret = %secret.name_any(),
                    error = %e,
                    "skipping unreadable revision record"
                ),
            }
        }
        records.sort_by(|a, b| a.release_name.cmp(&b.release_name));
        Ok(records)
    }

    async fn delete(&self, namespace: &str, release_name: &str) -> Result<()> {
        let key = revision_storage_key(release_name);
        match self.api(namespace).delete(&key, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── File backend ──────────────────────────────────────────────────────────────

/// Records stored as JSON files under `<root>/<namespace>/`.
pub struct FileRevisionStore {
    root: PathBuf,
}

impl FileRevisionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn path(&self, namespace: &str, release_name: &str) -> PathBuf {
        self.dir(namespace)
            .join(format!("{}.json", revision_storage_key(release_name)))
    }
}

#[async_trait::async_trait]
impl RevisionStore for FileRevisionStore {
    async fn get(&self, namespace: &str, release_name: &str) -> Result<Option<RevisionRecord>> {
        match tokio::fs::read(self.path(namespace, release_name)).await {
            Ok(bytes) => Ok(Some(RevisionRecord::from_payload(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, namespace: &str, record: &RevisionRecord) -> Result<()> {
        tokio::fs::create_dir_all(self.dir(namespace)).await?;
        let path = self.path(namespace, &record.release_name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, record.to_payload()?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<RevisionRecord>> {
        let mut entries = match tokio::fs::read_dir(self.dir(namespace)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(key) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Some(release_name) = release_name_from_key(key) else {
                continue;
            };
            if let Some(record) = self.get(namespace, release_name).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.release_name.cmp(&b.release_name));
        Ok(records)
    }

    async fn delete(&self, namespace: &str, release_name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(namespace, release_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ── In-memory backend ─────────────────────────────────────────────────────────

/// In-memory store for tests. Holds encoded payloads so the versioned
/// encoding is exercised on every round trip.
#[derive(Default)]
pub struct InMemoryRevisionStore {
    records: Mutex<HashMap<(String, String), Vec<u8>>>,
    fail_puts: Mutex<bool>,
}

impl InMemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail.
    pub fn fail_puts(&self, fail: bool) {
        *self.fail_puts.lock().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl RevisionStore for InMemoryRevisionStore {
    async fn get(&self, namespace: &str, release_name: &str) -> Result<Option<RevisionRecord>> {
        let key = (namespace.to_string(), revision_storage_key(release_name));
        self.lock()
            .get(&key)
            .map(|bytes| RevisionRecord::from_payload(bytes))
            .transpose()
    }

    async fn put(&self, namespace: &str, record: &RevisionRecord) -> Result<()> {
        if *self.fail_puts.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(Error::config("revision store is read-only"));
        }
        let key = (
            namespace.to_string(),
            revision_storage_key(&record.release_name),
        );
        self.lock().insert(key, record.to_payload()?);
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<RevisionRecord>> {
        let mut records = self
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, bytes)| RevisionRecord::from_payload(bytes))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.release_name.cmp(&b.release_name));
        Ok(records)
    }

    async fn delete(&self, namespace: &str, release_name: &str) -> Result<()> {
        let key = (namespace.to_string(), revision_storage_key(release_name));
        self.lock().remove(&key);
        Ok(())
    }
}
