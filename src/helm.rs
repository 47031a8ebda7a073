//! Package-manager (Helm) actions.
//!
//! [`PackageManager`] is the seam the reconciler drives. [`HelmCli`] runs the
//! `helm` binary with the namespace wiring from an [`ActionContext`];
//! [`InMemoryPackageManager`] keeps releases in memory for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::control_plane::RegistryCredentials;
use crate::controller::actions::ActionContext;
use crate::error::{Error, Result};
use crate::helpers::registry_host;

/// Where a chart comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChartSource {
    /// OCI registry reference (`oci://host/path/chart`).
    Oci { reference: String },
    /// Classic chart repository serving an `index.yaml`.
    Repository { repo_url: String, chart_name: String },
    /// Direct link to a packaged chart archive.
    Archive { url: String },
}

impl ChartSource {
    /// Host credentials for this source apply to.
    pub fn host(&self) -> &str {
        match self {
            Self::Oci { reference } => registry_host(reference),
            Self::Repository { repo_url, .. } => registry_host(repo_url),
            Self::Archive { url } => registry_host(url),
        }
    }

    fn display_name(&self) -> &str {
        match self {
            Self::Oci { reference } => reference.rsplit('/').next().unwrap_or(reference),
            Self::Repository { chart_name, .. } => chart_name,
            Self::Archive { url } => url
                .rsplit('/')
                .next()
                .and_then(|f| f.strip_suffix(".tgz"))
                .unwrap_or(url),
        }
    }
}

/// `Chart.yaml` fields the agent cares about.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub app_version: Option<String>,
}

/// A chart located, downloaded and parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedChart {
    pub metadata: ChartMetadata,
    pub archive: PathBuf,
    pub source: ChartSource,
}

/// Behavioural switches for one action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActionOptions {
    pub timeout: Duration,
    pub wait: bool,
    pub atomic: bool,
    pub cleanup_on_fail: bool,
    pub ignore_not_found: bool,
}

impl ActionOptions {
    /// Upper bound for install, upgrade and uninstall.
    pub const TIMEOUT: Duration = Duration::from_secs(5 * 60);

    pub fn install() -> Self {
        Self {
            timeout: Self::TIMEOUT,
            wait: true,
            atomic: true,
            cleanup_on_fail: false,
            ignore_not_found: false,
        }
    }

    pub fn upgrade() -> Self {
        Self {
            cleanup_on_fail: true,
            ..Self::install()
        }
    }

    pub fn uninstall() -> Self {
        Self {
            timeout: Self::TIMEOUT,
            wait: true,
            atomic: false,
            cleanup_on_fail: false,
            ignore_not_found: true,
        }
    }
}

/// Install or upgrade request.
#[derive(Clone, Copy, Debug)]
pub struct ReleaseRequest<'a> {
    pub release_name: &'a str,
    pub chart: &'a LoadedChart,
    pub values: &'a Value,
    pub options: ActionOptions,
}

/// Outcome of a successful install or upgrade.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    /// Revision number assigned by the package manager.
    pub revision: u32,
    pub status: String,
}

/// Trait abstracting the package manager so tests can substitute an in-memory one.
#[async_trait::async_trait]
pub trait PackageManager: Send + Sync {
    async fn pull(&self, ctx: &ActionContext, source: &ChartSource, version: &str) -> Result<LoadedChart>;

    async fn install(&self, ctx: &ActionContext, req: &ReleaseRequest<'_>) -> Result<ReleaseInfo>;

    async fn upgrade(&self, ctx: &ActionContext, req: &ReleaseRequest<'_>) -> Result<ReleaseInfo>;

    async fn uninstall(&self, ctx: &ActionContext, release_name: &str, options: &ActionOptions) -> Result<()>;

    /// Rendered manifest of the release's current revision.
    async fn manifest(&self, ctx: &ActionContext, release_name: &str) -> Result<String>;

    /// The release as the package manager knows it; `None` when it has none.
    async fn status(&self, ctx: &ActionContext, release_name: &str) -> Result<Option<ReleaseInfo>>;
}

// ── helm CLI ──────────────────────────────────────────────────────────────────

/// Extra time granted to the helm process beyond its own `--timeout`.
const PROCESS_GRACE: Duration = Duration::from_secs(30);

/// Timeout for pulls and reads, which helm does not bound itself.
const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Production implementation that shells out to `helm`. Direct chart
/// archives are fetched over HTTP instead.
pub struct HelmCli {
    binary: PathBuf,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct HelmRelease {
    name: String,
    namespace: String,
    version: u32,
    #[serde(default)]
    info: Option<HelmReleaseInfo>,
}

#[derive(Deserialize)]
struct HelmReleaseInfo {
    #[serde(default)]
    status: String,
}

/// Parse the JSON helm prints for `install`/`upgrade --output json`.
pub fn parse_release_output(stdout: &str) -> Result<ReleaseInfo> {
    let release: HelmRelease = serde_json::from_str(stdout.trim())?;
    Ok(ReleaseInfo {
        name: release.name,
        namespace: release.namespace,
        revision: release.version,
        status: release.info.map(|i| i.status).unwrap_or_default(),
    })
}

fn format_timeout(timeout: Duration) -> String {
    format!("{}s", timeout.as_secs())
}

/// Arguments for `helm install`/`helm upgrade`, minus the global flags.
pub fn release_args(command: &str, req: &ReleaseRequest<'_>, values_file: &Path) -> Vec<String> {
    let mut args = vec![
        command.to_string(),
        req.release_name.to_string(),
        req.chart.archive.display().to_string(),
        "--values".to_string(),
        values_file.display().to_string(),
        "--output".to_string(),
        "json".to_string(),
        "--timeout".to_string(),
        format_timeout(req.options.timeout),
    ];
    if req.options.wait {
        args.push("--wait".to_string());
    }
    if req.options.atomic {
        args.push("--atomic".to_string());
    }
    if req.options.cleanup_on_fail {
        args.push("--cleanup-on-fail".to_string());
    }
    args
}

/// Whether helm's stderr says the release does not exist.
pub fn is_release_not_found(stderr: &str) -> bool {
    stderr.contains("release: not found")
}

/// Local repository name for a chart repository URL, stable across pulls.
///
/// `https://charts.example.com/stable` → `charts-example-com-stable`
pub fn repository_alias(repo_url: &str) -> String {
    let rest = repo_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(repo_url);
    rest.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

/// Arguments for `helm pull` of a registry or repository chart, minus the
/// global flags. Credentials are never part of them: registries are logged
/// into and repositories added (as `repo_alias`) beforehand, both with the
/// password on stdin.
pub fn pull_args(
    source: &ChartSource,
    version: &str,
    destination: &Path,
    plain_http: bool,
    repo_alias: Option<&str>,
) -> Vec<String> {
    let mut args = vec!["pull".to_string()];
    match source {
        ChartSource::Oci { reference } => {
            args.push(reference.clone());
            if plain_http {
                args.push("--plain-http".to_string());
            }
        }
        ChartSource::Repository { repo_url, chart_name } => match repo_alias {
            Some(alias) => args.push(format!("{alias}/{chart_name}")),
            None => args.extend([chart_name.clone(), "--repo".to_string(), repo_url.clone()]),
        },
        ChartSource::Archive { url } => args.push(url.clone()),
    }
    if !version.is_empty() && !matches!(source, ChartSource::Archive { .. }) {
        args.extend(["--version".to_string(), version.to_string()]);
    }
    args.extend(["--destination".to_string(), destination.display().to_string()]);
    args
}

/// Arguments for `helm uninstall`, minus the global flags.
pub fn uninstall_args(release_name: &str, options: &ActionOptions) -> Vec<String> {
    let mut args = vec![
        "uninstall".to_string(),
        release_name.to_string(),
        "--timeout".to_string(),
        format_timeout(options.timeout),
    ];
    if options.wait {
        args.push("--wait".to_string());
    }
    if options.ignore_not_found {
        args.push("--ignore-not-found".to_string());
    }
    args
}

impl HelmCli {
    pub fn new(binary: impl Into<PathBuf>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(READ_TIMEOUT).build()?;
        Ok(Self {
            binary: binary.into(),
            http,
        })
    }

    fn command(&self, ctx: &ActionContext) -> Command {
        let config = &ctx.config;
        let mut cmd = Command::new(&self.binary);
        cmd.env("HELM_DRIVER", config.storage_driver)
            .arg("--namespace")
            .arg(&config.namespace)
            .arg("--registry-config")
            .arg(&config.registry_config)
            .arg("--repository-config")
            .arg(&config.repository_config)
            .arg("--repository-cache")
            .arg(&config.repository_cache)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run helm to completion. The child is killed if the returned future is
    /// dropped or `timeout` elapses.
    async fn run(
        &self,
        ctx: &ActionContext,
        operation: &'static str,
        release: &str,
        args: &[String],
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<String> {
        let mut cmd = self.command(ctx);
        cmd.args(args);
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        debug!(namespace = %ctx.namespace(), %release, operation, "running helm");

        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                operation,
                seconds: timeout.as_secs(),
            })??;

        if !output.status.success() {
            return Err(Error::PackageManager {
                operation,
                namespace: ctx.namespace().to_string(),
                release: release.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn registry_login(&self, ctx: &ActionContext, creds: &RegistryCredentials) -> Result<()> {
        if let Some(dir) = ctx.config.registry_config.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut args = vec![
            "registry".to_string(),
            "login".to_string(),
            creds.host.clone(),
            "--username".to_string(),
            creds.username.clone(),
            "--password-stdin".to_string(),
        ];
        if ctx.config.plain_http {
            args.push("--insecure".to_string());
        }
        let password = Some(creds.password.as_str());
        self.run(ctx, "registry login", &creds.host, &args, password, READ_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Register a password-protected repository under its alias in the
    /// namespace's repository config.
    async fn repo_add(
        &self,
        ctx: &ActionContext,
        repo_url: &str,
        creds: &RegistryCredentials,
    ) -> Result<String> {
        if let Some(dir) = ctx.config.repository_config.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let alias = repository_alias(repo_url);
        let args = vec![
            "repo".to_string(),
            "add".to_string(),
            alias.clone(),
            repo_url.to_string(),
            "--username".to_string(),
            creds.username.clone(),
            "--password-stdin".to_string(),
            "--force-update".to_string(),
        ];
        let password = Some(creds.password.as_str());
        self.run(ctx, "repo add", &alias, &args, password, READ_TIMEOUT)
            .await?;
        Ok(alias)
    }

    async fn download_archive(&self, ctx: &ActionContext, url: &str, dest: &Path) -> Result<()> {
        let mut request = self.http.get(url);
        if let Some(creds) = &ctx.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let body = request.send().await?.error_for_status()?.bytes().await?;
        let file = url
            .rsplit('/')
            .next()
            .filter(|f| !f.is_empty())
            .unwrap_or("chart.tgz");
        tokio::fs::write(dest.join(file), &body).await?;
        debug!(namespace = %ctx.namespace(), %url, bytes = body.len(), "downloaded chart archive");
        Ok(())
    }

    async fn release_action(
        &self,
        ctx: &ActionContext,
        operation: &'static str,
        req: &ReleaseRequest<'_>,
    ) -> Result<ReleaseInfo> {
        let values_dir = ctx.config.work_dir.join("values");
        tokio::fs::create_dir_all(&values_dir).await?;
        let values_file = values_dir.join(format!("{}.yaml", req.release_name));
        tokio::fs::write(&values_file, serde_yaml::to_string(req.values)?).await?;

        let args = release_args(operation, req, &values_file);
        let stdout = self
            .run(ctx, operation, req.release_name, &args, None, req.options.timeout + PROCESS_GRACE)
            .await?;
        let release = parse_release_output(&stdout)?;
        info!(
            namespace = %release.namespace,
            release = %release.name,
            revision = release.revision,
            status = %release.status,
            "helm {operation} finished"
        );
        Ok(release)
    }
}

#[async_trait::async_trait]
impl PackageManager for HelmCli {
    async fn pull(&self, ctx: &ActionContext, source: &ChartSource, version: &str) -> Result<LoadedChart> {
        let dest = ctx
            .config
            .work_dir
            .join("charts")
            .join(format!("{}-{version}", source.display_name()));
        match tokio::fs::remove_dir_all(&dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&dest).await?;

        let name = source.display_name().to_string();
        match (source, &ctx.credentials) {
            (ChartSource::Archive { url }, _) => self.download_archive(ctx, url, &dest).await?,
            (ChartSource::Oci { .. }, creds) => {
                if let Some(creds) = creds {
                    self.registry_login(ctx, creds).await?;
                }
                let args = pull_args(source, version, &dest, ctx.config.plain_http, None);
                self.run(ctx, "pull", &name, &args, None, READ_TIMEOUT).await?;
            }
            (ChartSource::Repository { repo_url, .. }, creds) => {
                let alias = match creds {
                    Some(creds) => Some(self.repo_add(ctx, repo_url, creds).await?),
                    None => None,
                };
                let args = pull_args(source, version, &dest, ctx.config.plain_http, alias.as_deref());
                self.run(ctx, "pull", &name, &args, None, READ_TIMEOUT).await?;
            }
        }

        let archive = find_archive(&dest)
            .await?
            .ok_or_else(|| Error::chart(format!("pull of {name} produced no chart archive")))?;
        let show = vec![
            "show".to_string(),
            "chart".to_string(),
            archive.display().to_string(),
        ];
        let chart_yaml = self.run(ctx, "show chart", &name, &show, None, READ_TIMEOUT).await?;
        let metadata: ChartMetadata = serde_yaml::from_str(&chart_yaml)?;
        debug!(chart = %metadata.name, version = %metadata.version, "loaded chart");

        Ok(LoadedChart {
            metadata,
            archive,
            source: source.clone(),
        })
    }

    async fn install(&self, ctx: &ActionContext, req: &ReleaseRequest<'_>) -> Result<ReleaseInfo> {
        self.release_action(ctx, "install", req).await
    }

    async fn upgrade(&self, ctx: &ActionContext, req: &ReleaseRequest<'_>) -> Result<ReleaseInfo> {
        self.release_action(ctx, "upgrade", req).await
    }

    async fn uninstall(&self, ctx: &ActionContext, release_name: &str, options: &ActionOptions) -> Result<()> {
        let args = uninstall_args(release_name, options);
        self.run(ctx, "uninstall", release_name, &args, None, options.timeout + PROCESS_GRACE)
            .await?;
        info!(namespace = %ctx.namespace(), release = %release_name, "helm uninstall finished");
        Ok(())
    }

    async fn manifest(&self, ctx: &ActionContext, release_name: &str) -> Result<String> {
        let args = vec![
            "get".to_string(),
            "manifest".to_string(),
            release_name.to_string(),
        ];
        self.run(ctx, "get manifest", release_name, &args, None, READ_TIMEOUT)
            .await
    }

    async fn status(&self, ctx: &ActionContext, release_name: &str) -> Result<Option<ReleaseInfo>> {
        let args = vec![
            "status".to_string(),
            release_name.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        match self.run(ctx, "status", release_name, &args, None, READ_TIMEOUT).await {
            Ok(stdout) => Ok(Some(parse_release_output(&stdout)?)),
            Err(Error::PackageManager { message, .. }) if is_release_not_found(&message) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

async fn find_archive(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "tgz") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

// ── In-memory implementation ──────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct StoredRelease {
    revision: u32,
    chart: String,
    values: Value,
}

#[derive(Default)]
struct InMemoryHelmState {
    charts: HashMap<String, String>,
    releases: HashMap<(String, String), StoredRelease>,
    failures: HashSet<(String, String)>,
    calls: Vec<String>,
    pull_credentials: Vec<Option<RegistryCredentials>>,
}

/// In-memory package manager for tests.
///
/// Charts are registered with the manifest every release of them renders to.
/// Failures can be injected per `(operation, release)`.
#[derive(Default)]
pub struct InMemoryPackageManager {
    state: Mutex<InMemoryHelmState>,
}

impl InMemoryPackageManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryHelmState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `chart_name` pullable; its releases render to `manifest`.
    pub fn with_chart(self, chart_name: &str, manifest: &str) -> Self {
        self.lock()
            .charts
            .insert(chart_name.to_string(), manifest.to_string());
        self
    }

    /// Make `operation` ("pull", "install", "upgrade", "uninstall", "get manifest")
    /// fail for `target` (a release name, or the chart name for pulls).
    pub fn fail(&self, operation: &str, target: &str) {
        self.lock()
            .failures
            .insert((operation.to_string(), target.to_string()));
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        self.lock().failures.clear();
    }

    /// Every operation performed, as `"<operation>:<target>"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Credentials seen by each pull, in order.
    pub fn pull_credentials(&self) -> Vec<Option<RegistryCredentials>> {
        self.lock().pull_credentials.clone()
    }

    pub fn revision(&self, namespace: &str, release_name: &str) -> Option<u32> {
        self.lock()
            .releases
            .get(&(namespace.to_string(), release_name.to_string()))
            .map(|r| r.revision)
    }

    /// Values the release's current revision was rendered with.
    pub fn values(&self, namespace: &str, release_name: &str) -> Option<Value> {
        self.lock()
            .releases
            .get(&(namespace.to_string(), release_name.to_string()))
            .map(|r| r.values.clone())
    }

    fn record(&self, ctx: &ActionContext, operation: &'static str, target: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("{operation}:{target}"));
        if state
            .failures
            .contains(&(operation.to_string(), target.to_string()))
        {
            return Err(Error::PackageManager {
                operation,
                namespace: ctx.namespace().to_string(),
                release: target.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PackageManager for InMemoryPackageManager {
    async fn pull(&self, ctx: &ActionContext, source: &ChartSource, version: &str) -> Result<LoadedChart> {
        let name = source.display_name().to_string();
        self.record(ctx, "pull", &name)?;
        let mut state = self.lock();
        state.pull_credentials.push(ctx.credentials.clone());
        if !state.charts.contains_key(&name) {
            return Err(Error::chart(format!("chart {name} not found")));
        }
        Ok(LoadedChart {
            metadata: ChartMetadata {
                name: name.clone(),
                version: version.to_string(),
                app_version: None,
            },
            archive: PathBuf::from(format!("{name}-{version}.tgz")),
            source: source.clone(),
        })
    }

    async fn install(&self, ctx: &ActionContext, req: &ReleaseRequest<'_>) -> Result<ReleaseInfo> {
        self.record(ctx, "install", req.release_name)?;
        let key = (ctx.namespace().to_string(), req.release_name.to_string());
        let mut state = self.lock();
        if state.releases.contains_key(&key) {
            return Err(Error::PackageManager {
                operation: "install",
                namespace: key.0,
                release: key.1,
                message: "cannot re-use a name that is still in use".to_string(),
            });
        }
        state.releases.insert(
            key.clone(),
            StoredRelease {
                revision: 1,
                chart: req.chart.metadata.name.clone(),
                values: req.values.clone(),
            },
        );
        Ok(ReleaseInfo {
            name: key.1,
            namespace: key.0,
            revision: 1,
            status: "deployed".to_string(),
        })
    }

    async fn upgrade(&self, ctx: &ActionContext, req: &ReleaseRequest<'_>) -> Result<ReleaseInfo> {
        self.record(ctx, "upgrade", req.release_name)?;
        let key = (ctx.namespace().to_string(), req.release_name.to_string());
        let mut state = self.lock();
        let Some(release) = state.releases.get_mut(&key) else {
            return Err(Error::PackageManager {
                operation: "upgrade",
                namespace: key.0,
                release: key.1,
                message: "has no deployed releases".to_string(),
            });
        };
        release.revision += 1;
        release.chart = req.chart.metadata.name.clone();
        release.values = req.values.clone();
        Ok(ReleaseInfo {
            revision: release.revision,
            name: key.1,
            namespace: key.0,
            status: "deployed".to_string(),
        })
    }

    async fn uninstall(&self, ctx: &ActionContext, release_name: &str, options: &ActionOptions) -> Result<()> {
        self.record(ctx, "uninstall", release_name)?;
        let key = (ctx.namespace().to_string(), release_name.to_string());
        let removed = self.lock().releases.remove(&key);
        if removed.is_none() && !options.ignore_not_found {
            return Err(Error::NotFound(format!("release {release_name}")));
        }
        Ok(())
    }

    async fn manifest(&self, ctx: &ActionContext, release_name: &str) -> Result<String> {
        self.record(ctx, "get manifest", release_name)?;
        let key = (ctx.namespace().to_string(), release_name.to_string());
        let state = self.lock();
        state
            .releases
            .get(&key)
            .and_then(|r| state.charts.get(&r.chart))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("release {release_name}")))
    }

    async fn status(&self, ctx: &ActionContext, release_name: &str) -> Result<Option<ReleaseInfo>> {
        self.record(ctx, "status", release_name)?;
        let key = (ctx.namespace().to_string(), release_name.to_string());
        Ok(self.lock().releases.get(&key).map(|r| ReleaseInfo {
            name: key.1.clone(),
            namespace: key.0.clone(),
            revision: r.revision,
            status: "deployed".to_string(),
        }))
    }
}
