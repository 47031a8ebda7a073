use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Chart resolution error: {0}")]
    Chart(String),

    #[error("Registry auth error: {0}")]
    Registry(String),

    #[error("{operation} of release {release} in namespace {namespace} failed: {message}")]
    PackageManager {
        operation: &'static str,
        namespace: String,
        release: String,
        message: String,
    },

    #[error("{kind} {name}: {reason}")]
    Health {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("{kind} {name}: {source}")]
    Apply {
        kind: String,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("{}", join_messages(.0))]
    Aggregate(Vec<Error>),
}

/// Short alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn chart(msg: impl Into<String>) -> Self {
        Self::Chart(msg.into())
    }
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    /// Wrap an error with the kind and name of the object it concerns.
    pub fn apply(kind: impl Into<String>, name: impl Into<String>, source: Error) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Collapse a batch of per-object failures: `Ok` when empty, the lone error
    /// when there is one, otherwise an `Aggregate`.
    pub fn join(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }

    /// True for a 404 from the API server, however deeply it has been wrapped.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(resp)) => resp.code == 404,
            Self::NotFound(_) => true,
            Self::Apply { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
