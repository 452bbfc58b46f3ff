use std::fmt;
use thiserror::Error;

/// Validation issues collected across an entire configuration file.
///
/// Every individual problem is kept so operators can fix a broken config in
/// one pass instead of replaying load-fail cycles.
#[derive(Debug, Default)]
pub struct ConfigIssues(pub Vec<String>);

impl ConfigIssues {
    pub fn push(&mut self, issue: impl Into<String>) {
        self.0.push(issue.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConfigIssues {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} issue(s): {}", self.0.len(), self.0.join("; "))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("OperationCancelled: {0}")]
    Cancelled(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("KubeconfigError: {0}")]
    KubeconfigError(String),

    #[error("YamlError: {0}")]
    YamlError(#[source] serde_yaml::Error),

    #[error("ConfigError: {0}")]
    ConfigError(String),

    #[error("ValidationError: {0}")]
    Validation(ConfigIssues),

    #[error("InvariantError: {0}")]
    Invariant(String),

    #[error("ScalingFailed: {reference} in namespace {namespace}: {source}")]
    ScalingFailed {
        namespace: String,
        reference: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::Cancelled(_) => "cancelled",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
            Error::KubeError(_) => "kube",
            Error::KubeconfigError(_) => "kubeconfig",
            Error::YamlError(_) => "yaml",
            Error::ConfigError(_) => "config",
            Error::Validation(_) => "validation",
            Error::Invariant(_) => "invariant",
            Error::ScalingFailed { .. } => "scaling_failed",
        }
        .to_string()
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled(_) => true,
            Error::ScalingFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => Error::NotFound(err.to_string()),
            other => Error::KubeError(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
