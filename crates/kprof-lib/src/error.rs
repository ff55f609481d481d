//! Error types shared by every stage of a profiling invocation

use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T, E = KprofError> = std::result::Result<T, E>;

/// Everything that can end a profiling invocation
///
/// None of these are retried. The orchestrator surfaces the first one it
/// sees and tears down whatever else is still running.
#[derive(Debug, Error)]
pub enum KprofError {
    /// Missing or invalid arguments
    #[error("usage: {0}")]
    Usage(String),

    /// No remote port could be determined for the target
    #[error("{0}")]
    NoPort(String),

    /// The cluster API was unreachable or refused us
    #[error("cluster API error: {0}")]
    Transport(String),

    /// The target pod does not exist
    #[error("pod {pod} not found in namespace {namespace}")]
    NotFound { namespace: String, pod: String },

    /// Port-forward setup or stream failure
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// The analysis tool failed to start or exited non-zero
    #[error("analysis tool error: {0}")]
    Launcher(String),
}

impl KprofError {
    /// True for errors caused by how the tool was invoked
    pub fn is_usage(&self) -> bool {
        matches!(self, KprofError::Usage(_) | KprofError::NoPort(_))
    }

    /// Map a cluster client error for a specific pod
    ///
    /// 404 responses become [`KprofError::NotFound`]; anything else is a
    /// transport failure.
    pub fn from_kube(err: kube::Error, namespace: &str, pod: &str) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => KprofError::NotFound {
                namespace: namespace.to_string(),
                pod: pod.to_string(),
            },
            other => KprofError::Transport(other.to_string()),
        }
    }
}
