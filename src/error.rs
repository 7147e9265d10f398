//! Error types for cradle.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using cradle's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in cradle operations.
#[derive(Error, Debug)]
pub enum Error {
    // Resolution errors
    /// No container matched the given token.
    #[error("no such container: {0}")]
    ContainerNotFound(String),

    /// No image matched the given token.
    #[error("no such image: {0}")]
    ImageNotFound(String),

    /// A prefix matched more than one object.
    #[error("ambiguous {kind} prefix {token:?}: matches {count} objects")]
    AmbiguousPrefix {
        /// Object kind ("container" or "image").
        kind: &'static str,
        /// The token the user supplied.
        token: String,
        /// How many objects matched.
        count: usize,
    },

    // Precondition failures
    /// Container name already reserved within the namespace.
    #[error("name {0:?} is already in use")]
    NameInUse(String),

    /// Network still referenced by a container.
    #[error("network {0:?} is in use")]
    NetworkInUse(String),

    /// Volume still referenced by a container.
    #[error("volume {0:?} is in use")]
    VolumeInUse(String),

    /// Container is in the wrong state for the requested operation.
    #[error("container {id} is {actual}, expected {expected}")]
    InvalidState {
        /// Container ID.
        id: String,
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    // User errors (mis-usage → exit 125)
    /// Invalid flag value or flag combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Peer failures
    /// containerd RPC failed or the daemon is unreachable.
    #[error("containerd: {context}: {message}")]
    Containerd {
        /// What cradle was doing.
        context: String,
        /// Error from the peer.
        message: String,
    },

    /// A CNI plugin invocation failed.
    #[error("cni plugin {plugin:?}: {message}")]
    Cni {
        /// Plugin binary name.
        plugin: String,
        /// Error output or exit status.
        message: String,
    },

    /// containerd RPC exceeded its deadline.
    #[error("containerd: {0}: deadline exceeded")]
    Deadline(String),

    // Data store errors
    /// Data store read/write failure.
    #[error("data store: {0}")]
    Store(String),

    /// Network conflist problem.
    #[error("network {0:?}: {1}")]
    Network(String, String),

    /// Volume store problem.
    #[error("volume: {0}")]
    Volume(String),

    /// Compose file problem.
    #[error("compose: {0}")]
    Compose(String),

    /// Configuration file problem.
    #[error("config {}: {message}", path.display())]
    Config {
        /// File that failed to load.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// OCI spec assembly failure.
    #[error("assembling oci spec: {0}")]
    Spec(String),

    /// Log file read/encode failure.
    #[error("logs: {0}")]
    Logs(String),

    // Exec outcome mapping
    /// The command inside the container was found but not executable.
    #[error("exec: {0}: permission denied")]
    ExecNotExecutable(String),

    /// The command inside the container was not found.
    #[error("exec: {0}: not found")]
    ExecNotFound(String),

    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization wrapper.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a containerd error with operation context.
    pub fn containerd(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Containerd {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Create a store error with a message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an invalid-argument error with a message.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a spec-assembly error with a message.
    pub fn spec(msg: impl Into<String>) -> Self {
        Self::Spec(msg.into())
    }

    /// Create a network error naming the network.
    pub fn network(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Network(name.into(), msg.into())
    }

    /// Map this error to the CLI exit code contract.
    ///
    /// 125 for mis-usage, 126 for a non-executable container command, 127 for
    /// a missing container command, 1 for everything else. A container's own
    /// exit code never travels through `Error`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 125,
            Error::ExecNotExecutable(_) => 126,
            Error::ExecNotFound(_) => 127,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages should include context that helps users fix the
    /// problem.

    #[test]
    fn test_name_in_use_includes_name() {
        let err = Error::NameInUse("web".to_string());
        assert!(err.to_string().contains("web"));
    }

    #[test]
    fn test_ambiguous_prefix_includes_token_and_count() {
        let err = Error::AmbiguousPrefix {
            kind: "container",
            token: "abc".to_string(),
            count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_containerd_error_names_the_peer() {
        let err = Error::containerd("creating task", "connection refused");
        let msg = err.to_string();
        assert!(msg.contains("containerd"));
        assert!(msg.contains("creating task"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::invalid("bad flag").exit_code(), 125);
        assert_eq!(Error::ExecNotExecutable("/x".into()).exit_code(), 126);
        assert_eq!(Error::ExecNotFound("x".into()).exit_code(), 127);
        assert_eq!(Error::NameInUse("a".into()).exit_code(), 1);
        assert_eq!(
            Error::containerd("listing containers", "down").exit_code(),
            1
        );
    }
}
