//! Error types for terminal exec sessions
//!
//! Errors fall into four families: eligibility failures raised before any
//! connection is opened, protocol violations by the client, transport
//! failures on either websocket, and Kubernetes API errors.

use thiserror::Error;

/// Result type for exec session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a container cannot be exec'd into
///
/// Raised by the exec gate before any transport is opened. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EligibilityError {
    /// The pod does not exist
    #[error("pod {namespace}/{pod} not found")]
    NotFound {
        /// Namespace of the pod
        namespace: String,
        /// Name of the pod
        pod: String,
    },

    /// The pod has run to completion, there is no process to attach to
    #[error("cannot exec into container in a completed pod, current phase {phase}")]
    Terminated {
        /// Terminal phase reported by the pod (Succeeded or Failed)
        phase: String,
    },

    /// The target names an init container
    #[error("can't exec init container {container} in pod {namespace}/{pod}")]
    InitContainerTarget {
        /// Namespace of the pod
        namespace: String,
        /// Name of the pod
        pod: String,
        /// The init container that was targeted
        container: String,
    },

    /// No running container with that name is reported in pod status
    #[error("pod {namespace}/{pod} has no running container {container}")]
    ContainerNotFound {
        /// Namespace of the pod
        namespace: String,
        /// Name of the pod
        pod: String,
        /// The container that was targeted
        container: String,
    },
}

/// Main error type for exec sessions
#[derive(Debug, Error)]
pub enum Error {
    /// Target failed the exec gate
    #[error(transparent)]
    Eligibility(#[from] EligibilityError),

    /// Client sent a malformed or unrecognised frame
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the violation
        message: String,
    },

    /// TLS, dial, handshake or mid-stream I/O failure
    #[error("transport error [{context}]: {message}")]
    Transport {
        /// Which connection failed (e.g. "client", "backend", "tls")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// The client closed its connection
    #[error("client closed the connection")]
    ClientClosed,

    /// The session was already terminated
    #[error("session terminated")]
    SessionTerminated,

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration (bad URL, unusable TLS material, ...)
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }

    /// Create a transport error for the given connection
    pub fn transport(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for protocol violations
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol { .. })
    }

    /// True when the error only reports that the session ended normally
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::ClientClosed | Self::SessionTerminated)
    }
}

impl From<axum::Error> for Error {
    fn from(e: axum::Error) -> Self {
        Self::transport("client", e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport("backend", e.to_string())
    }
}
