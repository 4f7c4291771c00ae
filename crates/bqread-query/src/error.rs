//! Error types for query execution

use bqread_decode::DecodeError;
use bqread_types::ErrorProto;
use std::fmt;
use std::io;
use thiserror::Error;

/// Failure reported by one of the remote services.
#[derive(Debug, Clone)]
pub enum RpcError {
    Api {
        code: u16,
        reason: Option<String>,
        message: String,
    },
    Grpc { code: tonic::Code, message: String },
    Transport { message: String, temporary: bool },
    Io { kind: io::ErrorKind, message: String },
    Wrapped {
        context: String,
        source: Box<RpcError>,
    },
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Api { code, message, .. } => write!(f, "API error {code}: {message}"),
            RpcError::Grpc { code, message } => write!(f, "gRPC error {code:?}: {message}"),
            RpcError::Transport { message, .. } => write!(f, "Transport error: {message}"),
            RpcError::Io { message, .. } => write!(f, "I/O error: {message}"),
            RpcError::Wrapped { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

// The chain must yield the inner `RpcError`, not its `Box`, for `downcast_ref`.
impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Wrapped { source, .. } => Some(&**source),
            _ => None,
        }
    }
}

impl RpcError {
    pub fn api(code: u16, reason: Option<&str>, message: impl Into<String>) -> Self {
        RpcError::Api {
            code,
            reason: reason.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn grpc(code: tonic::Code, message: impl Into<String>) -> Self {
        RpcError::Grpc {
            code,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>, temporary: bool) -> Self {
        RpcError::Transport {
            message: message.into(),
            temporary,
        }
    }

    pub fn wrap(self, context: impl Into<String>) -> Self {
        RpcError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error under any number of [`RpcError::Wrapped`] layers.
    pub fn root(&self) -> &RpcError {
        match self {
            RpcError::Wrapped { source, .. } => source.root(),
            other => other,
        }
    }

    /// gRPC status code of the innermost error, if it came from a stream.
    pub fn grpc_code(&self) -> Option<tonic::Code> {
        match self.root() {
            RpcError::Grpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        RpcError::grpc(status.code(), status.message())
    }
}

impl From<io::Error> for RpcError {
    fn from(err: io::Error) -> Self {
        RpcError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Stream {stream}: decode failed: {source}")]
    StreamDecode { stream: String, source: DecodeError },

    #[error("Stream {stream}: {source}")]
    Stream { stream: String, source: RpcError },

    #[error("Job {0} has no destination table")]
    NoDestinationTable(String),

    #[error("No read client configured")]
    NoReadClient,

    #[error("Job has no query configuration")]
    MissingQueryConfig,

    #[error("Job reference has no job id")]
    MissingJobId,

    #[error("Response carried no job reference")]
    MissingJobReference,

    #[error("Result schema is not available")]
    MissingSchema,

    #[error("Job failed: {0}")]
    JobFailed(ErrorProto),

    #[error("Cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }
}
