use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the ledger node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt index file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("unknown image {0}")]
    UnknownImage(String),
}

impl IndexError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Errors that end a scan pass.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("upstream unavailable during {operation}: {source}")]
    UpstreamUnavailable {
        operation: &'static str,
        #[source]
        source: RpcError,
    },

    #[error("index write failed: {0}")]
    IndexWriteFailure(#[from] IndexError),

    #[error("stop requested")]
    StopRequested,
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;
