//! Error type shared by every bridge component.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The workspace root was changed while leases on the old root were still live.
    #[error("workspace root {current} is in use; cannot switch to {requested}")]
    Configuration { current: PathBuf, requested: PathBuf },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to start `{runtime}`: {source}")]
    Spawn {
        runtime: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode script input: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Non-zero exit. The message is the child's stderr, untouched.
    #[error("{stderr}")]
    ExecutionFailure { exit_code: Option<i32>, stderr: String },

    #[error("failed to decode script output: {0}")]
    Deserialization(String),

    #[error("script did not finish within {0:?}")]
    Timeout(Duration),

    #[error("script call was cancelled")]
    Cancelled,

    #[error("runtime `{runtime}` is not usable: {reason}")]
    RuntimeInvalid { runtime: String, reason: String },
}

impl BridgeError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    /// Exit code of the child, when the failure came from a finished process.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExecutionFailure { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}
