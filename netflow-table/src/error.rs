//! Error types for the flow table.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = FlowTableError> = std::result::Result<T, E>;

/// Step of the export write path that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStage {
    Open,
    Write,
    Sync,
    Rename,
}

impl std::fmt::Display for IoStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IoStage::Open => "open",
            IoStage::Write => "write",
            IoStage::Sync => "sync",
            IoStage::Rename => "rename",
        };
        f.write_str(name)
    }
}

/// Every failure the flow table reports to its caller.
#[derive(Error, Debug)]
pub enum FlowTableError {
    /// Entry count is zero or not a power of two
    #[error("invalid table configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Table, chain or export buffer could not be grown
    #[error("out of memory allocating {what}")]
    OutOfMemory { what: &'static str },

    /// Operation received no table
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Export could not be written to disk
    #[error("export {stage} failed for {}: {source}", .path.display())]
    IoFailure {
        stage: IoStage,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FlowTableError {
    pub(crate) fn io(stage: IoStage, path: impl Into<PathBuf>, source: io::Error) -> Self {
        FlowTableError::IoFailure {
            stage,
            path: path.into(),
            source,
        }
    }
}
