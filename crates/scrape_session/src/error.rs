use std::path::PathBuf;

use thiserror::Error;

use crate::JobStoreError;

/// Errors that may occur while preparing or running a scrape session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("target must not be empty")]
    EmptyTarget,
    #[error("target `{0}` cannot be used in an output file name")]
    InvalidTarget(String),
    #[error("invalid channel key `{0}`")]
    InvalidChannelKey(String),
    #[error("channel `{0}` is registered more than once")]
    DuplicateChannel(String),
    #[error("file pattern for channel `{0}` must not be empty")]
    EmptyFilePattern(String),
    #[error("worker binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("worker stdin unavailable")]
    StdinUnavailable,
    #[error("worker stdout unavailable")]
    StdoutUnavailable,
    #[error("worker stderr unavailable")]
    StderrUnavailable,
    #[error("failed to write target to worker stdin: {0}")]
    StdinWrite(#[source] std::io::Error),
    #[error("failed to prepare output directory `{path}`: {source}")]
    PrepareOutputDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error("failed to join session task: {0}")]
    Join(#[from] tokio::task::JoinError),
}
