#![forbid(unsafe_code)]
//! Streams a long-running scraper worker's output as one ordered event stream.
//!
//! A session spawns the worker, forwards its stdout/stderr lines as `log`/`error` events,
//! polls the worker's output files and emits every complete record as a `data` event, and
//! once the worker exits performs a final drain before emitting a single `complete` event.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use scrape_session::{InMemoryJobStore, ScrapeSession, SessionRequest};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = ScrapeSession::builder()
//!     .program("python3")
//!     .arg("main.py")
//!     .output_dir("output")
//!     .build()?;
//! let store = Arc::new(InMemoryJobStore::default());
//! let mut run = session.start(SessionRequest::new("alice", "user-1"), store)?;
//! while let Some(event) = run.events.next_event().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! let outcome = run.completion.await?;
//! println!("{:?}", outcome.end);
//! # Ok(()) }
//! ```

mod builder;
mod catalog;
mod config;
mod cursor;
mod defaults;
mod drain;
mod error;
mod job;
mod process;
mod scheduler;
mod session;

pub use builder::ScrapeSessionBuilder;
pub use catalog::{default_channels, ChannelSpec, TargetName};
pub use config::{ChannelConfig, ConfigError, LimitsConfig, SessionConfig, WorkerConfig};
pub use cursor::FileCursor;
pub use drain::Phase;
pub use error::SessionError;
pub use job::{
    InMemoryJobStore, Job, JobId, JobMetadata, JobStatus, JobStore, JobStoreError, JobUpdate,
    NewJob,
};
pub use process::{OutputStream, WorkerCommand, WorkerExit, WorkerState};
pub use session::{
    CancelHandle, DynSessionCompletion, ScrapeSession, SessionEnd, SessionOutcome, SessionRequest,
    SessionRun,
};

pub use tail_events::{ChannelKey, Record, RecordShape, ScanLimits, StreamEvent};

#[cfg(test)]
mod tests;
