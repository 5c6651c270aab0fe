#![forbid(unsafe_code)]
//! Record scanning and event primitives for tailing a worker's output files.
//!
//! This crate has no filesystem or process awareness. It provides:
//! - [`scan`]/[`finish`]: incremental extraction of complete records from growing buffers.
//! - [`StreamEvent`]: the typed, ordered event shape delivered to a remote consumer.
//! - An ordered event sink (feature `tokio`) that refuses writes after the terminal event.

mod channel;
mod config;
mod error;
mod event;
mod scanner;
pub mod sse;

#[cfg(feature = "tokio")]
mod sink;

pub use channel::ChannelKey;
pub use config::ScanLimits;
pub use error::SinkError;
pub use event::{Record, StreamEvent};
pub use scanner::{finish, scan, OpenRecord, RecordShape, ScanOutput};

#[cfg(feature = "tokio")]
pub use sink::{event_channel, EventSender, EventStream};
