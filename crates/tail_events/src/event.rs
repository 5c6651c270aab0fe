use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ChannelKey;

/// One complete unit extracted from a tailed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Record {
    /// A trimmed, non-blank line from a line-delimited file.
    Text(String),
    /// A parsed object from a file of concatenated JSON objects.
    Object(Value),
}

/// Events delivered to the consumer of a session, in emission order.
///
/// Serializes to the wire shape `{"type": "...", ...}`:
///
/// ```rust
/// use tail_events::{ChannelKey, Record, StreamEvent};
///
/// let event = StreamEvent::Data {
///     file: ChannelKey::new("followers").unwrap(),
///     data: Record::Text("alice".to_string()),
/// };
/// assert_eq!(
///     serde_json::to_string(&event).unwrap(),
///     r#"{"type":"data","file":"followers","data":"alice"}"#
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Connected {
        message: String,
    },
    /// A completed stdout line from the worker.
    Log {
        message: String,
    },
    /// A completed stderr line from the worker, or a session start failure.
    Error {
        message: String,
    },
    Data {
        file: ChannelKey,
        data: Record,
    },
    /// Terminal event; `code` is `None` when the worker ended without an exit code.
    Complete {
        code: Option<i32>,
        message: String,
    },
}

impl StreamEvent {
    pub fn connected(message: impl Into<String>) -> Self {
        Self::Connected {
            message: message.into(),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn data(file: ChannelKey, data: Record) -> Self {
        Self::Data { file, data }
    }

    pub fn complete(code: Option<i32>, message: impl Into<String>) -> Self {
        Self::Complete {
            code,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Log { .. } => "log",
            Self::Error { .. } => "error",
            Self::Data { .. } => "data",
            Self::Complete { .. } => "complete",
        }
    }
}
