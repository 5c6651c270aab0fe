use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum SinkError {
    #[error("event consumer has gone away")]
    Disconnected,
    #[error("event stream already completed")]
    Terminated,
}
