use std::{env, ffi::OsString, time::Duration};

pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_EVENT_BUFFER: usize = 256;
pub(crate) const DEFAULT_OUTPUT_DIR: &str = "output";
pub(crate) const DEFAULT_SCRIPT: &str = "main.py";
pub(crate) const WORKER_BINARY_ENV: &str = "SCRAPE_WORKER_BINARY";
pub(crate) const UNBUFFERED_ENV: &str = "PYTHONUNBUFFERED";

/// Upper bound on how long teardown waits for a killed worker to be reaped.
pub(crate) const KILL_WAIT: Duration = Duration::from_secs(5);
pub(crate) const WORKER_LINE_BUFFER: usize = 256;

pub(crate) const CONNECTED_MESSAGE: &str = "Streaming started";
pub(crate) const START_FAILED_MESSAGE: &str = "Failed to start scraping process";
pub(crate) const SUCCESS_MESSAGE: &str = "Scraping completed successfully";
pub(crate) const FAILURE_MESSAGE: &str = "Scraping failed";
pub(crate) const DISCONNECTED_ERROR: &str = "Client disconnected";

pub(crate) fn default_program() -> OsString {
    env::var_os(WORKER_BINARY_ENV).unwrap_or_else(|| OsString::from("python3"))
}

pub(crate) fn exit_error(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("Process exited with code {code}"),
        None => "Process terminated by signal".to_string(),
    }
}
