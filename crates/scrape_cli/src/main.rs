//! `scrape-stream`: runs one scrape session and writes its events to stdout.
//!
//! ```text
//! scrape-stream --target alice --output-dir output -- python3 main.py
//! ```
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `info` filter). The final job record
//! is printed to stderr as JSON once the session ends.

use std::{ffi::OsString, io, path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, ValueEnum};
use scrape_session::{
    ConfigError, InMemoryJobStore, ScrapeSession, SessionConfig, SessionEnd, SessionError,
    SessionRequest, StreamEvent,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "scrape-stream")]
#[command(about = "Run a scraper worker and stream its output files as events")]
struct Cli {
    /// TOML session configuration; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Account the worker scrapes; written to the worker's stdin.
    #[arg(long)]
    target: String,

    /// Owner recorded on the job.
    #[arg(long, default_value = "local")]
    owner: String,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    working_dir: Option<PathBuf>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[arg(long)]
    grace_period_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = Format::Sse)]
    format: Format,

    /// Worker program and arguments, e.g. `-- python3 main.py`.
    #[arg(last = true)]
    command: Vec<OsString>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    /// `data: <json>` frames separated by a blank line.
    Sse,
    /// One JSON object per line.
    Jsonl,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("worker program must be valid UTF-8 when given on the command line")]
    NonUtf8Command,
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write to stdout: {0}")]
    Stdout(#[source] io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("scrape-stream: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let session = ScrapeSession::from_config(session_config(&cli)?)?;
    let store = Arc::new(InMemoryJobStore::default());
    let mut run = session.start(SessionRequest::new(&cli.target, &cli.owner), store.clone())?;

    let cancel = run.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling session");
            cancel.cancel();
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(event) = run.events.next_event().await {
        let text = render(&event, cli.format)?;
        stdout
            .write_all(text.as_bytes())
            .await
            .map_err(CliError::Stdout)?;
        stdout.flush().await.map_err(CliError::Stdout)?;
    }

    let outcome = run.completion.await.map_err(CliError::Session)?;
    if let Some(job) = outcome.job_id.as_ref().and_then(|id| store.get(id)) {
        eprintln!("{}", serde_json::to_string_pretty(&job)?);
    }

    Ok(ExitCode::from(exit_status(&outcome.end)))
}

fn session_config(cli: &Cli) -> Result<SessionConfig, CliError> {
    let mut config = match cli.config.as_ref() {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };

    if let Some(dir) = cli.output_dir.clone() {
        config.output_dir = dir;
    }
    if let Some(dir) = cli.working_dir.clone() {
        config.worker.working_dir = Some(dir);
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    if let Some(ms) = cli.grace_period_ms {
        config.grace_period_ms = ms;
    }
    if let Some((program, args)) = cli.command.split_first() {
        let utf8 = |value: &OsString| value.to_str().map(str::to_string);
        config.worker.program = Some(utf8(program).ok_or(CliError::NonUtf8Command)?);
        config.worker.args = Some(
            args.iter()
                .map(|arg| utf8(arg).ok_or(CliError::NonUtf8Command))
                .collect::<Result<_, _>>()?,
        );
    }

    Ok(config)
}

fn render(event: &StreamEvent, format: Format) -> Result<String, serde_json::Error> {
    match format {
        Format::Sse => tail_events::sse::frame(event),
        Format::Jsonl => Ok(format!("{}\n", serde_json::to_string(event)?)),
    }
}

/// Mirrors the worker's exit code; 130 when the session was interrupted.
fn exit_status(end: &SessionEnd) -> u8 {
    match end {
        SessionEnd::Finished { code: Some(code) } => u8::try_from(*code).unwrap_or(1),
        SessionEnd::Finished { code: None } | SessionEnd::StartFailed { .. } => 1,
        SessionEnd::Disconnected { .. } => 130,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_command_overrides_worker() {
        let cli = Cli::try_parse_from([
            "scrape-stream",
            "--target",
            "alice",
            "--poll-interval-ms",
            "100",
            "--",
            "node",
            "scrape.js",
            "--headless",
        ])
        .unwrap();
        let config = session_config(&cli).unwrap();
        assert_eq!(config.worker.program.as_deref(), Some("node"));
        assert_eq!(
            config.worker.args,
            Some(vec!["scrape.js".to_string(), "--headless".to_string()])
        );
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.grace_period_ms, 3000);
    }

    #[test]
    fn formats_render_one_event_per_unit() {
        let event = StreamEvent::log("hi");
        assert_eq!(
            render(&event, Format::Sse).unwrap(),
            "data: {\"type\":\"log\",\"message\":\"hi\"}\n\n"
        );
        assert_eq!(
            render(&event, Format::Jsonl).unwrap(),
            "{\"type\":\"log\",\"message\":\"hi\"}\n"
        );
    }

    #[test]
    fn exit_status_follows_the_session_end() {
        assert_eq!(exit_status(&SessionEnd::Finished { code: Some(0) }), 0);
        assert_eq!(exit_status(&SessionEnd::Finished { code: Some(2) }), 2);
        assert_eq!(exit_status(&SessionEnd::Finished { code: None }), 1);
        assert_eq!(
            exit_status(&SessionEnd::StartFailed {
                message: "boom".to_string()
            }),
            1
        );
    }
}
