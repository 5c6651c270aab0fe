use std::{
    collections::BTreeMap,
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tail_events::{finish, scan, Record, RecordShape, ScanOutput};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::SessionError;

/// How to launch the worker process.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One completed, trimmed, non-blank line of worker output.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct WorkerLine {
    pub(crate) stream: OutputStream,
    pub(crate) line: String,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkerState {
    /// Started; the input line has not been delivered yet.
    Spawned,
    Running,
    Exited(Option<i32>),
    Killed,
}

/// How the worker ended. `code` is `None` when the process was ended by a signal.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkerExit {
    Exited { code: Option<i32> },
    Killed,
}

impl WorkerExit {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => *code,
            Self::Killed => None,
        }
    }

    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }
}

/// Handle to a spawned worker.
///
/// Dropping the handle terminates the worker.
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    pid: Option<u32>,
    state: WorkerState,
    kill: Option<oneshot::Sender<()>>,
    exit: oneshot::Receiver<WorkerExit>,
}

impl WorkerProcess {
    /// Starts the worker, writes `input_line` to its stdin and closes it.
    ///
    /// Completed stdout/stderr lines are forwarded to `lines` as they arrive.
    pub(crate) async fn spawn(
        worker: &WorkerCommand,
        input_line: &str,
        lines: mpsc::Sender<WorkerLine>,
    ) -> Result<Self, SessionError> {
        let mut command = Command::new(&worker.program);
        command
            .args(&worker.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = worker.working_dir.as_ref() {
            command.current_dir(dir);
        }
        for (key, value) in &worker.env {
            command.env(key, value);
        }

        let mut child = spawn_with_retry(&mut command, Path::new(&worker.program))?;
        let pid = child.id();
        let mut state = WorkerState::Spawned;
        debug!(pid, program = ?worker.program, ?state, "worker spawned");

        let mut stdin = child.stdin.take().ok_or(SessionError::StdinUnavailable)?;
        let mut input = input_line.as_bytes().to_vec();
        input.push(b'\n');
        if let Err(source) = stdin.write_all(&input).await {
            if source.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(SessionError::StdinWrite(source));
            }
        }
        drop(stdin);
        state = WorkerState::Running;

        let stdout = child.stdout.take().ok_or(SessionError::StdoutUnavailable)?;
        let stderr = child.stderr.take().ok_or(SessionError::StderrUnavailable)?;
        tokio::spawn(forward_lines(stdout, OutputStream::Stdout, lines.clone()));
        tokio::spawn(forward_lines(stderr, OutputStream::Stderr, lines));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(supervise(child, kill_rx, exit_tx));

        Ok(Self {
            pid,
            state,
            kill: Some(kill_tx),
            exit: exit_rx,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    /// Resolves once, when the worker terminates. Must not be awaited again afterwards.
    pub(crate) async fn exited(&mut self) -> WorkerExit {
        let exit = match (&mut self.exit).await {
            Ok(exit) => exit,
            Err(_) => WorkerExit::Exited { code: None },
        };
        self.state = match exit {
            WorkerExit::Exited { code } => WorkerState::Exited(code),
            WorkerExit::Killed => WorkerState::Killed,
        };
        exit
    }

    /// Forcibly terminates the worker.
    pub(crate) fn cancel(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn supervise(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: oneshot::Sender<WorkerExit>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => WorkerExit::Exited { code: status.code() },
            Err(err) => {
                warn!(error = %err, "failed waiting for worker");
                WorkerExit::Exited { code: None }
            }
        },
        _ = kill => {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill worker");
            }
            WorkerExit::Killed
        }
    };
    let _ = exit.send(outcome);
}

/// Splits a worker output stream into lines with the same discipline as line-delimited
/// files: trailing partial data is held until the next chunk and flushed at end of stream.
async fn forward_lines<R>(mut reader: R, stream: OutputStream, lines: mpsc::Sender<WorkerLine>)
where
    R: AsyncRead + Unpin,
{
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(?stream, error = %err, "failed reading worker output");
                break;
            }
        };
        pending.extend_from_slice(&chunk[..n]);

        let ScanOutput {
            records, remainder, ..
        } = scan(&pending, RecordShape::Lines);
        let rest = remainder.to_vec();
        if !send_lines(&lines, stream, records).await {
            return;
        }
        pending = rest;
    }

    let (records, _) = finish(&pending, RecordShape::Lines);
    send_lines(&lines, stream, records).await;
}

async fn send_lines(
    lines: &mpsc::Sender<WorkerLine>,
    stream: OutputStream,
    records: Vec<Record>,
) -> bool {
    for record in records {
        if let Record::Text(line) = record {
            if lines.send(WorkerLine { stream, line }).await.is_err() {
                return false;
            }
        }
    }
    true
}

pub(crate) fn spawn_with_retry(command: &mut Command, binary: &Path) -> Result<Child, SessionError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                if is_text_file_busy(&source) && attempt < 4 {
                    std::thread::sleep(backoff);
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(SessionError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }

    unreachable!("spawn_with_retry should return before exhausting retries")
}

/// `ETXTBSY`: the binary was written moments ago and another process still holds it open.
fn is_text_file_busy(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(26)
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::is_text_file_busy;

    #[test]
    fn only_etxtbsy_counts_as_busy() {
        assert!(is_text_file_busy(&io::Error::from_raw_os_error(26)));
        assert!(!is_text_file_busy(&io::Error::from_raw_os_error(2)));
        assert!(!is_text_file_busy(&io::Error::new(io::ErrorKind::Other, "busy")));
    }
}
