use std::{future::Future, path::PathBuf, pin::Pin, sync::Arc, time::Duration};

use tail_events::{event_channel, EventSender, EventStream, ScanLimits, StreamEvent};
use time::OffsetDateTime;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::{
    builder::ScrapeSessionBuilder,
    catalog::{resolve, ChannelSpec, TargetName},
    defaults::{CONNECTED_MESSAGE, START_FAILED_MESSAGE, WORKER_LINE_BUFFER},
    drain::{DrainCoordinator, Phase},
    job::{JobId, JobStatus, JobStore, JobUpdate, NewJob},
    process::{WorkerCommand, WorkerProcess},
    scheduler::TailScheduler,
    SessionError,
};

/// A configured scrape session template. Each [`ScrapeSession::start`] runs one worker.
#[derive(Debug, Clone)]
pub struct ScrapeSession {
    pub(crate) worker: WorkerCommand,
    pub(crate) output_dir: PathBuf,
    pub(crate) channels: Vec<ChannelSpec>,
    pub(crate) poll_interval: Duration,
    pub(crate) grace_period: Duration,
    pub(crate) event_buffer: usize,
    pub(crate) limits: ScanLimits,
}

/// Who asked for a session and what the worker should scrape.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub target: String,
    pub owner: String,
}

impl SessionRequest {
    pub fn new(target: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            owner: owner.into(),
        }
    }
}

/// Streaming surface of a started session.
///
/// `events` yields events in emission order and ends after `complete` or teardown.
/// Dropping `events` counts as a client disconnect.
pub struct SessionRun {
    pub events: EventStream,
    pub cancel: CancelHandle,
    pub completion: DynSessionCompletion,
}

/// Type-erased future that resolves once the session has fully stopped.
pub type DynSessionCompletion =
    Pin<Box<dyn Future<Output = Result<SessionOutcome, SessionError>> + Send>>;

/// Requests teardown of a running session, as if the client had disconnected.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    notify: Arc<Notify>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    /// `None` when the job record could not be created.
    pub job_id: Option<JobId>,
    pub end: SessionEnd,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    /// The worker exited and the `complete` event was delivered.
    Finished { code: Option<i32> },
    /// The client went away or cancelled; no `complete` event was sent.
    Disconnected { phase: Phase },
    /// The job record could not be created or the worker could not be started.
    StartFailed { message: String },
}

impl SessionEnd {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Finished { code } => *code,
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == Some(0)
    }
}

impl ScrapeSession {
    pub fn builder() -> ScrapeSessionBuilder {
        ScrapeSessionBuilder::default()
    }

    pub fn worker(&self) -> &WorkerCommand {
        &self.worker
    }

    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    /// Directory the output files are resolved in; relative paths follow the worker's
    /// working directory.
    pub fn output_dir(&self) -> PathBuf {
        match self.worker.working_dir.as_ref() {
            Some(dir) if self.output_dir.is_relative() => dir.join(&self.output_dir),
            _ => self.output_dir.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Validates the request and starts the session on the current Tokio runtime.
    ///
    /// The first event is always `connected`. A failure to create the job record or to
    /// spawn the worker is reported as a single `error` event, after which the stream ends.
    pub fn start(
        &self,
        request: SessionRequest,
        store: Arc<dyn JobStore>,
    ) -> Result<SessionRun, SessionError> {
        let target = TargetName::new(&request.target)?;
        let (events, stream) = event_channel(self.event_buffer);
        let notify = Arc::new(Notify::new());

        let handle = tokio::spawn(run_session(
            self.clone(),
            target,
            request.owner,
            store,
            events,
            Arc::clone(&notify),
        ));

        Ok(SessionRun {
            events: stream,
            cancel: CancelHandle { notify },
            completion: Box::pin(async move { handle.await.map_err(SessionError::from) }),
        })
    }
}

async fn run_session(
    session: ScrapeSession,
    target: TargetName,
    owner: String,
    store: Arc<dyn JobStore>,
    mut events: EventSender,
    cancel: Arc<Notify>,
) -> SessionOutcome {
    if events
        .send(StreamEvent::connected(CONNECTED_MESSAGE))
        .await
        .is_err()
    {
        return SessionOutcome {
            job_id: None,
            end: SessionEnd::Disconnected {
                phase: Phase::Active,
            },
        };
    }

    let job_id = match store.create(NewJob {
        owner,
        target: target.as_str().to_string(),
        start_time: OffsetDateTime::now_utc(),
    }) {
        Ok(id) => id,
        Err(err) => {
            warn!(target_name = target.as_str(), error = %err, "job record could not be created");
            return SessionOutcome {
                job_id: None,
                end: fail_start(&mut events, &SessionError::from(err)).await,
            };
        }
    };
    info!(job = %job_id, target_name = target.as_str(), "session started");

    let output_dir = session.output_dir();
    if let Err(source) = tokio::fs::create_dir_all(&output_dir).await {
        let err = SessionError::PrepareOutputDirectory {
            path: output_dir,
            source,
        };
        return start_failed(&*store, job_id, &mut events, err).await;
    }

    let (lines_tx, lines_rx) = mpsc::channel(WORKER_LINE_BUFFER);
    let worker = match WorkerProcess::spawn(&session.worker, target.as_str(), lines_tx).await {
        Ok(worker) => worker,
        Err(err) => return start_failed(&*store, job_id, &mut events, err).await,
    };

    let scheduler = TailScheduler::new(
        resolve(&session.channels, &target, &output_dir),
        session.poll_interval,
        session.limits,
    );
    let end = DrainCoordinator::new(
        job_id.clone(),
        store,
        events,
        scheduler,
        worker,
        lines_rx,
        cancel,
        session.grace_period,
    )
    .run()
    .await;

    SessionOutcome {
        job_id: Some(job_id),
        end,
    }
}

async fn start_failed(
    store: &dyn JobStore,
    job_id: JobId,
    events: &mut EventSender,
    err: SessionError,
) -> SessionOutcome {
    warn!(job = %job_id, error = %err, "worker could not be started");
    if let Err(update_err) = store.update(
        &job_id,
        JobUpdate::Finished {
            status: JobStatus::Failed,
            end_time: OffsetDateTime::now_utc(),
            error: Some(err.to_string()),
        },
    ) {
        warn!(job = %job_id, error = %update_err, "job update failed");
    }
    SessionOutcome {
        job_id: Some(job_id),
        end: fail_start(events, &err).await,
    }
}

async fn fail_start(events: &mut EventSender, err: &SessionError) -> SessionEnd {
    let message = format!("{START_FAILED_MESSAGE}: {err}");
    // The stream ends either way.
    let _ = events.send(StreamEvent::error(message.clone())).await;
    events.close();
    SessionEnd::StartFailed { message }
}
