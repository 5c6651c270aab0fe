use std::{sync::Arc, time::Duration};

use tail_events::{ChannelKey, EventSender, Record, SinkError, StreamEvent};
use time::OffsetDateTime;
use tokio::{
    sync::{mpsc, Notify},
    time::{self as tokio_time, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    defaults::{exit_error, DISCONNECTED_ERROR, FAILURE_MESSAGE, KILL_WAIT, SUCCESS_MESSAGE},
    job::{JobId, JobStatus, JobStore, JobUpdate},
    process::{OutputStream, WorkerExit, WorkerLine, WorkerProcess},
    scheduler::{Activity, Discovered, TailScheduler},
    session::SessionEnd,
};

/// Lifecycle of a running session.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Phase {
    /// Worker running, files polled on every tick.
    Active,
    /// Worker exited; waiting out the grace period before the final read.
    Draining,
    /// Terminal event sent or stream torn down.
    Closed,
}

/// Why the coordinator stopped before reaching `Closed` on its own.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Interrupt {
    Cancelled,
    Disconnected,
}

impl From<SinkError> for Interrupt {
    fn from(_: SinkError) -> Self {
        Self::Disconnected
    }
}

enum Step {
    Interrupted(Interrupt),
    Line(Option<WorkerLine>),
    Exited(WorkerExit),
    Scheduler(Activity),
    GraceElapsed,
}

/// Owns every piece of session state: the sink, the cursors, the worker and the job record.
///
/// All event sources race inside one task, so job updates and sink writes never interleave
/// and teardown cannot be overtaken by a late event.
pub(crate) struct DrainCoordinator {
    phase: Phase,
    job_id: JobId,
    store: Arc<dyn JobStore>,
    events: EventSender,
    scheduler: TailScheduler,
    worker: WorkerProcess,
    lines: mpsc::Receiver<WorkerLine>,
    lines_open: bool,
    cancel: Arc<Notify>,
    grace: Duration,
}

impl DrainCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_id: JobId,
        store: Arc<dyn JobStore>,
        events: EventSender,
        scheduler: TailScheduler,
        worker: WorkerProcess,
        lines: mpsc::Receiver<WorkerLine>,
        cancel: Arc<Notify>,
        grace: Duration,
    ) -> Self {
        Self {
            phase: Phase::Active,
            job_id,
            store,
            events,
            scheduler,
            worker,
            lines,
            lines_open: true,
            cancel,
            grace,
        }
    }

    pub(crate) async fn run(mut self) -> SessionEnd {
        let exit = match self.active().await {
            Ok(exit) => exit,
            Err(interrupt) => return self.teardown(interrupt).await,
        };

        self.phase = Phase::Draining;
        self.scheduler.stop();
        let code = exit.code();
        info!(job = %self.job_id, ?code, "worker exited; draining");
        self.record_exit(code);

        match self.drain(code).await {
            Ok(()) => {
                self.phase = Phase::Closed;
                SessionEnd::Finished { code }
            }
            Err(interrupt) => self.teardown(interrupt).await,
        }
    }

    async fn active(&mut self) -> Result<WorkerExit, Interrupt> {
        loop {
            let lines_open = self.lines_open;
            let step = tokio::select! {
                biased;
                () = self.cancel.notified() => Step::Interrupted(Interrupt::Cancelled),
                () = self.events.disconnected() => Step::Interrupted(Interrupt::Disconnected),
                // Ticks and reads outrank worker output so a chatty worker cannot stall polling.
                activity = self.scheduler.next_activity() => Step::Scheduler(activity),
                line = self.lines.recv(), if lines_open => Step::Line(line),
                exit = self.worker.exited() => Step::Exited(exit),
            };

            match step {
                Step::Interrupted(interrupt) => return Err(interrupt),
                Step::Line(line) => self.forward_line(line).await?,
                Step::Exited(exit) => return Ok(exit),
                Step::Scheduler(activity) => self.handle_activity(activity).await?,
                Step::GraceElapsed => {}
            }
        }
    }

    /// Grace period, then the final unconditional read, then the single terminal event.
    async fn drain(&mut self, code: Option<i32>) -> Result<(), Interrupt> {
        let deadline = Instant::now() + self.grace;
        loop {
            let lines_open = self.lines_open;
            let step = tokio::select! {
                biased;
                () = self.cancel.notified() => Step::Interrupted(Interrupt::Cancelled),
                () = self.events.disconnected() => Step::Interrupted(Interrupt::Disconnected),
                activity = self.scheduler.next_activity() => Step::Scheduler(activity),
                line = self.lines.recv(), if lines_open => Step::Line(line),
                () = tokio_time::sleep_until(deadline) => Step::GraceElapsed,
            };

            match step {
                Step::Interrupted(interrupt) => return Err(interrupt),
                Step::Line(line) => self.forward_line(line).await?,
                Step::Scheduler(activity) => self.handle_activity(activity).await?,
                Step::GraceElapsed => break,
                Step::Exited(_) => {}
            }
        }

        let report = self.scheduler.drain().await;
        self.record_discoveries(report.discovered);
        let drained = report.records.len();
        self.emit_records(report.records).await?;

        while let Ok(line) = self.lines.try_recv() {
            self.forward_line(Some(line)).await?;
        }

        let message = if code == Some(0) {
            SUCCESS_MESSAGE
        } else {
            FAILURE_MESSAGE
        };
        self.events
            .send(StreamEvent::complete(code, message))
            .await?;
        info!(job = %self.job_id, ?code, drained, "session complete");
        Ok(())
    }

    async fn handle_activity(&mut self, activity: Activity) -> Result<(), Interrupt> {
        match activity {
            Activity::Tick => {
                let discovered = self.scheduler.tick().await;
                self.record_discoveries(discovered);
                Ok(())
            }
            Activity::Read(done) => {
                let records = self.scheduler.complete(done);
                self.emit_records(records).await
            }
        }
    }

    async fn forward_line(&mut self, line: Option<WorkerLine>) -> Result<(), Interrupt> {
        let Some(WorkerLine { stream, line }) = line else {
            self.lines_open = false;
            return Ok(());
        };
        let event = match stream {
            OutputStream::Stdout => StreamEvent::log(line),
            OutputStream::Stderr => StreamEvent::error(line),
        };
        self.events.send(event).await?;
        Ok(())
    }

    async fn emit_records(&mut self, records: Vec<(ChannelKey, Record)>) -> Result<(), Interrupt> {
        for (key, record) in records {
            self.events.send(StreamEvent::data(key, record)).await?;
        }
        Ok(())
    }

    fn record_discoveries(&self, discovered: Vec<Discovered>) {
        for Discovered { key, path } in discovered {
            debug!(job = %self.job_id, channel = %key, path = %path.display(), "output file found");
            self.update_job(JobUpdate::FileDiscovered { key, path });
        }
    }

    fn record_exit(&self, code: Option<i32>) {
        let (status, error) = if code == Some(0) {
            (JobStatus::Completed, None)
        } else {
            (JobStatus::Failed, Some(exit_error(code)))
        };
        self.update_job(JobUpdate::Finished {
            status,
            end_time: OffsetDateTime::now_utc(),
            error,
        });
    }

    fn update_job(&self, update: JobUpdate) {
        if let Err(err) = self.store.update(&self.job_id, update) {
            warn!(job = %self.job_id, error = %err, "job update failed");
        }
    }

    /// Stops everything at once: no event is written after the sink is closed here.
    async fn teardown(mut self, interrupt: Interrupt) -> SessionEnd {
        let phase = self.phase;
        self.events.close();
        self.scheduler.shutdown();
        self.lines.close();
        self.phase = Phase::Closed;

        info!(job = %self.job_id, ?interrupt, ?phase, "session interrupted");
        if phase == Phase::Active {
            self.worker.cancel();
            self.update_job(JobUpdate::Cancelled {
                end_time: OffsetDateTime::now_utc(),
                error: DISCONNECTED_ERROR.to_string(),
            });
            match tokio_time::timeout(KILL_WAIT, self.worker.exited()).await {
                Ok(exit) => debug!(pid = ?self.worker.pid(), ?exit, "worker stopped"),
                Err(_) => warn!(
                    pid = ?self.worker.pid(),
                    state = ?self.worker.state(),
                    "worker did not stop in time"
                ),
            }
        }

        SessionEnd::Disconnected { phase }
    }
}
