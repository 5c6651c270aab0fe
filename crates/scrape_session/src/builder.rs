use std::{collections::BTreeMap, ffi::OsString, path::PathBuf, time::Duration};

use tail_events::ScanLimits;

use crate::{
    catalog::{default_channels, ensure_unique, ChannelSpec},
    defaults::{
        default_program, DEFAULT_EVENT_BUFFER, DEFAULT_GRACE_PERIOD, DEFAULT_OUTPUT_DIR,
        DEFAULT_POLL_INTERVAL, DEFAULT_SCRIPT, UNBUFFERED_ENV,
    },
    process::WorkerCommand,
    ScrapeSession, SessionError,
};

#[derive(Debug, Clone)]
pub struct ScrapeSessionBuilder {
    pub(crate) program: Option<OsString>,
    pub(crate) args: Option<Vec<OsString>>,
    pub(crate) working_dir: Option<PathBuf>,
    pub(crate) output_dir: PathBuf,
    pub(crate) env: BTreeMap<String, String>,
    pub(crate) channels: Option<Vec<ChannelSpec>>,
    pub(crate) poll_interval: Duration,
    pub(crate) grace_period: Duration,
    pub(crate) event_buffer: usize,
    pub(crate) limits: ScanLimits,
}

impl Default for ScrapeSessionBuilder {
    fn default() -> Self {
        Self {
            program: None,
            args: None,
            working_dir: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            env: BTreeMap::new(),
            channels: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            event_buffer: DEFAULT_EVENT_BUFFER,
            limits: ScanLimits::default(),
        }
    }
}

impl ScrapeSessionBuilder {
    /// Worker executable. Defaults to `$SCRAPE_WORKER_BINARY` or `python3`.
    pub fn program(mut self, program: impl Into<OsString>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Appends one worker argument. The first call replaces the default `main.py`.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.get_or_insert_with(Vec::new).push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Directory holding the worker's output files. Relative paths follow `working_dir`.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds a monitored file. The first call replaces the default catalog.
    pub fn channel(mut self, channel: ChannelSpec) -> Self {
        self.channels.get_or_insert_with(Vec::new).push(channel);
        self
    }

    pub fn channels(mut self, channels: impl IntoIterator<Item = ChannelSpec>) -> Self {
        self.channels = Some(channels.into_iter().collect());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn scan_limits(mut self, limits: ScanLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn build(mut self) -> Result<ScrapeSession, SessionError> {
        // Python workers buffer stdout when piped; callers may override explicitly.
        self.env
            .entry(UNBUFFERED_ENV.to_string())
            .or_insert_with(|| "1".to_string());

        let channels = self.channels.unwrap_or_else(default_channels);
        ensure_unique(&channels)?;

        Ok(ScrapeSession {
            worker: WorkerCommand {
                program: self.program.unwrap_or_else(default_program),
                args: self
                    .args
                    .unwrap_or_else(|| vec![OsString::from(DEFAULT_SCRIPT)]),
                working_dir: self.working_dir,
                env: self.env,
            },
            output_dir: self.output_dir,
            channels,
            poll_interval: self.poll_interval,
            grace_period: self.grace_period,
            event_buffer: self.event_buffer,
            limits: self.limits,
        })
    }
}
