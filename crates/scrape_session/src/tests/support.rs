use std::fs as std_fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::*;

pub(super) const POLL: Duration = Duration::from_millis(50);
pub(super) const GRACE: Duration = Duration::from_millis(150);
const STREAM_DEADLINE: Duration = Duration::from_secs(10);

fn write_executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std_fs::write(&path, script).unwrap();
    let mut perms = std_fs::metadata(&path).unwrap().permissions();
    #[cfg(unix)]
    {
        perms.set_mode(0o755);
    }
    std_fs::set_permissions(&path, perms).unwrap();
    path
}

/// Writes a shell worker that runs with `dir` as its working directory and `out/` as the
/// output directory.
pub(super) fn write_fake_worker(dir: &Path, script: &str) -> PathBuf {
    write_executable(dir, "worker.sh", script)
}

pub(super) fn fast_session(dir: &Path, worker: &Path) -> ScrapeSession {
    ScrapeSession::builder()
        .program(worker)
        .args(Vec::<String>::new())
        .working_dir(dir)
        .output_dir("out")
        .poll_interval(POLL)
        .grace_period(GRACE)
        .build()
        .unwrap()
}

pub(super) fn stores() -> (Arc<InMemoryJobStore>, Arc<dyn JobStore>) {
    let store = Arc::new(InMemoryJobStore::default());
    let shared: Arc<dyn JobStore> = store.clone();
    (store, shared)
}

/// Reads events until the stream ends.
pub(super) async fn collect_events(events: &mut EventStream) -> Vec<StreamEvent> {
    let mut collected = Vec::new();
    while let Some(event) = tokio::time::timeout(STREAM_DEADLINE, events.next_event())
        .await
        .expect("event stream stalled")
    {
        collected.push(event);
    }
    collected
}

/// Reads events until one matches `predicate`, returning everything read so far.
pub(super) async fn events_until(
    events: &mut EventStream,
    predicate: impl Fn(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    let mut collected = Vec::new();
    loop {
        let event = tokio::time::timeout(STREAM_DEADLINE, events.next_event())
            .await
            .expect("event stream stalled")
            .expect("stream ended early");
        let done = predicate(&event);
        collected.push(event);
        if done {
            return collected;
        }
    }
}

pub(super) fn data_for<'a>(events: &'a [StreamEvent], channel: &str) -> Vec<&'a Record> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Data { file, data } if file.as_str() == channel => Some(data),
            _ => None,
        })
        .collect()
}

pub(super) fn completes(events: &[StreamEvent]) -> usize {
    events.iter().filter(|event| event.is_terminal()).count()
}
