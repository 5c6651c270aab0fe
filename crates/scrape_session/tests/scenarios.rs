#![cfg(unix)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures_util::StreamExt;
use scrape_session::{
    ChannelSpec, InMemoryJobStore, JobStatus, Record, ScrapeSession, SessionEnd, SessionRequest,
    StreamEvent,
};
use serde_json::json;

fn worker(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("worker.sh");
    fs::write(&path, format!("#!/bin/sh\nread target\ncd out\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn session(dir: &Path, worker: &Path) -> ScrapeSession {
    ScrapeSession::builder()
        .program(worker)
        .args(Vec::<String>::new())
        .working_dir(dir)
        .output_dir("out")
        .channel(ChannelSpec::new("followers", "{target}_followers.txt").unwrap())
        .channel(ChannelSpec::new("comments", "{target}_comments.json").unwrap())
        .poll_interval(Duration::from_millis(50))
        .grace_period(Duration::from_millis(200))
        .build()
        .unwrap()
}

async fn run_to_end(body: &str) -> (Vec<StreamEvent>, SessionEnd, JobStatus) {
    let dir = tempfile::tempdir().unwrap();
    let session = session(dir.path(), &worker(dir.path(), body));
    let store = Arc::new(InMemoryJobStore::default());

    let run = session
        .start(SessionRequest::new("alice", "owner"), store.clone())
        .unwrap();
    let events: Vec<_> = tokio::time::timeout(Duration::from_secs(10), run.events.collect())
        .await
        .expect("session finished");
    let outcome = run.completion.await.unwrap();
    let job = store.get(outcome.job_id.as_ref().unwrap()).unwrap();
    (events, outcome.end, job.status)
}

fn data(events: &[StreamEvent]) -> Vec<(String, Record)> {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Data { file, data } => Some((file.to_string(), data.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn text_file_growing_between_ticks_yields_each_line_once() {
    let (events, end, status) = run_to_end(
        "printf 'alice\\n' >> \"${target}_followers.txt\"\nsleep 0.3\nprintf 'bob\\n' >> \"${target}_followers.txt\"\nsleep 0.3\n",
    )
    .await;

    assert_eq!(
        data(&events),
        vec![
            ("followers".to_string(), Record::Text("alice".into())),
            ("followers".to_string(), Record::Text("bob".into())),
        ]
    );
    assert_eq!(end, SessionEnd::Finished { code: Some(0) });
    assert_eq!(status, JobStatus::Completed);
}

#[tokio::test]
async fn json_objects_written_in_separate_chunks() {
    let (events, _, _) = run_to_end(
        "printf '{\"a\":1}' >> \"${target}_comments.json\"\nsleep 0.3\nprintf '{\"b\":2}' >> \"${target}_comments.json\"\n",
    )
    .await;

    assert_eq!(
        data(&events),
        vec![
            ("comments".to_string(), Record::Object(json!({"a": 1}))),
            ("comments".to_string(), Record::Object(json!({"b": 2}))),
        ]
    );
}

#[tokio::test]
async fn brace_inside_string_is_not_a_boundary() {
    let (events, _, _) =
        run_to_end("printf '{\"a\": \"x}y\"}' >> \"${target}_comments.json\"\n").await;

    assert_eq!(
        data(&events),
        vec![("comments".to_string(), Record::Object(json!({"a": "x}y"})))]
    );
}

#[tokio::test]
async fn unterminated_object_at_exit_is_dropped() {
    let (events, end, status) =
        run_to_end("printf '{\"a\":1' >> \"${target}_comments.json\"\nexit 1\n").await;

    assert!(data(&events).is_empty());
    assert_eq!(
        events.last(),
        Some(&StreamEvent::complete(Some(1), "Scraping failed"))
    );
    assert_eq!(end.exit_code(), Some(1));
    assert_eq!(status, JobStatus::Failed);
}

#[tokio::test]
async fn disconnect_mid_session_stops_everything() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("out").join("worker.pid");
    let session = session(
        dir.path(),
        &worker(
            dir.path(),
            "echo $$ > worker.pid\nprintf 'alice\\n' >> \"${target}_followers.txt\"\nexec sleep 30\n",
        ),
    );
    let store = Arc::new(InMemoryJobStore::default());

    let mut run = session
        .start(SessionRequest::new("alice", "owner"), store.clone())
        .unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), run.events.next())
            .await
            .expect("first record")
            .expect("stream open");
        if matches!(event, StreamEvent::Data { .. }) {
            break;
        }
    }
    drop(run.events);

    let outcome = tokio::time::timeout(Duration::from_secs(10), run.completion)
        .await
        .expect("teardown finished")
        .unwrap();
    assert!(matches!(outcome.end, SessionEnd::Disconnected { .. }));

    let job = store.get(outcome.job_id.as_ref().unwrap()).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Client disconnected"));

    let pid = fs::read_to_string(&pid_file).unwrap();
    let alive = std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .status()
        .unwrap()
        .success();
    assert!(!alive, "worker {pid} still running");
}
