use std::{
    collections::{btree_map::Entry, BTreeMap},
    io,
    path::PathBuf,
    time::Duration,
};

use tail_events::{ChannelKey, Record, ScanLimits};
use tokio::{
    fs,
    task::JoinSet,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    catalog::WatchedChannel,
    cursor::{read_from, FileCursor},
};

/// A monitored file seen on disk for the first time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Discovered {
    pub(crate) key: ChannelKey,
    pub(crate) path: PathBuf,
}

#[derive(Debug)]
pub(crate) struct ReadDone {
    key: ChannelKey,
    result: io::Result<Vec<u8>>,
}

pub(crate) enum Activity {
    Tick,
    Read(ReadDone),
}

/// Records produced by the final drain, in catalog order.
#[derive(Debug, Default)]
pub(crate) struct DrainReport {
    pub(crate) discovered: Vec<Discovered>,
    pub(crate) records: Vec<(ChannelKey, Record)>,
}

/// Periodically checks every watched file for growth and reads new bytes in the background.
///
/// Reads of different files run concurrently; each cursor's guard keeps at most one read of
/// the same file outstanding.
pub(crate) struct TailScheduler {
    channels: Vec<WatchedChannel>,
    cursors: BTreeMap<ChannelKey, FileCursor>,
    reads: JoinSet<ReadDone>,
    ticker: Option<Interval>,
    limits: ScanLimits,
}

impl TailScheduler {
    pub(crate) fn new(channels: Vec<WatchedChannel>, period: Duration, limits: ScanLimits) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            channels,
            cursors: BTreeMap::new(),
            reads: JoinSet::new(),
            ticker: Some(ticker),
            limits,
        }
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self, key: &ChannelKey) -> Option<&FileCursor> {
        self.cursors.get(key)
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Stops periodic ticks. Reads already in flight still complete.
    pub(crate) fn stop(&mut self) {
        self.ticker = None;
    }

    /// Stops ticks and abandons in-flight reads without advancing their cursors.
    pub(crate) fn shutdown(&mut self) {
        self.stop();
        self.reads.abort_all();
        for cursor in self.cursors.values_mut() {
            cursor.abort_read();
        }
    }

    /// Waits for the next tick or the next finished read, whichever comes first.
    pub(crate) async fn next_activity(&mut self) -> Activity {
        let has_reads = !self.reads.is_empty();
        tokio::select! {
            Some(done) = join_read(&mut self.reads), if has_reads => Activity::Read(done),
            () = next_tick(&mut self.ticker) => Activity::Tick,
        }
    }

    /// Stats every watched file and starts a read for each one that grew.
    pub(crate) async fn tick(&mut self) -> Vec<Discovered> {
        let mut discovered = Vec::new();

        for channel in &self.channels {
            let size = match fs::metadata(&channel.path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => continue,
                Err(err) => {
                    if err.kind() != io::ErrorKind::NotFound {
                        debug!(
                            channel = %channel.key,
                            path = %channel.path.display(),
                            error = %err,
                            "stat failed; retrying next tick"
                        );
                    }
                    continue;
                }
            };

            let cursor = match self.cursors.entry(channel.key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    discovered.push(Discovered {
                        key: channel.key.clone(),
                        path: channel.path.clone(),
                    });
                    entry.insert(FileCursor::with_shape(
                        channel.key.clone(),
                        channel.path.clone(),
                        channel.shape,
                    ))
                }
            };

            if !cursor.should_read(size) {
                continue;
            }

            let request = cursor.begin_read();
            debug!(
                channel = %request.key,
                offset = request.offset,
                size,
                "file grew; reading"
            );
            self.reads.spawn(async move {
                let result = read_from(&request.path, request.offset, None).await;
                ReadDone {
                    key: request.key,
                    result,
                }
            });
        }

        discovered
    }

    /// Applies a finished read to its cursor and returns the records it completed.
    pub(crate) fn complete(&mut self, done: ReadDone) -> Vec<(ChannelKey, Record)> {
        let ReadDone { key, result } = done;
        let Some(cursor) = self.cursors.get_mut(&key) else {
            return Vec::new();
        };

        match result {
            Ok(bytes) => {
                let records = cursor.complete_read(&bytes, &self.limits);
                debug!(
                    channel = %key,
                    bytes = bytes.len(),
                    records = records.len(),
                    offset = cursor.offset(),
                    "read complete"
                );
                records.into_iter().map(|record| (key.clone(), record)).collect()
            }
            Err(err) => {
                warn!(
                    channel = %key,
                    path = %cursor.path().display(),
                    error = %err,
                    "read failed; retrying next tick"
                );
                cursor.abort_read();
                Vec::new()
            }
        }
    }

    /// Final unconditional pass: reads every file from its offset to its current size.
    ///
    /// Outstanding reads are abandoned first; they never advanced their cursors, so the drain
    /// covers their bytes.
    pub(crate) async fn drain(&mut self) -> DrainReport {
        self.shutdown();
        while self.reads.join_next().await.is_some() {}

        let mut report = DrainReport::default();
        for channel in &self.channels {
            let size = match fs::metadata(&channel.path).await {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => continue,
                Err(err) => {
                    if err.kind() != io::ErrorKind::NotFound {
                        warn!(
                            channel = %channel.key,
                            path = %channel.path.display(),
                            error = %err,
                            "stat failed during final drain"
                        );
                    }
                    continue;
                }
            };

            let cursor = match self.cursors.entry(channel.key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    report.discovered.push(Discovered {
                        key: channel.key.clone(),
                        path: channel.path.clone(),
                    });
                    entry.insert(FileCursor::with_shape(
                        channel.key.clone(),
                        channel.path.clone(),
                        channel.shape,
                    ))
                }
            };

            let remaining = size.saturating_sub(cursor.offset());
            let bytes = if remaining > 0 {
                match read_from(&channel.path, cursor.offset(), Some(remaining)).await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(
                            channel = %channel.key,
                            path = %channel.path.display(),
                            error = %err,
                            "final read failed"
                        );
                        continue;
                    }
                }
            } else if cursor.pending_len() > 0 {
                Vec::new()
            } else {
                continue;
            };

            let records = cursor.finish(&bytes);
            debug!(
                channel = %channel.key,
                bytes = bytes.len(),
                records = records.len(),
                offset = cursor.offset(),
                "drained"
            );
            report
                .records
                .extend(records.into_iter().map(|record| (channel.key.clone(), record)));
        }

        report
    }
}

async fn join_read(reads: &mut JoinSet<ReadDone>) -> Option<ReadDone> {
    loop {
        match reads.join_next().await? {
            Ok(done) => return Some(done),
            Err(err) if err.is_cancelled() => continue,
            Err(err) => warn!(error = %err, "read task failed"),
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::OpenOptions, io::Write, path::Path};

    use serde_json::json;
    use tail_events::RecordShape;

    use super::*;

    fn watch(dir: &Path, key: &str, file: &str) -> WatchedChannel {
        let path = dir.join(file);
        WatchedChannel {
            key: ChannelKey::new(key).unwrap(),
            shape: RecordShape::from_path(&path),
            path,
        }
    }

    fn append(path: &Path, bytes: &[u8]) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(bytes).unwrap();
    }

    /// Runs one tick and waits for every read it started.
    async fn tick_and_settle(
        scheduler: &mut TailScheduler,
    ) -> (Vec<Discovered>, Vec<(ChannelKey, Record)>) {
        let discovered = scheduler.tick().await;
        let mut records = Vec::new();
        while let Some(done) = join_read(&mut scheduler.reads).await {
            records.extend(scheduler.complete(done));
        }
        (discovered, records)
    }

    fn scheduler(channels: Vec<WatchedChannel>) -> TailScheduler {
        TailScheduler::new(channels, Duration::from_secs(3600), ScanLimits::default())
    }

    #[tokio::test]
    async fn growing_text_file_yields_each_line_once() {
        let dir = tempfile::tempdir().unwrap();
        let channel = watch(dir.path(), "followers", "alice_followers.txt");
        let path = channel.path.clone();
        let key = channel.key.clone();
        let mut scheduler = scheduler(vec![channel]);

        let (discovered, records) = tick_and_settle(&mut scheduler).await;
        assert!(discovered.is_empty());
        assert!(records.is_empty());

        append(&path, b"");
        append(&path, b"alice\n");
        let (discovered, records) = tick_and_settle(&mut scheduler).await;
        assert_eq!(
            discovered,
            vec![Discovered {
                key: key.clone(),
                path: path.clone()
            }]
        );
        assert_eq!(records, vec![(key.clone(), Record::Text("alice".into()))]);

        append(&path, b"bob\n");
        let (discovered, records) = tick_and_settle(&mut scheduler).await;
        assert!(discovered.is_empty());
        assert_eq!(records, vec![(key.clone(), Record::Text("bob".into()))]);
        assert_eq!(scheduler.cursor(&key).unwrap().offset(), 10);

        let (_, records) = tick_and_settle(&mut scheduler).await;
        assert!(records.is_empty(), "no growth, no records");
        assert_eq!(scheduler.cursor(&key).unwrap().offset(), 10);
    }

    #[tokio::test]
    async fn json_objects_split_across_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let channel = watch(dir.path(), "comments", "alice_comments.json");
        let path = channel.path.clone();
        let mut scheduler = scheduler(vec![channel]);

        append(&path, br#"{"a":1}{"b""#);
        let (_, first) = tick_and_settle(&mut scheduler).await;
        append(&path, br#":2}"#);
        let (_, second) = tick_and_settle(&mut scheduler).await;

        let records: Vec<_> = first.into_iter().chain(second).map(|(_, r)| r).collect();
        assert_eq!(
            records,
            vec![
                Record::Object(json!({"a": 1})),
                Record::Object(json!({"b": 2}))
            ]
        );
    }

    #[tokio::test]
    async fn cursor_uses_the_channel_shape() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = watch(dir.path(), "comments", "alice_comments.txt");
        channel.shape = RecordShape::JsonObjects;
        let path = channel.path.clone();
        let key = channel.key.clone();
        let mut scheduler = scheduler(vec![channel]);

        append(&path, b"{\"a\":\n1}\n");
        let (_, records) = tick_and_settle(&mut scheduler).await;
        assert_eq!(records, vec![(key.clone(), Record::Object(json!({"a": 1})))]);
        assert_eq!(
            scheduler.cursor(&key).unwrap().shape(),
            RecordShape::JsonObjects
        );
    }

    #[tokio::test]
    async fn file_under_read_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let channel = watch(dir.path(), "leads", "alice_leads.txt");
        let path = channel.path.clone();
        let key = channel.key.clone();
        let mut scheduler = scheduler(vec![channel]);

        append(&path, b"x\n");
        scheduler.tick().await;
        assert!(scheduler.cursor(&key).unwrap().is_reading());
        scheduler.tick().await;
        assert_eq!(scheduler.reads.len(), 1);
    }

    #[tokio::test]
    async fn failed_read_keeps_offset_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let channel = watch(dir.path(), "leads", "alice_leads.txt");
        let key = channel.key.clone();
        let mut scheduler = scheduler(vec![channel]);
        scheduler.cursors.insert(
            key.clone(),
            FileCursor::new(key.clone(), dir.path().join("alice_leads.txt")),
        );
        scheduler.cursors.get_mut(&key).unwrap().begin_read();

        let records = scheduler.complete(ReadDone {
            key: key.clone(),
            result: Err(io::Error::new(io::ErrorKind::Interrupted, "boom")),
        });
        assert!(records.is_empty());
        let cursor = scheduler.cursor(&key).unwrap();
        assert_eq!(cursor.offset(), 0);
        assert!(!cursor.is_reading());
    }

    #[tokio::test]
    async fn drain_reads_remaining_bytes_and_discovers_late_files() {
        let dir = tempfile::tempdir().unwrap();
        let text = watch(dir.path(), "likes", "alice_likers.txt");
        let json = watch(dir.path(), "leadsRanked", "alice_leads_ranked.json");
        let (text_path, json_path) = (text.path.clone(), json.path.clone());
        let mut scheduler = scheduler(vec![text, json]);

        append(&text_path, b"one\ntw");
        let (_, records) = tick_and_settle(&mut scheduler).await;
        assert_eq!(records.len(), 1);

        append(&text_path, b"o");
        append(&json_path, br#"{"rank":1}{"rank":"#);

        let report = scheduler.drain().await;
        assert!(!scheduler.is_running());
        assert_eq!(report.discovered.len(), 1);
        assert_eq!(report.discovered[0].path, json_path);
        let records: Vec<_> = report.records.into_iter().map(|(_, r)| r).collect();
        assert_eq!(
            records,
            vec![
                Record::Text("two".into()),
                Record::Object(json!({"rank": 1}))
            ]
        );
    }

    #[tokio::test]
    async fn drain_ignores_outstanding_read_guard() {
        let dir = tempfile::tempdir().unwrap();
        let channel = watch(dir.path(), "postid", "alice_postid.txt");
        let path = channel.path.clone();
        let mut scheduler = scheduler(vec![channel]);

        append(&path, b"p1\np2\n");
        scheduler.tick().await;

        let report = scheduler.drain().await;
        let records: Vec<_> = report.records.into_iter().map(|(_, r)| r).collect();
        assert_eq!(
            records,
            vec![Record::Text("p1".into()), Record::Text("p2".into())]
        );
    }
}
