use std::{
    collections::BTreeMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use serde::Serialize;
use tail_events::ChannelKey;
use thiserror::Error;
use time::OffsetDateTime;

/// Identifier assigned by a [`JobStore`] when a session's job record is created.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetadata {
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
}

/// The persisted record of one scrape session.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub target: String,
    pub status: JobStatus,
    pub files: BTreeMap<ChannelKey, PathBuf>,
    pub metadata: JobMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fields supplied when a session creates its job record.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub owner: String,
    pub target: String,
    pub start_time: OffsetDateTime,
}

/// Side effects a session applies to its job record.
///
/// Each update touches its own fields, so concurrent updates from path discovery and
/// termination never overwrite each other.
#[derive(Clone, Debug, PartialEq)]
pub enum JobUpdate {
    /// A monitored file was observed for the first time.
    FileDiscovered { key: ChannelKey, path: PathBuf },
    /// The worker exited.
    Finished {
        status: JobStatus,
        end_time: OffsetDateTime,
        error: Option<String>,
    },
    /// The client went away before the worker finished.
    Cancelled {
        end_time: OffsetDateTime,
        error: String,
    },
}

impl Job {
    pub fn from_new(id: JobId, new: NewJob) -> Self {
        Self {
            id,
            owner: new.owner,
            target: new.target,
            status: JobStatus::Running,
            files: BTreeMap::new(),
            metadata: JobMetadata {
                start_time: Some(new.start_time),
                end_time: None,
            },
            error: None,
        }
    }

    pub fn apply(&mut self, update: JobUpdate) {
        match update {
            JobUpdate::FileDiscovered { key, path } => {
                self.files.insert(key, path);
            }
            JobUpdate::Finished {
                status,
                end_time,
                error,
            } => {
                self.status = status;
                self.metadata.end_time = Some(end_time);
                self.error = error;
            }
            JobUpdate::Cancelled { end_time, error } => {
                self.status = JobStatus::Failed;
                self.metadata.end_time = Some(end_time);
                self.error = Some(error);
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job `{0}` not found")]
    NotFound(JobId),
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence collaborator for job records.
///
/// Sessions call into the store from their single coordinating task; implementations that
/// talk to a remote database should hand the write off rather than block.
pub trait JobStore: Send + Sync + 'static {
    fn create(&self, job: NewJob) -> Result<JobId, JobStoreError>;
    fn update(&self, id: &JobId, update: JobUpdate) -> Result<(), JobStoreError>;
}

/// Process-local [`JobStore`] keeping every record in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<InMemoryState>>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_id: u64,
    jobs: BTreeMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.inner.lock().ok()?.jobs.get(id).cloned()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner
            .lock()
            .map(|state| state.jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Unavailable("job store lock poisoned".to_string()))
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let mut state = self.state()?;
        state.next_id += 1;
        let id = JobId::new(format!("job-{}", state.next_id));
        state.jobs.insert(id.clone(), Job::from_new(id.clone(), job));
        Ok(id)
    }

    fn update(&self, id: &JobId, update: JobUpdate) -> Result<(), JobStoreError> {
        let mut state = self.state()?;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobStoreError::NotFound(id.clone()))?;
        job.apply(update);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    fn new_job() -> NewJob {
        NewJob {
            owner: "user-1".to_string(),
            target: "alice".to_string(),
            start_time: datetime!(2024-05-01 10:00 UTC),
        }
    }

    #[test]
    fn created_jobs_start_running() {
        let store = InMemoryJobStore::default();
        let id = store.create(new_job()).unwrap();
        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(
            job.metadata.start_time,
            Some(datetime!(2024-05-01 10:00 UTC))
        );
        assert!(job.files.is_empty());
        assert_ne!(store.create(new_job()).unwrap(), id);
    }

    #[test]
    fn discovery_and_termination_touch_disjoint_fields() {
        let store = InMemoryJobStore::default();
        let id = store.create(new_job()).unwrap();
        let key = ChannelKey::new("comments").unwrap();

        store
            .update(
                &id,
                JobUpdate::Finished {
                    status: JobStatus::Failed,
                    end_time: datetime!(2024-05-01 10:05 UTC),
                    error: Some("Process exited with code 1".to_string()),
                },
            )
            .unwrap();
        store
            .update(
                &id,
                JobUpdate::FileDiscovered {
                    key: key.clone(),
                    path: PathBuf::from("/out/alice_comments.json"),
                },
            )
            .unwrap();

        let job = store.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Process exited with code 1"));
        assert_eq!(
            job.files.get(&key),
            Some(&PathBuf::from("/out/alice_comments.json"))
        );
    }

    #[test]
    fn cancellation_marks_job_failed() {
        let mut job = Job::from_new(JobId::new("j"), new_job());
        job.apply(JobUpdate::Cancelled {
            end_time: datetime!(2024-05-01 10:01 UTC),
            error: "Client disconnected".to_string(),
        });
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Client disconnected"));
    }

    #[test]
    fn unknown_job_is_reported() {
        let store = InMemoryJobStore::default();
        let err = store
            .update(
                &JobId::new("missing"),
                JobUpdate::Cancelled {
                    end_time: datetime!(2024-05-01 10:01 UTC),
                    error: "x".to_string(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(id) if id.as_str() == "missing"));
    }

    #[test]
    fn serializes_with_external_field_names() {
        let mut job = Job::from_new(JobId::new("job-1"), new_job());
        job.apply(JobUpdate::FileDiscovered {
            key: ChannelKey::new("leads").unwrap(),
            path: PathBuf::from("/out/alice_leads.txt"),
        });
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], json!("running"));
        assert_eq!(value["files"]["leads"], json!("/out/alice_leads.txt"));
        assert_eq!(
            value["metadata"]["startTime"],
            json!("2024-05-01T10:00:00Z")
        );
        assert_eq!(value["metadata"]["endTime"], json!(null));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn status_serializes_to_the_three_job_states() {
        let names: Vec<_> = [JobStatus::Running, JobStatus::Completed, JobStatus::Failed]
            .into_iter()
            .map(|status| serde_json::to_value(status).unwrap())
            .collect();
        assert_eq!(
            names,
            vec![json!("running"), json!("completed"), json!("failed")]
        );
    }
}
