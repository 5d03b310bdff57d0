//! # Job Registry
//!
//! Process-wide table of generation jobs. The registry is created once at
//! startup and cloned into every handler; clones share the same table.
//!
//! Each write replaces a job's whole state while holding the map shard lock,
//! so a reader sees either the old state or the new one, never a mix (for
//! example `completed` without its URL). Transitions are checked against the
//! lifecycle table; a write that would leave a terminal state is rejected.
//!
//! Poll tasks are supervised here: the registry keeps each task's
//! `JoinHandle` and a cancellation token derived from the registry-wide
//! shutdown token.

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Job, JobKind, JobState, JobStatus};
use crate::config::Config;
use crate::error::ProxyError;

/// Failed transition attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {id} cannot move from {from} to {to}")]
    Invalid {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// # Registry Configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a finished job stays queryable.
    pub ttl: Duration,
    /// Cap on non-terminal jobs; 0 disables the cap.
    pub max_active_jobs: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_active_jobs: 0,
        }
    }
}

impl From<&Config> for RegistryConfig {
    fn from(config: &Config) -> Self {
        Self {
            ttl: config.job_ttl(),
            max_active_jobs: config.max_active_jobs,
        }
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn active(&self) -> usize {
        self.pending + self.processing
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Finished poll tasks whose handles were dropped.
    pub reaped: usize,
    /// Jobs failed because their poll task died before a terminal write.
    pub orphaned: usize,
    /// Expired terminal jobs removed.
    pub evicted: usize,
}

struct JobRecord {
    id: String,
    kind: JobKind,
    state: JobState,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
    finished_at: Option<Instant>,
}

impl JobRecord {
    fn new(id: String, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    fn snapshot(&self) -> Job {
        let (result_url, error) = match &self.state {
            JobState::Completed { url, .. } => (Some(url.clone()), None),
            JobState::Failed { error, .. } => (None, Some(error.clone())),
            _ => (None, None),
        };
        Job {
            id: self.id.clone(),
            kind: self.kind,
            status: self.state.status(),
            tracking_handle: self.state.handle().map(str::to_string),
            result_url,
            error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn expired(&self, ttl: Duration, now: Instant) -> bool {
        self.finished_at
            .map(|at| now.saturating_duration_since(at) >= ttl)
            .unwrap_or(false)
    }
}

struct JobTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    jobs: DashMap<String, JobRecord>,
    tasks: DashMap<String, JobTask>,
    sequence: AtomicU64,
    config: RegistryConfig,
    shutdown: CancellationToken,
}

/// # Job Registry
///
/// Cheap to clone; all clones share one table.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl JobRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: DashMap::new(),
                tasks: DashMap::new(),
                sequence: AtomicU64::new(0),
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(RegistryConfig::from(config))
    }

    /// Insert a new `pending` job and return its identifier.
    ///
    /// Identifiers combine the creation millisecond, a process-wide sequence
    /// number and a random suffix, so they stay unique across any number of
    /// calls within the same millisecond.
    pub fn create(&self, kind: JobKind) -> String {
        loop {
            let id = self.next_id(kind);
            match self.inner.jobs.entry(id.clone()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(JobRecord::new(id.clone(), kind));
                    debug!(job_id = %id, %kind, "job created");
                    return id;
                }
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
            }
        }
    }

    /// Like [`create`](Self::create), but refuses when the active-job cap is reached.
    ///
    /// The cap is soft: concurrent callers may overshoot it by a few jobs.
    pub fn try_create(&self, kind: JobKind) -> Result<String, ProxyError> {
        let cap = self.inner.config.max_active_jobs;
        if cap > 0 {
            let active = self.counts().active();
            if active >= cap {
                warn!(active, cap, "rejecting {} job: too many jobs in flight", kind);
                return Err(ProxyError::Busy(format!(
                    "Too many generation jobs in progress ({} of {}). Please retry once some finish.",
                    active, cap
                )));
            }
        }
        Ok(self.create(kind))
    }

    fn next_id(&self, kind: JobKind) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
            .take(6)
            .collect::<String>()
            .to_ascii_lowercase();
        format!("{}_{}_{:x}{}", kind.id_prefix(), millis, seq, suffix)
    }

    /// Snapshot of one job.
    pub fn get(&self, id: &str) -> Option<Job> {
        self.inner.jobs.get(id).map(|record| record.snapshot())
    }

    /// Snapshots of every job, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.jobs.iter().map(|r| r.snapshot()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.jobs.is_empty()
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for record in self.inner.jobs.iter() {
            match record.state.status() {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// `pending → processing`, recording the upstream tracking handle.
    pub fn mark_processing(&self, id: &str, handle: &str) -> Result<Job, TransitionError> {
        self.transition(id, JobState::Processing {
            handle: handle.to_string(),
        })
    }

    /// `processing → completed` with the located artifact URL.
    pub fn complete(&self, id: &str, url: &str) -> Result<Job, TransitionError> {
        self.transition(id, JobState::Completed {
            handle: String::new(),
            url: url.to_string(),
        })
    }

    /// `pending | processing → failed`.
    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<Job, TransitionError> {
        self.transition(id, JobState::Failed {
            handle: None,
            error: error.into(),
        })
    }

    fn transition(&self, id: &str, mut next: JobState) -> Result<Job, TransitionError> {
        let mut record = self
            .inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| TransitionError::NotFound(id.to_string()))?;

        let to = next.status();
        if !record.state.allows(to) {
            return Err(TransitionError::Invalid {
                id: id.to_string(),
                from: record.state.status(),
                to,
            });
        }

        // Keep the tracking handle through terminal states.
        match &mut next {
            JobState::Failed { handle, .. } if handle.is_none() => {
                *handle = record.state.handle().map(str::to_string);
            }
            JobState::Completed { handle, .. } if handle.is_empty() => {
                if let Some(current) = record.state.handle() {
                    *handle = current.to_string();
                }
            }
            _ => {}
        }

        record.state = next;
        record.updated_at = Utc::now();
        if to.is_terminal() {
            record.finished_at = Some(Instant::now());
        }

        let snapshot = record.snapshot();
        drop(record);

        match to {
            JobStatus::Failed => info!(
                job_id = %id,
                error = snapshot.error.as_deref().unwrap_or_default(),
                "job failed"
            ),
            JobStatus::Completed => info!(
                job_id = %id,
                url = snapshot.result_url.as_deref().unwrap_or_default(),
                "job completed"
            ),
            _ => debug!(job_id = %id, status = %to, "job updated"),
        }
        Ok(snapshot)
    }

    /// Spawn `work` as the supervised background task for job `id`.
    ///
    /// `work` receives a token that is cancelled when the job is cancelled or
    /// the registry shuts down.
    pub fn supervise<F, Fut>(&self, id: &str, work: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.shutdown.child_token();
        let handle = tokio::spawn(work(token.clone()));
        if let Some(previous) = self.inner.tasks.insert(id.to_string(), JobTask { token, handle }) {
            warn!(job_id = %id, "replacing an existing poll task");
            previous.token.cancel();
        }
    }

    /// Whether a live background task is attached to `id`.
    pub fn has_task(&self, id: &str) -> bool {
        self.inner
            .tasks
            .get(id)
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel a job that has not finished yet.
    ///
    /// The job becomes `failed` before its poll task is told to stop, so any
    /// late write from the task is rejected by the transition check.
    pub fn cancel(&self, id: &str) -> Result<Job, ProxyError> {
        let job = self.fail(id, "Job cancelled").map_err(|err| match err {
            TransitionError::NotFound(_) => ProxyError::NotFound(format!("Job {} not found", id)),
            TransitionError::Invalid { from, .. } => {
                ProxyError::Conflict(format!("Job {} already {}", id, from))
            }
        })?;

        if let Some((_, task)) = self.inner.tasks.remove(id) {
            task.token.cancel();
        }
        info!(job_id = %id, "job cancelled");
        Ok(job)
    }

    /// Reap finished poll tasks and evict expired terminal jobs.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let finished: Vec<String> = self
            .inner
            .tasks
            .iter()
            .filter(|task| task.handle.is_finished())
            .map(|task| task.key().clone())
            .collect();

        for id in finished {
            let Some((_, task)) = self.inner.tasks.remove(&id) else {
                continue;
            };
            report.reaped += 1;

            if let Some(Err(join_err)) = task.handle.now_or_never() {
                if join_err.is_panic() {
                    error!(job_id = %id, "poll task panicked");
                }
            }

            let still_active = self
                .get(&id)
                .map(|job| !job.status.is_terminal())
                .unwrap_or(false);
            if still_active && self.fail(&id, "Background poller stopped unexpectedly").is_ok() {
                report.orphaned += 1;
            }
        }

        let ttl = self.inner.config.ttl;
        let now = Instant::now();
        let before = self.inner.jobs.len();
        self.inner.jobs.retain(|_, record| !record.expired(ttl, now));
        report.evicted = before.saturating_sub(self.inner.jobs.len());

        if report.evicted > 0 || report.orphaned > 0 {
            info!(
                evicted = report.evicted,
                orphaned = report.orphaned,
                remaining = self.inner.jobs.len(),
                "job registry swept"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` until shutdown.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep();
                    }
                }
            }
            debug!("job sweeper stopped");
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop every poll task and fail the jobs they were tracking.
    ///
    /// Tasks get `grace` to observe cancellation before they are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();

        let ids: Vec<String> = self.inner.tasks.iter().map(|t| t.key().clone()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, task)) = self.inner.tasks.remove(&id) {
                handles.push(task.handle);
            }
        }

        let count = handles.len();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures_util::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("poll tasks did not stop within {:?}, aborting", grace);
            for abort in aborts {
                abort.abort();
            }
        }

        let active: Vec<String> = self
            .inner
            .jobs
            .iter()
            .filter(|r| !r.state.status().is_terminal())
            .map(|r| r.id.clone())
            .collect();
        for id in &active {
            let _ = self.fail(id, "Server shutting down before the job finished");
        }
        info!(tasks = count, interrupted = active.len(), "job registry shut down");
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_within_one_millisecond() {
        let registry = JobRegistry::default();
        let ids: HashSet<String> = (0..10_000).map(|_| registry.create(JobKind::Image)).collect();
        assert_eq!(ids.len(), 10_000);
        assert_eq!(registry.len(), 10_000);
        assert!(ids.iter().all(|id| id.starts_with("img_")));
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let registry = JobRegistry::default();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..500).map(|_| registry.create(JobKind::Video)).collect::<Vec<_>>()
                })
            })
            .collect();
        let ids: HashSet<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 4000);
    }

    #[test]
    fn test_happy_path_transitions() {
        let registry = JobRegistry::default();
        let id = registry.create(JobKind::Image);
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Pending);

        let job = registry.mark_processing(&id, "prompt-1").unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.tracking_handle.as_deref(), Some("prompt-1"));
        assert!(job.result_url.is_none());

        let job = registry.complete(&id, "http://comfy/view?filename=a.png").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_url.as_deref(), Some("http://comfy/view?filename=a.png"));
        assert_eq!(job.tracking_handle.as_deref(), Some("prompt-1"));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let registry = JobRegistry::default();
        let id = registry.create(JobKind::Video);
        registry.fail(&id, "CogVideo is not running").unwrap();

        assert!(matches!(
            registry.mark_processing(&id, "t"),
            Err(TransitionError::Invalid { from: JobStatus::Failed, .. })
        ));
        assert!(registry.complete(&id, "/videos/x.mp4").is_err());
        assert!(registry.fail(&id, "again").is_err());

        let first = registry.get(&id).unwrap();
        let second = registry.get(&id).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.error.as_deref(), Some("CogVideo is not running"));
        assert!(first.result_url.is_none());
    }

    #[test]
    fn test_pending_cannot_complete() {
        let registry = JobRegistry::default();
        let id = registry.create(JobKind::Image);
        assert!(registry.complete(&id, "u").is_err());
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn test_unknown_job() {
        let registry = JobRegistry::default();
        assert!(registry.get("img_0_missing").is_none());
        assert_eq!(
            registry.fail("img_0_missing", "x"),
            Err(TransitionError::NotFound("img_0_missing".into()))
        );
    }

    #[test]
    fn test_active_cap() {
        let registry = JobRegistry::new(RegistryConfig {
            ttl: Duration::from_secs(60),
            max_active_jobs: 2,
        });
        let a = registry.try_create(JobKind::Image).unwrap();
        registry.try_create(JobKind::Image).unwrap();
        assert!(matches!(registry.try_create(JobKind::Image), Err(ProxyError::Busy(_))));

        registry.fail(&a, "done").unwrap();
        assert!(registry.try_create(JobKind::Image).is_ok());
    }

    #[test]
    fn test_sweep_evicts_only_expired_terminal_jobs() {
        let registry = JobRegistry::new(RegistryConfig {
            ttl: Duration::ZERO,
            max_active_jobs: 0,
        });
        let finished = registry.create(JobKind::Image);
        let running = registry.create(JobKind::Image);
        registry.fail(&finished, "x").unwrap();
        registry.mark_processing(&running, "p").unwrap();

        let report = registry.sweep();
        assert_eq!(report.evicted, 1);
        assert!(registry.get(&finished).is_none());
        assert!(registry.get(&running).is_some());
    }

    #[test]
    fn test_counts() {
        let registry = JobRegistry::default();
        let a = registry.create(JobKind::Image);
        let b = registry.create(JobKind::Video);
        registry.create(JobKind::Video);
        registry.mark_processing(&a, "p").unwrap();
        registry.fail(&b, "x").unwrap();

        let counts = registry.counts();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.active(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_task_and_fails_job() {
        let registry = JobRegistry::default();
        let id = registry.create(JobKind::Video);
        registry.mark_processing(&id, "task-1").unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        registry.supervise(&id, move |token| async move {
            token.cancelled().await;
            let _ = tx.send(());
        });

        let job = registry.cancel(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Job cancelled"));
        rx.await.unwrap();

        assert!(matches!(registry.cancel(&id), Err(ProxyError::Conflict(_))));
        assert!(matches!(registry.cancel("nope"), Err(ProxyError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_sweep_fails_orphaned_jobs() {
        let registry = JobRegistry::default();
        let id = registry.create(JobKind::Image);
        registry.mark_processing(&id, "p").unwrap();

        // A task that exits without writing a terminal state.
        registry.supervise(&id, |_token| async {});
        for _ in 0..50 {
            if !registry.has_task(&id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = registry.sweep();
        assert_eq!(report.reaped, 1);
        assert_eq!(report.orphaned, 1);
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_fails_active_jobs() {
        let registry = JobRegistry::default();
        let id = registry.create(JobKind::Image);
        registry.mark_processing(&id, "p").unwrap();
        registry.supervise(&id, |token| async move { token.cancelled().await });

        registry.shutdown(Duration::from_secs(1)).await;

        assert!(registry.is_shutting_down());
        let job = registry.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("shutting down"));
    }
}
