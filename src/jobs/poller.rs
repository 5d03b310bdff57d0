//! # Job Poller
//!
//! Submission and polling for generation jobs.
//!
//! [`JobRunner::start`] creates the job and hands it to a supervised task that
//! submits it upstream and then polls it. `start` waits for the submission
//! outcome, so a failed submission is already visible as `failed` when it
//! returns. [`poll_job`] is the polling half of that task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{JobKind, JobRegistry, JobStatus};
use crate::config::Config;
use crate::error::ProxyError;
use crate::generation::{GenerationBackend, GenerationRequest, UpstreamStatus};

/// # Poll Policy
///
/// Interval between status checks and the number of checks allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn for_kind(config: &Config, kind: JobKind) -> Self {
        match kind {
            JobKind::Image => Self::new(config.poll_interval(), config.image_poll_attempts),
            JobKind::Video => Self::new(config.poll_interval(), config.video_poll_attempts),
        }
    }

    /// Total time the budget covers, ignoring request latency.
    pub fn budget(&self) -> Duration {
        self.interval
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX)
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    /// Status checks actually sent upstream.
    pub attempts: u32,
    /// Terminal status written by the loop, or `None` if it stopped early
    /// (cancelled, or the job was finished by someone else).
    pub outcome: Option<JobStatus>,
}

/// Poll `handle` until the job reaches a terminal state, the attempt budget
/// runs out, or `cancel` fires.
///
/// Each attempt waits one interval, then queries the backend once. Transient
/// query errors are logged and count as an attempt.
pub async fn poll_job(
    registry: &JobRegistry,
    backend: &dyn GenerationBackend,
    policy: PollPolicy,
    id: &str,
    handle: &str,
    cancel: &CancellationToken,
) -> PollReport {
    let name = backend.name();
    let mut attempts = 0;
    let mut artifact_missing = false;

    while attempts < policy.max_attempts {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job_id = %id, attempts, "poll loop cancelled");
                return PollReport { attempts, outcome: None };
            }
            _ = tokio::time::sleep(policy.interval) => {}
        }

        attempts += 1;
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job_id = %id, attempts, "poll loop cancelled mid-request");
                return PollReport { attempts, outcome: None };
            }
            status = backend.check(handle) => status,
        };

        match status {
            Ok(UpstreamStatus::Running) => {
                debug!(job_id = %id, attempt = attempts, "{} job still running", name);
            }
            Ok(UpstreamStatus::Succeeded(outputs)) => match backend.locator().locate(&outputs) {
                Some(url) => {
                    let outcome = registry.complete(id, &url).ok().map(|job| job.status);
                    return PollReport { attempts, outcome };
                }
                None => {
                    if !artifact_missing {
                        warn!(job_id = %id, "{} reported success without a {} output", name, backend.kind());
                    }
                    artifact_missing = true;
                }
            },
            Ok(UpstreamStatus::Failed(message)) => {
                let outcome = registry.fail(id, message).ok().map(|job| job.status);
                return PollReport { attempts, outcome };
            }
            Err(err) => {
                warn!(job_id = %id, attempt = attempts, error = %err, "{} status check failed", name);
            }
        }
    }

    let message = if artifact_missing {
        format!(
            "{} reported the job finished but no {} output was found",
            name,
            backend.kind()
        )
    } else {
        format!(
            "{} generation timed out after {} status checks",
            capitalize(backend.kind().as_str()),
            attempts
        )
    };
    let outcome = registry.fail(id, message).ok().map(|job| job.status);
    PollReport { attempts, outcome }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// # Job Runner
///
/// Binds a backend to the registry and a poll policy.
#[derive(Clone)]
pub struct JobRunner {
    registry: JobRegistry,
    backend: Arc<dyn GenerationBackend>,
    policy: PollPolicy,
}

impl JobRunner {
    pub fn new(registry: JobRegistry, backend: Arc<dyn GenerationBackend>, policy: PollPolicy) -> Self {
        Self {
            registry,
            backend,
            policy,
        }
    }

    /// Create a job, submit it, and start polling.
    ///
    /// Submission and polling run in one supervised task, so a caller that
    /// goes away mid-submit cannot strand the job in `pending`. The returned
    /// future resolves once the upstream has accepted or refused the work.
    /// When the submission fails the job is already `failed` in the registry
    /// and the classified error is returned; no polling happens.
    pub async fn start(&self, request: GenerationRequest) -> Result<String, ProxyError> {
        let id = self.registry.try_create(self.backend.kind())?;
        let (accepted_tx, accepted_rx) = oneshot::channel::<Result<(), ProxyError>>();

        let runner = self.clone();
        let job_id = id.clone();
        self.registry.supervise(&id, move |cancel| async move {
            let submitted = tokio::select! {
                _ = cancel.cancelled() => Err(runner.stop_pending(&job_id)),
                result = runner.submit(&job_id, &request) => result,
            };
            let handle = match submitted {
                Ok(handle) => {
                    if accepted_tx.send(Ok(())).is_err() {
                        debug!(job_id = %job_id, "caller left before submission finished");
                    }
                    handle
                }
                Err(err) => {
                    let _ = accepted_tx.send(Err(err));
                    return;
                }
            };

            let report = poll_job(
                &runner.registry,
                runner.backend.as_ref(),
                runner.policy,
                &job_id,
                &handle,
                &cancel,
            )
            .await;
            debug!(job_id = %job_id, attempts = report.attempts, outcome = ?report.outcome, "poll loop finished");
        });

        match accepted_rx.await {
            Ok(result) => result.map(|()| id),
            Err(_) => Err(ProxyError::Internal(format!(
                "Submission task for job {} stopped unexpectedly",
                id
            ))),
        }
    }

    /// Submit job `id` upstream and move it to `processing`, or to `failed`.
    pub async fn submit(&self, id: &str, request: &GenerationRequest) -> Result<String, ProxyError> {
        match self.backend.submit(request).await {
            Ok(handle) => match self.registry.mark_processing(id, &handle) {
                Ok(_) => {
                    info!(job_id = %id, handle = %handle, "{} job submitted", self.backend.kind());
                    Ok(handle)
                }
                Err(err) => {
                    warn!(
                        job_id = %id,
                        handle = %handle,
                        error = %err,
                        "job stopped while submitting; {} work is no longer tracked",
                        self.backend.name()
                    );
                    Err(self.interrupted(id))
                }
            },
            Err(err) => {
                warn!(job_id = %id, error = %err, "{} submission failed", self.backend.name());
                let _ = self.registry.fail(id, err.to_string());
                Err(err)
            }
        }
    }

    /// Fail a job whose task was cancelled before the upstream answered.
    fn stop_pending(&self, id: &str) -> ProxyError {
        let reason = if self.registry.is_shutting_down() {
            "Server shutting down before the job finished"
        } else {
            "Job cancelled"
        };
        let _ = self.registry.fail(id, reason);
        self.interrupted(id)
    }

    fn interrupted(&self, id: &str) -> ProxyError {
        let reason = self
            .registry
            .get(id)
            .and_then(|job| job.error)
            .unwrap_or_else(|| "Job cancelled".to_string());
        ProxyError::Conflict(format!("{}: job {} stopped before submission finished", reason, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ResultLocator;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct PathLocator;

    impl ResultLocator for PathLocator {
        fn locate(&self, outputs: &Value) -> Option<String> {
            outputs.get("path").and_then(Value::as_str).map(|p| format!("/out/{}", p))
        }
    }

    /// Replays scripted statuses; once the script runs out it keeps answering `Running`.
    struct ScriptedBackend {
        submit_ok: bool,
        submit_delay: Duration,
        script: Mutex<VecDeque<Result<UpstreamStatus, ProxyError>>>,
        checks: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<UpstreamStatus, ProxyError>>) -> Arc<Self> {
            Arc::new(Self {
                submit_ok: true,
                submit_delay: Duration::ZERO,
                script: Mutex::new(script.into()),
                checks: AtomicU32::new(0),
            })
        }

        fn slow(delay: Duration, script: Vec<Result<UpstreamStatus, ProxyError>>) -> Arc<Self> {
            Arc::new(Self {
                submit_ok: true,
                submit_delay: delay,
                script: Mutex::new(script.into()),
                checks: AtomicU32::new(0),
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self {
                submit_ok: false,
                submit_delay: Duration::ZERO,
                script: Mutex::new(VecDeque::new()),
                checks: AtomicU32::new(0),
            })
        }

        fn checks(&self) -> u32 {
            self.checks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "Scripted"
        }

        fn kind(&self) -> JobKind {
            JobKind::Image
        }

        async fn submit(&self, _request: &GenerationRequest) -> Result<String, ProxyError> {
            tokio::time::sleep(self.submit_delay).await;
            if self.submit_ok {
                Ok("handle-1".to_string())
            } else {
                Err(ProxyError::Unreachable {
                    backend: "Scripted".into(),
                    url: "http://127.0.0.1:1".into(),
                    message: "Scripted is not running".into(),
                })
            }
        }

        async fn check(&self, _handle: &str) -> Result<UpstreamStatus, ProxyError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(UpstreamStatus::Running))
        }

        fn locator(&self) -> &dyn ResultLocator {
            &PathLocator
        }
    }

    fn fast(max_attempts: u32) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), max_attempts)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn processing_job(registry: &JobRegistry) -> String {
        let id = registry.create(JobKind::Image);
        registry.mark_processing(&id, "handle-1").unwrap();
        id
    }

    #[tokio::test]
    async fn test_running_then_success_takes_n_plus_one_attempts() {
        let registry = JobRegistry::default();
        let id = processing_job(&registry);
        let mut script: Vec<_> = (0..3).map(|_| Ok(UpstreamStatus::Running)).collect();
        script.push(Ok(UpstreamStatus::Succeeded(json!({"path": "a.png"}))));
        let backend = ScriptedBackend::new(script);

        let report = poll_job(&registry, backend.as_ref(), fast(10), &id, "handle-1", &CancellationToken::new()).await;

        assert_eq!(report.attempts, 4);
        assert_eq!(backend.checks(), 4);
        assert_eq!(report.outcome, Some(JobStatus::Completed));
        let job = registry.get(&id).unwrap();
        assert_eq!(job.result_url.as_deref(), Some("/out/a.png"));
    }

    #[tokio::test]
    async fn test_budget_exhausted_fails_with_timeout() {
        let registry = JobRegistry::default();
        let id = processing_job(&registry);
        let backend = ScriptedBackend::new(Vec::new());

        let report = poll_job(&registry, backend.as_ref(), fast(5), &id, "handle-1", &CancellationToken::new()).await;

        assert_eq!(backend.checks(), 5);
        assert_eq!(report.outcome, Some(JobStatus::Failed));
        let job = registry.get(&id).unwrap();
        assert!(job.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_upstream_failure_stops_polling() {
        let registry = JobRegistry::default();
        let id = processing_job(&registry);
        let backend = ScriptedBackend::new(vec![
            Ok(UpstreamStatus::Running),
            Ok(UpstreamStatus::Failed("out of memory".into())),
        ]);

        let report = poll_job(&registry, backend.as_ref(), fast(10), &id, "handle-1", &CancellationToken::new()).await;

        assert_eq!(report.attempts, 2);
        assert_eq!(registry.get(&id).unwrap().error.as_deref(), Some("out of memory"));
    }

    #[tokio::test]
    async fn test_transient_errors_count_as_attempts() {
        let registry = JobRegistry::default();
        let id = processing_job(&registry);
        let backend = ScriptedBackend::new(vec![
            Err(ProxyError::Upstream("connection reset".into())),
            Ok(UpstreamStatus::Succeeded(json!({"path": "b.png"}))),
        ]);

        let report = poll_job(&registry, backend.as_ref(), fast(10), &id, "handle-1", &CancellationToken::new()).await;

        assert_eq!(report.attempts, 2);
        assert_eq!(report.outcome, Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_success_without_artifact_keeps_polling_then_fails() {
        let registry = JobRegistry::default();
        let id = processing_job(&registry);
        let backend = ScriptedBackend::new(
            (0..3).map(|_| Ok(UpstreamStatus::Succeeded(json!({})))).collect(),
        );

        let report = poll_job(&registry, backend.as_ref(), fast(3), &id, "handle-1", &CancellationToken::new()).await;

        assert_eq!(report.attempts, 3);
        let job = registry.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("no image output"));
        assert!(job.result_url.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_loop_writes_nothing() {
        let registry = JobRegistry::default();
        let id = processing_job(&registry);
        let backend = ScriptedBackend::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let policy = PollPolicy::new(Duration::from_secs(60), 10);
        let report = poll_job(&registry, backend.as_ref(), policy, &id, "handle-1", &cancel).await;

        assert_eq!(report, PollReport { attempts: 0, outcome: None });
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_failed_submission_is_visible_before_start_returns() {
        let registry = JobRegistry::default();
        let backend = ScriptedBackend::refusing();
        let runner = JobRunner::new(registry.clone(), backend.clone(), fast(5));

        let err = runner
            .start(GenerationRequest::image("a cat", 512, 512))
            .await
            .unwrap_err();
        assert!(err.is_unreachable());

        let jobs = registry.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].error.as_deref().unwrap().contains("not running"));
        wait_until(|| !registry.has_task(&jobs[0].id)).await;
        assert_eq!(backend.checks(), 0);
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let registry = JobRegistry::default();
        let backend = ScriptedBackend::new(vec![
            Ok(UpstreamStatus::Running),
            Ok(UpstreamStatus::Succeeded(json!({"path": "c.png"}))),
        ]);
        let runner = JobRunner::new(registry.clone(), backend, fast(10));

        let id = runner.start(GenerationRequest::image("a dog", 512, 512)).await.unwrap();
        assert_eq!(registry.get(&id).unwrap().tracking_handle.as_deref(), Some("handle-1"));

        for _ in 0..200 {
            if registry.get(&id).unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.get(&id).unwrap().result_url.as_deref(), Some("/out/c.png"));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_strand_job() {
        let registry = JobRegistry::default();
        let backend = ScriptedBackend::slow(
            Duration::from_millis(100),
            vec![Ok(UpstreamStatus::Succeeded(json!({"path": "d.png"})))],
        );
        let runner = JobRunner::new(registry.clone(), backend, fast(10));

        let started = tokio::time::timeout(
            Duration::from_millis(20),
            runner.start(GenerationRequest::image("a fox", 512, 512)),
        )
        .await;
        assert!(started.is_err());

        let id = registry.list()[0].id.clone();
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Pending);
        wait_until(|| registry.get(&id).unwrap().status.is_terminal()).await;

        let job = registry.get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_url.as_deref(), Some("/out/d.png"));
    }

    #[tokio::test]
    async fn test_cancel_during_submission() {
        let registry = JobRegistry::default();
        let backend = ScriptedBackend::slow(Duration::from_millis(200), Vec::new());
        let runner = JobRunner::new(registry.clone(), backend.clone(), fast(10));

        let pending = tokio::spawn({
            let runner = runner.clone();
            async move { runner.start(GenerationRequest::image("an owl", 512, 512)).await }
        });
        wait_until(|| !registry.is_empty()).await;
        let id = registry.list()[0].id.clone();
        registry.cancel(&id).unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::Conflict(_)));
        assert!(err.to_string().starts_with("Job cancelled"));

        let job = registry.get(&id).unwrap();
        assert_eq!(job.error.as_deref(), Some("Job cancelled"));
        assert!(job.tracking_handle.is_none());
        assert_eq!(backend.checks(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_cancel_reports_cancellation() {
        let registry = JobRegistry::default();
        let runner = JobRunner::new(registry.clone(), ScriptedBackend::new(Vec::new()), fast(5));
        let id = registry.create(JobKind::Video);
        registry.cancel(&id).unwrap();

        let err = runner
            .submit(&id, &GenerationRequest::video("waves", 8))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            format!("Job cancelled: job {} stopped before submission finished", id)
        );
        assert_eq!(registry.get(&id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_budget_saturates() {
        let policy = PollPolicy::new(Duration::MAX, 3);
        assert_eq!(policy.budget(), Duration::MAX);
        assert_eq!(fast(4).budget(), Duration::from_millis(4));
    }
}
