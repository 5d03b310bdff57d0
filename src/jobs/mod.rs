//! # Generation Jobs
//!
//! A job is one outstanding image or video generation request. Its lifecycle
//! only moves forward:
//!
//! ```text
//! pending ──submit ok──▶ processing ──artifact located──▶ completed
//!    │                       │
//!    └──submit failed──▶ failed ◀──upstream failure / timeout / cancel
//! ```
//!
//! [`JobRegistry`] owns every job and hands out [`Job`] snapshots;
//! [`JobRunner`] drives submission and the per-job poll loop.

pub mod poller;
pub mod registry;

pub use poller::{poll_job, JobRunner, PollPolicy, PollReport};
pub use registry::{JobCounts, JobRegistry, RegistryConfig, SweepReport, TransitionError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a job generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Image,
    Video,
}

impl JobKind {
    /// Prefix of identifiers issued for this kind.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            JobKind::Image => "img",
            JobKind::Video => "vid",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Image => "image",
            JobKind::Video => "video",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal job state. The result URL only exists on `Completed` and the
/// error only on `Failed`, so no snapshot can pair them with another status.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JobState {
    Pending,
    Processing { handle: String },
    Completed { handle: String, url: String },
    Failed { handle: Option<String>, error: String },
}

impl JobState {
    pub(crate) fn status(&self) -> JobStatus {
        match self {
            JobState::Pending => JobStatus::Pending,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub(crate) fn handle(&self) -> Option<&str> {
        match self {
            JobState::Pending => None,
            JobState::Processing { handle } | JobState::Completed { handle, .. } => Some(handle),
            JobState::Failed { handle, .. } => handle.as_deref(),
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub(crate) fn allows(&self, next: JobStatus) -> bool {
        matches!(
            (self.status(), next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// # Job Snapshot
///
/// A copy of a job's state at one instant. Mutating it has no effect on the
/// registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
