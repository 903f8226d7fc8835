//! Job model and the merge rules shared by the poll and push paths.
//!
//! A [`Job`] is only ever mutated through [`Job::apply`]. Once the job is
//! terminal every further [`StatusUpdate`] is ignored, which is what makes
//! the first terminal signal authoritative regardless of whether it came
//! from a poll response or a push event.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// The kinds of long-running backend jobs the console can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Attack,
    Evaluation,
    Finetuning,
    BatchTest,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Attack,
        JobKind::Evaluation,
        JobKind::Finetuning,
        JobKind::BatchTest,
    ];

    /// Path segment under `/api/` that serves this kind's endpoints.
    pub fn api_prefix(self) -> &'static str {
        match self {
            JobKind::Attack => "attack",
            JobKind::Evaluation => "evaluation",
            JobKind::Finetuning => "finetuning",
            JobKind::BatchTest => "batch-testing",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Attack => "attack",
            JobKind::Evaluation => "evaluation",
            JobKind::Finetuning => "finetuning",
            JobKind::BatchTest => "batch_test",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attack" => Ok(JobKind::Attack),
            "evaluation" => Ok(JobKind::Evaluation),
            "finetuning" => Ok(JobKind::Finetuning),
            "batch_test" | "batch-testing" | "batch" => Ok(JobKind::BatchTest),
            other => Err(CoreError::Validation(format!("Unknown job kind: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Client-side lifecycle status of a monitored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    /// `Completed`, `Failed` and `Aborted` admit no further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted
        )
    }

    /// Map a backend status label onto a client status.
    ///
    /// Unknown labels are treated as still running: the poll loop keeps
    /// going and a later response or push event will settle the outcome.
    pub fn from_label(label: &str) -> JobStatus {
        match label.trim().to_ascii_lowercase().as_str() {
            "completed" | "complete" | "success" | "succeeded" => JobStatus::Completed,
            "failed" | "failure" | "error" => JobStatus::Failed,
            _ => JobStatus::Running,
        }
    }
}

/// Why monitoring of a job was abandoned.
///
/// Both reasons mean the job's real outcome is unknown, not negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Too many consecutive transient failures while polling.
    MonitoringLost,
    /// The status endpoint does not exist for this job (HTTP 404).
    StatusUnsupported,
}

impl AbortReason {
    pub fn description(self) -> &'static str {
        match self {
            AbortReason::MonitoringLost => "monitoring lost, outcome unknown",
            AbortReason::StatusUnsupported => "status reporting unavailable, outcome unknown",
        }
    }
}

// ---------------------------------------------------------------------------
// JobProgress
// ---------------------------------------------------------------------------

/// Counter pairs the backend reports for the various job kinds.
const PROGRESS_PAIRS: [(&str, &str); 4] = [
    ("current_sample", "total_samples"),
    ("current_iteration", "max_iterations"),
    ("current_epoch", "total_epochs"),
    ("completed", "total"),
];

/// Structured, kind-specific progress metrics.
///
/// Backends report either a bare percentage or an object of counters.
/// Both forms are merged last-value-wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobProgress {
    /// Completion percentage (0-100) when the backend reports one.
    pub percent: Option<f64>,
    /// Every other reported metric, keyed by its backend name.
    pub metrics: Map<String, Value>,
}

impl JobProgress {
    /// Merge a raw `progress` value from a status response or push event.
    pub fn merge(&mut self, value: &Value) {
        match value {
            Value::Number(n) => self.percent = n.as_f64(),
            Value::Object(map) => {
                for (key, v) in map {
                    if matches!(key.as_str(), "percent" | "progress") {
                        if let Some(p) = v.as_f64() {
                            self.percent = Some(p);
                            continue;
                        }
                    }
                    self.metrics.insert(key.clone(), v.clone());
                }
            }
            _ => {}
        }
    }

    /// Completion as a fraction in `0.0..=1.0`, if it can be derived.
    ///
    /// An explicit percentage wins over counter pairs.
    pub fn fraction(&self) -> Option<f64> {
        if let Some(p) = self.percent {
            return Some((p / 100.0).clamp(0.0, 1.0));
        }
        PROGRESS_PAIRS.iter().find_map(|(current, total)| {
            let current = self.metrics.get(*current)?.as_f64()?;
            let total = self.metrics.get(*total)?.as_f64()?;
            (total > 0.0).then(|| (current / total).clamp(0.0, 1.0))
        })
    }
}

// ---------------------------------------------------------------------------
// StatusUpdate
// ---------------------------------------------------------------------------

/// A single observation about a job, from either the poll or push path.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: JobStatus,
    pub progress: Option<Value>,
    pub message: Option<String>,
    pub result_ref: Option<String>,
    pub abort_reason: Option<AbortReason>,
}

impl StatusUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: None,
            message: None,
            result_ref: None,
            abort_reason: None,
        }
    }

    pub fn running() -> Self {
        Self::new(JobStatus::Running)
    }

    pub fn completed() -> Self {
        Self::new(JobStatus::Completed)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(JobStatus::Failed).with_message(message)
    }

    pub fn aborted(reason: AbortReason) -> Self {
        Self {
            abort_reason: Some(reason),
            message: Some(reason.description().to_string()),
            ..Self::new(JobStatus::Aborted)
        }
    }

    pub fn with_progress(mut self, progress: Value) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_result_ref(mut self, result_ref: impl Into<String>) -> Self {
        self.result_ref = Some(result_ref.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// What [`Job::apply`] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Non-terminal update merged.
    Progressed,
    /// This update moved the job into a terminal state.
    Terminal,
    /// The job was already terminal; nothing changed.
    Ignored,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Client-side record of one submitted job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress: JobProgress,
    /// Latest server-supplied message (failure reason, stage description).
    pub message: Option<String>,
    /// Identifier used to fetch the final artifact.
    pub result_ref: Option<String>,
    /// Set only when `status` is `Aborted`.
    pub abort_reason: Option<AbortReason>,
    /// The fetched result artifact, once available.
    pub result: Option<Value>,
    /// Why fetching the result artifact failed, if it did.
    pub result_error: Option<String>,
    pub submitted_at: Timestamp,
    pub last_updated_at: Timestamp,
}

impl Job {
    /// A freshly submitted job.
    pub fn new(job_id: impl Into<JobId>, kind: JobKind) -> Self {
        let now = chrono::Utc::now();
        Self {
            job_id: job_id.into(),
            kind,
            status: JobStatus::Submitted,
            progress: JobProgress::default(),
            message: None,
            result_ref: None,
            abort_reason: None,
            result: None,
            result_error: None,
            submitted_at: now,
            last_updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge an update into the job.
    ///
    /// Terminal jobs are immutable: the update is dropped and
    /// [`ApplyOutcome::Ignored`] returned.
    pub fn apply(&mut self, update: StatusUpdate) -> ApplyOutcome {
        if self.is_terminal() {
            return ApplyOutcome::Ignored;
        }

        if let Some(progress) = &update.progress {
            self.progress.merge(progress);
        }
        if update.message.is_some() {
            self.message = update.message;
        }
        if update.result_ref.is_some() {
            self.result_ref = update.result_ref;
        }
        self.last_updated_at = chrono::Utc::now();

        match update.status {
            JobStatus::Submitted => ApplyOutcome::Progressed,
            JobStatus::Running => {
                self.status = JobStatus::Running;
                ApplyOutcome::Progressed
            }
            terminal => {
                self.status = terminal;
                if terminal == JobStatus::Aborted {
                    self.abort_reason = update.abort_reason;
                }
                if terminal == JobStatus::Completed && self.result_ref.is_none() {
                    self.result_ref = Some(self.job_id.clone());
                }
                ApplyOutcome::Terminal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    // -- JobKind --------------------------------------------------------------

    #[test]
    fn api_prefixes_match_backend_routes() {
        assert_eq!(JobKind::Attack.api_prefix(), "attack");
        assert_eq!(JobKind::Evaluation.api_prefix(), "evaluation");
        assert_eq!(JobKind::Finetuning.api_prefix(), "finetuning");
        assert_eq!(JobKind::BatchTest.api_prefix(), "batch-testing");
    }

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("batch-testing".parse::<JobKind>().unwrap(), JobKind::BatchTest);
        assert_eq!(" Attack ".parse::<JobKind>().unwrap(), JobKind::Attack);
        assert_matches!("nope".parse::<JobKind>(), Err(CoreError::Validation(_)));
    }

    // -- JobStatus ------------------------------------------------------------

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Aborted.is_terminal());
    }

    #[test]
    fn labels_map_to_statuses() {
        assert_eq!(JobStatus::from_label("running"), JobStatus::Running);
        assert_eq!(JobStatus::from_label("processing"), JobStatus::Running);
        assert_eq!(JobStatus::from_label("COMPLETED"), JobStatus::Completed);
        assert_eq!(JobStatus::from_label("failed"), JobStatus::Failed);
        assert_eq!(JobStatus::from_label("something-new"), JobStatus::Running);
    }

    // -- JobProgress ----------------------------------------------------------

    #[test]
    fn bare_number_sets_percent() {
        let mut progress = JobProgress::default();
        progress.merge(&json!(42));
        assert_eq!(progress.percent, Some(42.0));
        assert_eq!(progress.fraction(), Some(0.42));
    }

    #[test]
    fn object_metrics_merge_last_value_wins() {
        let mut progress = JobProgress::default();
        progress.merge(&json!({"current_sample": 3, "total_samples": 10}));
        progress.merge(&json!({"current_sample": 5}));

        assert_eq!(progress.metrics["current_sample"], 5);
        assert_eq!(progress.metrics["total_samples"], 10);
        assert_eq!(progress.fraction(), Some(0.5));
    }

    #[test]
    fn iteration_pair_yields_fraction() {
        let mut progress = JobProgress::default();
        progress.merge(&json!({"current_iteration": 1, "max_iterations": 4}));
        assert_eq!(progress.fraction(), Some(0.25));
    }

    #[test]
    fn percent_key_inside_object_is_lifted() {
        let mut progress = JobProgress::default();
        progress.merge(&json!({"progress": 80, "stage": "scoring"}));
        assert_eq!(progress.percent, Some(80.0));
        assert_eq!(progress.metrics["stage"], "scoring");
        assert!(!progress.metrics.contains_key("progress"));
    }

    #[test]
    fn zero_total_has_no_fraction() {
        let mut progress = JobProgress::default();
        progress.merge(&json!({"completed": 0, "total": 0}));
        assert_eq!(progress.fraction(), None);
    }

    // -- Job::apply -----------------------------------------------------------

    #[test]
    fn running_update_moves_submitted_to_running() {
        let mut job = Job::new("J1", JobKind::Attack);
        let outcome = job.apply(StatusUpdate::running().with_progress(json!(10)));
        assert_eq!(outcome, ApplyOutcome::Progressed);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress.percent, Some(10.0));
    }

    #[test]
    fn completion_records_result_ref() {
        let mut job = Job::new("J1", JobKind::Evaluation);
        let outcome = job.apply(StatusUpdate::completed().with_result_ref("R1"));
        assert_eq!(outcome, ApplyOutcome::Terminal);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_ref.as_deref(), Some("R1"));
    }

    #[test]
    fn completion_without_ref_falls_back_to_job_id() {
        let mut job = Job::new("J7", JobKind::Finetuning);
        job.apply(StatusUpdate::completed());
        assert_eq!(job.result_ref.as_deref(), Some("J7"));
    }

    #[test]
    fn terminal_job_ignores_later_updates() {
        let mut job = Job::new("J1", JobKind::Attack);
        job.apply(StatusUpdate::failed("out of memory"));
        let snapshot = job.clone();

        assert_eq!(job.apply(StatusUpdate::completed()), ApplyOutcome::Ignored);
        assert_eq!(
            job.apply(StatusUpdate::running().with_progress(json!(99))),
            ApplyOutcome::Ignored
        );
        assert_eq!(job, snapshot);
    }

    #[test]
    fn aborted_carries_reason() {
        let mut job = Job::new("J3", JobKind::BatchTest);
        job.apply(StatusUpdate::aborted(AbortReason::StatusUnsupported));
        assert_eq!(job.status, JobStatus::Aborted);
        assert_eq!(job.abort_reason, Some(AbortReason::StatusUnsupported));
        assert!(job.result_ref.is_none());
    }
}
