//! Human-readable rendering of job state.

use advsec_core::job::{Job, JobStatus};

/// One status line, e.g. `[attack] J1 running 42% - Running FGSM`.
pub fn progress_line(job: &Job) -> String {
    let mut line = format!("[{}] {} {}", job.kind, job.job_id, status_label(job.status));
    if let Some(fraction) = job.progress.fraction() {
        line.push_str(&format!(" {:.0}%", fraction * 100.0));
    }
    if let Some(message) = &job.message {
        line.push_str(" - ");
        line.push_str(message);
    }
    line
}

/// Final summary for a job that will not be followed any further.
pub fn outcome_line(job: &Job) -> String {
    match job.status {
        JobStatus::Completed => match &job.result_ref {
            Some(result_ref) => format!("Job {} completed (result {result_ref})", job.job_id),
            None => format!("Job {} completed", job.job_id),
        },
        JobStatus::Failed => format!(
            "Job {} failed: {}",
            job.job_id,
            job.message.as_deref().unwrap_or("no reason given")
        ),
        JobStatus::Aborted => format!(
            "Job {}: {}",
            job.job_id,
            job.abort_reason
                .map(|r| r.description())
                .unwrap_or("monitoring stopped")
        ),
        JobStatus::Submitted | JobStatus::Running => {
            format!("Stopped following job {} while {}", job.job_id, status_label(job.status))
        }
    }
}

/// Process exit code for a job's final state.
pub fn exit_code(job: &Job) -> u8 {
    match job.status {
        JobStatus::Completed => 0,
        JobStatus::Failed => 1,
        JobStatus::Aborted => 2,
        JobStatus::Submitted | JobStatus::Running => 130,
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Submitted => "submitted",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Aborted => "aborted",
    }
}

#[cfg(test)]
mod tests {
    use advsec_core::job::{AbortReason, JobKind, StatusUpdate};
    use serde_json::json;

    use super::*;

    #[test]
    fn progress_line_includes_percentage_and_message() {
        let mut job = Job::new("J1", JobKind::Attack);
        job.apply(
            StatusUpdate::running()
                .with_progress(json!({"current_sample": 21, "total_samples": 50}))
                .with_message("Running FGSM"),
        );
        assert_eq!(progress_line(&job), "[attack] J1 running 42% - Running FGSM");
    }

    #[test]
    fn outcome_lines() {
        let mut completed = Job::new("J1", JobKind::Evaluation);
        completed.apply(StatusUpdate::completed().with_result_ref("R1"));
        assert_eq!(outcome_line(&completed), "Job J1 completed (result R1)");
        assert_eq!(exit_code(&completed), 0);

        let mut failed = Job::new("J2", JobKind::Finetuning);
        failed.apply(StatusUpdate::failed("OOM"));
        assert_eq!(outcome_line(&failed), "Job J2 failed: OOM");
        assert_eq!(exit_code(&failed), 1);

        let mut aborted = Job::new("J3", JobKind::BatchTest);
        aborted.apply(StatusUpdate::aborted(AbortReason::MonitoringLost));
        assert_eq!(outcome_line(&aborted), "Job J3: monitoring lost, outcome unknown");
        assert_eq!(exit_code(&aborted), 2);
    }

    #[test]
    fn cancelled_follow_is_not_an_outcome() {
        let job = Job::new("J4", JobKind::Attack);
        assert_eq!(outcome_line(&job), "Stopped following job J4 while submitted");
        assert_eq!(exit_code(&job), 130);
    }
}
