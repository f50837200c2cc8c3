use std::time::Duration;

use serde::Serialize;
use tokio::{sync::watch, time::sleep};

use crate::{
    services::{
        compliance::ComplianceService,
        queue::{ComplianceJob, JobDisposition, QueuedJob, TaskQueue},
    },
    state::AppState,
};

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct ProcessComplianceJobsSummary {
    pub picked: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub retried: u32,
}

/// Claims due jobs and runs them against the compliance service.
///
/// A handler error goes back to the queue, which requeues it with backoff
/// until the job budget is spent. Submission-level retries are scheduled by
/// the service itself and finish the current job successfully.
pub async fn process_compliance_jobs(
    queue: &dyn TaskQueue,
    compliance: &ComplianceService,
    batch_size: i64,
) -> ProcessComplianceJobsSummary {
    let jobs = match queue.claim_due(batch_size).await {
        Ok(jobs) => jobs,
        Err(error) => {
            tracing::error!(error = %error, "Could not claim compliance jobs");
            return ProcessComplianceJobsSummary::default();
        }
    };
    let mut summary = ProcessComplianceJobsSummary {
        picked: jobs.len() as u32,
        ..ProcessComplianceJobsSummary::default()
    };

    for job in jobs {
        match run_job(compliance, &job).await {
            Ok(()) => {
                summary.succeeded += 1;
                if let Err(error) = queue.complete(&job).await {
                    tracing::warn!(job_id = job.id, error = %error, "Could not mark job succeeded");
                }
            }
            Err(reason) => {
                tracing::warn!(
                    job_id = job.id,
                    kind = job.job.kind(),
                    submission_id = job.job.submission_id(),
                    attempts = job.attempts,
                    error = %reason,
                    "Compliance job failed"
                );
                match queue.fail(&job, &reason).await {
                    Ok(JobDisposition::Requeued { .. }) => summary.retried += 1,
                    Ok(JobDisposition::Failed) => summary.failed += 1,
                    Err(error) => {
                        summary.failed += 1;
                        tracing::error!(job_id = job.id, error = %error, "Could not record job failure");
                    }
                }
            }
        }
    }

    if summary.picked > 0 {
        tracing::info!(
            picked = summary.picked,
            succeeded = summary.succeeded,
            failed = summary.failed,
            retried = summary.retried,
            "Processed compliance jobs"
        );
    }
    summary
}

async fn run_job(compliance: &ComplianceService, job: &QueuedJob) -> Result<(), String> {
    let result = match &job.job {
        ComplianceJob::SendSubmission { submission_id } => compliance
            .send(*submission_id)
            .await
            .map(|outcome| tracing::debug!(job_id = job.id, ?outcome, "Send handled")),
        ComplianceJob::CheckStatus {
            submission_id,
            reference,
        } => compliance
            .check_status(*submission_id, reference)
            .await
            .map(|outcome| tracing::debug!(job_id = job.id, ?outcome, "Status check handled")),
    };
    result.map_err(|error| error.detail_message())
}

/// Polls the queue until `shutdown` flips to `true`.
pub async fn run_background_scheduler(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(state.config.worker_poll_interval_seconds.max(1));
    let batch_size = state.config.worker_batch_size.clamp(1, 500);
    tracing::info!(
        interval_seconds = interval.as_secs(),
        batch_size,
        connector = state.compliance.connector_name(),
        "Compliance worker started"
    );

    loop {
        process_compliance_jobs(state.queue.as_ref(), &state.compliance, batch_size).await;

        tokio::select! {
            _ = sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("Compliance worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{process_compliance_jobs, ProcessComplianceJobsSummary};
    use crate::{
        models::SubmissionState,
        repository::{MemoryStore, Store},
        services::{
            compliance::{CompliancePolicy, ComplianceService},
            queue::{ComplianceJob, MemoryJobStatus, MemoryTaskQueue, TaskQueue},
            testing::{seed_property, seed_reservation_with_guest, ScriptedConnector},
        },
    };

    struct Harness {
        store: Arc<MemoryStore>,
        queue: Arc<MemoryTaskQueue>,
        connector: Arc<ScriptedConnector>,
        compliance: ComplianceService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let connector = Arc::new(ScriptedConnector::default());
        let compliance = ComplianceService::new(
            store.clone(),
            queue.clone(),
            connector.clone(),
            CompliancePolicy::default(),
        );
        Harness {
            store,
            queue,
            connector,
            compliance,
        }
    }

    #[tokio::test]
    async fn drives_submission_from_send_to_accepted() {
        let h = harness();
        let property = seed_property(h.store.as_ref()).await;
        let reservation =
            seed_reservation_with_guest(h.store.as_ref(), property.id, None, 2).await;
        let submission = h
            .compliance
            .create_submission(reservation.id, None)
            .await
            .expect("submission");

        let first = process_compliance_jobs(h.queue.as_ref(), &h.compliance, 10).await;
        assert_eq!(
            first,
            ProcessComplianceJobsSummary {
                picked: 1,
                succeeded: 1,
                ..ProcessComplianceJobsSummary::default()
            }
        );
        assert_eq!(h.connector.send_calls(), 1);

        let idle = process_compliance_jobs(h.queue.as_ref(), &h.compliance, 10).await;
        assert_eq!(idle.picked, 0);

        h.queue.release_delayed().await;
        let second = process_compliance_jobs(h.queue.as_ref(), &h.compliance, 10).await;
        assert_eq!(second.succeeded, 1);

        let stored = h
            .store
            .get_submission(submission.id)
            .await
            .expect("lookup")
            .expect("submission");
        assert_eq!(stored.state, SubmissionState::Accepted);
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_send_twice() {
        let h = harness();
        let property = seed_property(h.store.as_ref()).await;
        let reservation =
            seed_reservation_with_guest(h.store.as_ref(), property.id, None, 1).await;
        let submission = h
            .compliance
            .create_submission(reservation.id, None)
            .await
            .expect("submission");
        h.queue
            .enqueue(
                ComplianceJob::SendSubmission {
                    submission_id: submission.id,
                },
                chrono::Duration::zero(),
            )
            .await
            .expect("enqueue duplicate");

        let summary = process_compliance_jobs(h.queue.as_ref(), &h.compliance, 10).await;
        assert_eq!(summary.picked, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(h.connector.send_calls(), 1);
    }

    #[tokio::test]
    async fn missing_submission_is_retried_by_the_queue() {
        let h = harness();
        h.queue
            .enqueue(
                ComplianceJob::SendSubmission { submission_id: 999 },
                chrono::Duration::zero(),
            )
            .await
            .expect("enqueue");

        let summary = process_compliance_jobs(h.queue.as_ref(), &h.compliance, 10).await;
        assert_eq!(summary.retried, 1);
        let jobs = h.queue.snapshot().await;
        assert_eq!(jobs[0].status, MemoryJobStatus::Queued);
        assert!(jobs[0].last_error.is_some());
    }
}
