//! [`TaskQueue`] backed by the job store.

use async_trait::async_trait;
use tracing::debug;

use cabinet_booking::error::QueueError;
use cabinet_booking::tasks::{BookingTask, TaskQueue};

use super::store::JobStore;
use super::types::{Job, JobKind, RetryPolicy};

/// Serializes booking tasks into jobs routed by their kind name.
pub struct JobTaskQueue<S: JobStore> {
    store: S,
}

impl<S: JobStore> JobTaskQueue<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn policy_for(task: &BookingTask) -> RetryPolicy {
        match task {
            // alerts are best effort
            BookingTask::RegressionAlert(_) => RetryPolicy::no_retry(),
            _ => RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl<S: JobStore> TaskQueue for JobTaskQueue<S> {
    async fn enqueue(&self, task: BookingTask) -> Result<(), QueueError> {
        let kind = task.kind();
        let payload = serde_json::to_value(&task).map_err(|err| QueueError {
            kind,
            message: err.to_string(),
        })?;
        let job = Job::new(JobKind::booking(kind), payload).with_retry_policy(Self::policy_for(&task));
        let job_id = self.store.enqueue(job).await.map_err(|err| QueueError {
            kind,
            message: err.to_string(),
        })?;
        debug!(job_id = %job_id, kind, "booking task queued");
        Ok(())
    }
}

/// Reads the task back out of a job payload.
pub fn decode_task(job: &Job) -> Result<BookingTask, serde_json::Error> {
    serde_json::from_value(job.payload.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use cabinet_core::BookingId;

    #[tokio::test]
    async fn tasks_become_routable_jobs() {
        let store = InMemoryJobStore::arc();
        let queue = JobTaskQueue::new(store.clone());
        let task = BookingTask::DeactivateBooking {
            booking_id: BookingId::new(42),
            stages_valid: false,
        };

        queue.enqueue(task.clone()).await.unwrap();

        let job = store.claim_next().await.unwrap().unwrap();
        assert_eq!(job.kind.type_name(), "booking.deactivate");
        assert_eq!(decode_task(&job).unwrap(), task);
        assert_eq!(job.retry_policy, RetryPolicy::default());
    }
}
