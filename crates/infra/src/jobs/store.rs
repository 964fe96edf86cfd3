//! Job persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use super::types::{DeadLetterEntry, Job, JobId, JobStatus};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    async fn update(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Claims the oldest ready job and marks it running.
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Moves a job out of the queue into the dead-letter list.
    async fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError>;

    async fn list_dead_letters(&self, limit: usize)
    -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Puts a dead-lettered job back in the queue with a fresh attempt count.
    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    fn poisoned<T>(_: T) -> Self {
        Self::Storage("job store lock poisoned".into())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Process-local job store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(JobStoreError::poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(JobStoreError::poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(JobStoreError::poisoned)?;
        match jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(JobStoreError::NotFound(job.id)),
        }
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(JobStoreError::poisoned)?;
        let now = Utc::now();
        let next = jobs
            .values()
            .filter(|j| j.status.is_claimable() && j.is_ready(now))
            .min_by_key(|j| (j.scheduled_at.unwrap_or(j.created_at), j.created_at))
            .map(|j| j.id);
        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.mark_running();
            Some(job.clone())
        }))
    }

    async fn dead_letter(&self, mut job: Job, reason: String) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(JobStoreError::poisoned)?;
        let mut dead = self.dead_letters.write().map_err(JobStoreError::poisoned)?;
        if !matches!(job.status, JobStatus::DeadLettered { .. }) {
            job.status = JobStatus::DeadLettered {
                error: reason.clone(),
                attempts: job.attempt,
            };
        }
        job.updated_at = Utc::now();
        jobs.remove(&job.id);
        dead.insert(job.id, DeadLetterEntry::new(job, reason));
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let dead = self.dead_letters.read().map_err(JobStoreError::poisoned)?;
        let mut entries: Vec<_> = dead.values().cloned().collect();
        entries.sort_by_key(|e| e.dead_lettered_at);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(JobStoreError::poisoned)?;
        let mut dead = self.dead_letters.write().map_err(JobStoreError::poisoned)?;
        let entry = dead.remove(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        let mut job = entry.job;
        job.status = JobStatus::Pending;
        job.attempt = 0;
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(JobStoreError::poisoned)?;
        let dead = self.dead_letters.read().map_err(JobStoreError::poisoned)?;
        let mut stats = JobStats {
            dead_lettered: dead.len(),
            ..JobStats::default()
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed { .. } => stats.failed += 1,
                JobStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).update(job).await
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next().await
    }

    async fn dead_letter(&self, job: Job, reason: String) -> Result<(), JobStoreError> {
        (**self).dead_letter(job, reason).await
    }

    async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        (**self).list_dead_letters(limit).await
    }

    async fn retry_dead_letter(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).retry_dead_letter(job_id).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobKind;

    fn job(task: &str) -> Job {
        Job::new(JobKind::booking(task), serde_json::json!({}))
    }

    #[tokio::test]
    async fn claims_in_fifo_order_once() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue(job("booking.activate")).await.unwrap();
        let second = store.enqueue(job("booking.deactivate")).await.unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt, 1);

        assert_eq!(store.claim_next().await.unwrap().unwrap().id, second);
        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scheduled_jobs_wait_their_turn() {
        let store = InMemoryJobStore::new();
        let mut later = job("booking.send_sms");
        later.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.enqueue(later).await.unwrap();

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letters_can_be_retried() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(job("booking.create_amocrm_note")).await.unwrap();
        let claimed = store.claim_next().await.unwrap().unwrap();

        store.dead_letter(claimed, "crm rejected".into()).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "crm rejected");

        let retried = store.retry_dead_letter(id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.attempt, 0);
        assert!(store.list_dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_count_every_state() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.enqueue(job("booking.send_email")).await.unwrap();
        }
        store.claim_next().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 1);
    }
}
