//! Background job system with retry, backoff, and dead-letter handling.
//!
//! Booking use cases hand work to the [`queue::JobTaskQueue`], which turns
//! each `BookingTask` into a [`Job`] routed by its kind name
//! (`booking.activate`, `booking.send_sms`, ...). A [`JobExecutor`] polls the
//! [`JobStore`], runs the matching [`JobHandler`], reschedules transient
//! failures with backoff, and dead-letters jobs that run out of attempts.

pub mod executor;
pub mod handlers;
pub mod queue;
pub mod store;
pub mod types;

pub use executor::{
    Execution, ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler,
};
pub use handlers::{BookingTaskHandler, LoggingNotifier, Notifier, SweepHandler};
pub use queue::JobTaskQueue;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{
    BackoffStrategy, DeadLetterEntry, Job, JobId, JobKind, JobResult, JobStatus, RetryPolicy,
};
