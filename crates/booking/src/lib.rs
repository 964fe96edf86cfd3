//! Booking-state reconciliation for CRM lead webhooks.
//!
//! The CRM pushes lead changes as form-encoded webhooks. This crate parses
//! them, maps the lead's status onto the booking's stage and substage, and
//! drives everything hanging off a booking: meeting status, task instances,
//! activation and deactivation, history and the change log.
//!
//! All IO goes through the traits in [`ports`], [`repository`] and
//! [`sweep`]; [`memory`] has in-process implementations of each of them.

pub mod activation;
pub mod archive;
pub mod booking;
pub mod catalog;
pub mod change_log;
pub mod constants;
pub mod creation;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod flags;
pub mod history;
pub mod meeting;
pub mod memory;
pub mod patch;
pub mod ports;
pub mod reconciler;
pub mod repository;
pub mod sweep;
pub mod tasks;
pub mod webhook;

pub use activation::{ActivationRequest, ActivationService, DeactivationService};
pub use archive::{WebhookRequest, WebhookRequestStore};
pub use booking::Booking;
pub use catalog::{CatalogError, MeetingGroup, StatusCatalog, SubstageLookup};
pub use change_log::{BookingLog, BookingLogStore, ChangeLogger};
pub use constants::{
    BookingCreatedSource, BookingStage, BookingSubstage, OnlinePurchaseStep, PaymentMethod,
};
pub use creation::BookingCreationService;
pub use dispatcher::{Dispatched, TaskContext, TaskDispatcher};
pub use error::{BookingError, BookingResult, IntegrationError, QueueError, RepositoryError};
pub use events::{BookingEnvelope, BookingEvent, EventPublisher, RewardCancelComment};
pub use flags::FeatureFlags;
pub use history::{BookingHistory, HistoryRecorder, HistoryStore};
pub use meeting::{
    Meeting, MeetingStatus, MeetingStrategyKind, MeetingType, MeetingWorkflow,
};
pub use patch::{BookingField, BookingPatch};
pub use reconciler::{ReconcileMode, ReconcileOutcome, ReconcilerDeps, WebhookReconciler};
pub use repository::{BookingFilter, BookingRepository, QueueRegressionMonitor, RegressionMonitor};
pub use sweep::{DistributedLock, ExpiredBookingSweep, LockError, LockLease, SweepReport};
pub use tasks::{BookingTask, EmailMessage, RegressionReport, TaskQueue};
pub use webhook::WebhookLead;
