//! Job handlers for booking tasks and the expired sweep.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use cabinet_booking::constants::message_slugs;

use cabinet_booking::activation::{ActivationRequest, ActivationService, DeactivationService};
use cabinet_booking::change_log::BookingLogStore;
use cabinet_booking::error::{BookingError, IntegrationError};
use cabinet_booking::ports::CrmClient;
use cabinet_booking::sweep::ExpiredBookingSweep;
use cabinet_booking::tasks::{BookingTask, EmailMessage, RegressionReport};
use cabinet_core::BookingId;

use super::executor::JobHandler;
use super::queue::decode_task;
use super::types::{Job, JobResult};

/// Outbound SMS and email delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_sms(&self, booking_id: BookingId, sms_slug: &str) -> Result<(), IntegrationError>;
    async fn send_email(&self, message: &EmailMessage) -> Result<(), IntegrationError>;
}

/// Notifier that only logs what it would have sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send_sms(&self, booking_id: BookingId, sms_slug: &str) -> Result<(), IntegrationError> {
        info!(booking_id = %booking_id, sms_slug, "sms notification");
        Ok(())
    }

    async fn send_email(&self, message: &EmailMessage) -> Result<(), IntegrationError> {
        info!(
            template = %message.template_slug,
            recipients = message.recipients.len(),
            topic = %message.topic,
            "email notification"
        );
        Ok(())
    }
}

/// Runs every `booking.*` task.
#[derive(Clone)]
pub struct BookingTaskHandler {
    pub activation: ActivationService,
    pub deactivation: DeactivationService,
    pub logs: Arc<dyn BookingLogStore>,
    pub crm: Arc<dyn CrmClient>,
    pub notifier: Arc<dyn Notifier>,
    /// Receivers of blocked-regression reports.
    pub alert_recipients: Vec<String>,
}

impl BookingTaskHandler {
    pub async fn handle(&self, task: BookingTask) -> Result<(), BookingError> {
        match task {
            BookingTask::ActivateBooking {
                booking_id,
                amocrm_substage,
                property_final_price,
                price_with_sale,
            } => {
                let request = ActivationRequest {
                    booking_id,
                    amocrm_substage,
                    property_final_price,
                    price_with_sale,
                };
                self.activation.activate(request).await.map(|_| ())
            }
            BookingTask::DeactivateBooking {
                booking_id,
                stages_valid,
            } => self
                .deactivation
                .deactivate(booking_id, stages_valid)
                .await
                .map(|_| ()),
            BookingTask::SendSms {
                booking_id,
                sms_slug,
            } => Ok(self.notifier.send_sms(booking_id, &sms_slug).await?),
            BookingTask::SendEmail(message) => Ok(self.notifier.send_email(&message).await?),
            BookingTask::CreateBookingLog(log) => Ok(self.logs.append(log).await?),
            BookingTask::CreateAmocrmNote { lead_id, text } => {
                Ok(self.crm.create_note(lead_id, &text).await?)
            }
            BookingTask::RegressionAlert(report) => {
                let fields: Vec<&str> = report.alerts.iter().map(|a| a.field.as_str()).collect();
                error!(
                    booking_id = %report.booking_id,
                    fields = ?fields,
                    "blocked regression of booking fields"
                );
                let message = regression_email(&report, &self.alert_recipients);
                Ok(self.notifier.send_email(&message).await?)
            }
        }
    }
}

fn regression_email(report: &RegressionReport, recipients: &[String]) -> EmailMessage {
    let mut content = format!(
        "Blocked regression of booking {} fields:\n",
        report.booking_id
    );
    for alert in &report.alerts {
        content.push_str(&format!("- {}: {}\n", alert.field, alert.previous));
    }
    content.push_str("\nBacktrace:\n");
    content.push_str(&report.backtrace);
    EmailMessage {
        topic: format!("Booking {}: blocked field regression", report.booking_id),
        content,
        recipients: recipients.to_vec(),
        template_slug: message_slugs::REGRESSION_ALERT_MAIL.to_string(),
    }
}

/// Maps a task failure onto the job outcome: storage and integration
/// failures are retried, a missing booking or a property held by someone
/// else is permanent, and the other business refusals complete the job.
fn outcome(kind: &str, result: Result<(), BookingError>) -> JobResult {
    match result {
        Ok(()) => JobResult::Success,
        Err(err @ (BookingError::Storage(_) | BookingError::Integration(_))) => {
            JobResult::Failure(err.to_string())
        }
        Err(err @ (BookingError::NotFound(_) | BookingError::PropertyMissing)) => {
            error!(kind, reason = err.reason(), error = %err, "booking task failed permanently");
            JobResult::Fatal(err.to_string())
        }
        Err(err) => {
            warn!(kind, reason = err.reason(), error = %err, "booking task refused");
            JobResult::Success
        }
    }
}

#[async_trait]
impl JobHandler for BookingTaskHandler {
    async fn run(&self, job: &Job) -> JobResult {
        let task = match decode_task(job) {
            Ok(task) => task,
            Err(err) => return JobResult::Fatal(format!("undecodable booking task: {err}")),
        };
        let kind = task.kind();
        outcome(kind, self.handle(task).await)
    }
}

/// Runs one expired booking sweep per job.
#[derive(Clone)]
pub struct SweepHandler {
    pub sweep: ExpiredBookingSweep,
}

#[async_trait]
impl JobHandler for SweepHandler {
    async fn run(&self, _job: &Job) -> JobResult {
        match self.sweep.run(Utc::now()).await {
            Ok(_) => JobResult::Success,
            Err(err) => JobResult::Failure(err.to_string()),
        }
    }
}
