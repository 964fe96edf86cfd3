//! Meeting status sub-machine.
//!
//! A booking's meeting moves `not_confirm -> confirm -> start -> finish`,
//! one step per webhook at most, driven by the lead's CRM group status and
//! the booking substage. How a transition is persisted is delegated to a
//! [`MeetingStatusUpdateStrategy`], chosen once at startup.

use core::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cabinet_core::{BookingId, DomainError, MeetingId};

use crate::booking::Booking;
use crate::catalog::MeetingGroup;
use crate::constants::{BookingSubstage, message_slugs, task_slugs};
use crate::dispatcher::{TaskContext, TaskDispatcher};
use crate::events::{BookingEvent, EventPublisher};
use crate::ports::{ContactDirectory, EmailTemplates, MeetingStore, RoomCreator};
use crate::tasks::{BookingTask, EmailMessage, TaskQueue};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    NotConfirm,
    Confirm,
    Start,
    Finish,
}

impl MeetingStatus {
    pub const fn slug(self) -> &'static str {
        match self {
            MeetingStatus::NotConfirm => "not_confirm",
            MeetingStatus::Confirm => "confirm",
            MeetingStatus::Start => "start",
            MeetingStatus::Finish => "finish",
        }
    }
}

impl core::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingType {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    pub booking_id: BookingId,
    pub status: MeetingStatus,
    /// Status as stored in the reference table, when it is written.
    pub status_ref: Option<MeetingStatus>,
    pub kind: MeetingType,
    pub date: DateTime<Utc>,
    pub meeting_link: Option<String>,
}

/// Columns written for one transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingStatusWrite {
    pub status: Option<MeetingStatus>,
    pub status_ref: Option<MeetingStatus>,
}

impl MeetingStatusWrite {
    pub fn apply(self, meeting: &mut Meeting) {
        if let Some(status) = self.status {
            meeting.status = status;
        }
        if let Some(status_ref) = self.status_ref {
            meeting.status_ref = Some(status_ref);
        }
    }
}

/// Group-status signal carried by the webhook.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GroupSignal {
    Absent,
    Group(MeetingGroup),
}

/// A single step of the sub-machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MeetingTransition {
    pub from: MeetingStatus,
    pub to: MeetingStatus,
    /// Task-instance status the transition maps to.
    pub task_status: &'static str,
}

/// Next meeting status for the given signals, if any.
pub fn next_transition(
    current: MeetingStatus,
    group: GroupSignal,
    substage: Option<BookingSubstage>,
    rescheduled: bool,
) -> Option<MeetingTransition> {
    let in_group = |g: MeetingGroup| group == GroupSignal::Group(g);
    let transition = |to, task_status| {
        Some(MeetingTransition {
            from: current,
            to,
            task_status,
        })
    };

    match current {
        MeetingStatus::NotConfirm
            if in_group(MeetingGroup::Meeting) || substage == Some(BookingSubstage::Meeting) =>
        {
            let task_status = if rescheduled {
                task_slugs::MEETINGS_CONFIRMED_RESCHEDULED
            } else {
                task_slugs::MEETINGS_CONFIRMED
            };
            transition(MeetingStatus::Confirm, task_status)
        }
        MeetingStatus::Confirm
            if in_group(MeetingGroup::MeetingInProgress)
                || substage == Some(BookingSubstage::MeetingInProgress) =>
        {
            transition(MeetingStatus::Start, task_slugs::MEETINGS_START)
        }
        MeetingStatus::Start => {
            let left_by_group = group == GroupSignal::Group(MeetingGroup::Other);
            let left_by_substage = !substage.is_some_and(BookingSubstage::is_meeting_family);
            if left_by_group || left_by_substage {
                transition(MeetingStatus::Finish, task_slugs::MEETINGS_FINISH)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// How a meeting status change is persisted.
pub trait MeetingStatusUpdateStrategy: Send + Sync + core::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Status the sub-machine treats as current.
    fn current(&self, meeting: &Meeting) -> MeetingStatus;

    /// Columns to write for a transition into `target`.
    fn write_for(&self, target: MeetingStatus) -> MeetingStatusWrite;
}

/// Writes only the status column.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusIdStrategy;

impl MeetingStatusUpdateStrategy for StatusIdStrategy {
    fn name(&self) -> &'static str {
        "status_id"
    }

    fn current(&self, meeting: &Meeting) -> MeetingStatus {
        meeting.status
    }

    fn write_for(&self, target: MeetingStatus) -> MeetingStatusWrite {
        MeetingStatusWrite {
            status: Some(target),
            status_ref: None,
        }
    }
}

/// Writes the status column and the reference column.
#[derive(Debug, Default, Clone, Copy)]
pub struct DualWriteStrategy;

impl MeetingStatusUpdateStrategy for DualWriteStrategy {
    fn name(&self) -> &'static str {
        "dual_write"
    }

    fn current(&self, meeting: &Meeting) -> MeetingStatus {
        meeting.status
    }

    fn write_for(&self, target: MeetingStatus) -> MeetingStatusWrite {
        MeetingStatusWrite {
            status: Some(target),
            status_ref: Some(target),
        }
    }
}

/// Writes only the reference column and reads from it.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusRefStrategy;

impl MeetingStatusUpdateStrategy for StatusRefStrategy {
    fn name(&self) -> &'static str {
        "status_ref"
    }

    fn current(&self, meeting: &Meeting) -> MeetingStatus {
        meeting.status_ref.unwrap_or(meeting.status)
    }

    fn write_for(&self, target: MeetingStatus) -> MeetingStatusWrite {
        MeetingStatusWrite {
            status: None,
            status_ref: Some(target),
        }
    }
}

/// Configuration name of a strategy.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStrategyKind {
    #[default]
    StatusId,
    DualWrite,
    StatusRef,
}

impl MeetingStrategyKind {
    pub fn build(self) -> Arc<dyn MeetingStatusUpdateStrategy> {
        match self {
            MeetingStrategyKind::StatusId => Arc::new(StatusIdStrategy),
            MeetingStrategyKind::DualWrite => Arc::new(DualWriteStrategy),
            MeetingStrategyKind::StatusRef => Arc::new(StatusRefStrategy),
        }
    }
}

impl FromStr for MeetingStrategyKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "status_id" => Ok(Self::StatusId),
            "dual_write" => Ok(Self::DualWrite),
            "status_ref" => Ok(Self::StatusRef),
            other => Err(DomainError::validation(format!(
                "unknown meeting strategy: {other}"
            ))),
        }
    }
}

/// Result of one pass of the meeting workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingOutcome {
    pub meeting: Option<Meeting>,
    pub transition: Option<MeetingTransition>,
    pub context: TaskContext,
}

/// Drives the sub-machine for one booking and notifies participants.
#[derive(Clone)]
pub struct MeetingWorkflow {
    pub meetings: Arc<dyn MeetingStore>,
    pub rooms: Arc<dyn RoomCreator>,
    pub templates: Arc<dyn EmailTemplates>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub queue: Arc<dyn TaskQueue>,
    pub publisher: Arc<dyn EventPublisher>,
    pub strategy: Arc<dyn MeetingStatusUpdateStrategy>,
    pub dispatcher: TaskDispatcher,
}

impl MeetingWorkflow {
    pub async fn run(
        &self,
        booking: &Booking,
        group: GroupSignal,
        substage: Option<BookingSubstage>,
        context: Option<TaskContext>,
    ) -> MeetingOutcome {
        let booking_id = booking.id_typed();
        let mut context = context.unwrap_or_default();
        let meeting = match self.meetings.for_booking(booking_id).await {
            Ok(meeting) => meeting,
            Err(err) => {
                warn!(booking_id = %booking_id, error = %err, "failed to load meeting");
                None
            }
        };

        let transition = meeting.as_ref().and_then(|m| {
            next_transition(
                self.strategy.current(m),
                group,
                substage,
                context.meeting_new_date,
            )
        });

        if let (Some(t), Some(m)) = (transition, meeting.as_ref()) {
            context.status_slug = Some(t.task_status.to_string());
            if t.to == MeetingStatus::Start
                && m.kind == MeetingType::Online
                && m.meeting_link.is_none()
            {
                self.create_room(m).await;
            }
        }

        self.dispatcher
            .dispatch(booking, meeting.as_ref(), Some(&context))
            .await;

        let (Some(t), Some(m)) = (transition, meeting.as_ref()) else {
            return MeetingOutcome {
                meeting,
                transition: None,
                context,
            };
        };

        self.publisher.publish(BookingEvent::MeetingStatusChanged {
            booking_id,
            old_status: t.from,
            new_status: t.to,
            occurred_at: Utc::now(),
        });

        let saved = match self
            .meetings
            .save_status(m.id, self.strategy.write_for(t.to))
            .await
        {
            Ok(saved) => saved,
            Err(err) => {
                warn!(booking_id = %booking_id, meeting_id = %m.id, error = %err, "failed to save meeting status");
                return MeetingOutcome {
                    meeting,
                    transition,
                    context,
                };
            }
        };
        info!(
            booking_id = %booking_id,
            meeting_id = %saved.id,
            from = %t.from,
            to = %t.to,
            strategy = self.strategy.name(),
            "meeting status changed"
        );

        if let Some(agent) = booking.agent_id {
            let email = self.contacts.agent_email(agent).await;
            self.notify(message_slugs::MEETING_STATUS_TO_BROKER, email, booking_id)
                .await;
        }
        if let Some(user) = booking.user_id {
            let email = self.contacts.user_email(user).await;
            self.notify(message_slugs::MEETING_STATUS_TO_CLIENT, email, booking_id)
                .await;
        }

        MeetingOutcome {
            meeting: Some(saved),
            transition,
            context,
        }
    }

    async fn create_room(&self, meeting: &Meeting) {
        match self.rooms.create_room(meeting.id, meeting.date).await {
            Ok(link) => {
                if let Err(err) = self.meetings.set_link(meeting.id, link).await {
                    warn!(meeting_id = %meeting.id, error = %err, "failed to store meeting link");
                }
            }
            Err(err) => warn!(meeting_id = %meeting.id, error = %err, "failed to create meeting room"),
        }
    }

    async fn notify(
        &self,
        slug: &str,
        email: Result<Option<String>, crate::error::IntegrationError>,
        booking_id: BookingId,
    ) {
        let recipient = match email {
            Ok(Some(email)) => email,
            Ok(None) => return,
            Err(err) => {
                warn!(booking_id = %booking_id, error = %err, "failed to resolve recipient");
                return;
            }
        };
        let template = match self.templates.template(slug).await {
            Ok(Some(t)) if t.is_active => t,
            Ok(_) => return,
            Err(err) => {
                warn!(booking_id = %booking_id, template = slug, error = %err, "failed to load template");
                return;
            }
        };
        let message = EmailMessage {
            topic: template.topic,
            content: template.content,
            recipients: vec![recipient],
            template_slug: template.slug,
        };
        if let Err(err) = self.queue.enqueue(BookingTask::SendEmail(message)).await {
            warn!(booking_id = %booking_id, error = %err, "failed to schedule meeting email");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use MeetingStatus::*;

    fn substage() -> impl Strategy<Value = Option<BookingSubstage>> {
        proptest::option::of(proptest::sample::select(BookingSubstage::ALL.to_vec()))
    }

    fn group() -> impl Strategy<Value = GroupSignal> {
        prop_oneof![
            Just(GroupSignal::Absent),
            Just(GroupSignal::Group(MeetingGroup::MakeAppointment)),
            Just(GroupSignal::Group(MeetingGroup::Meeting)),
            Just(GroupSignal::Group(MeetingGroup::MeetingInProgress)),
            Just(GroupSignal::Group(MeetingGroup::Other)),
        ]
    }

    fn rank(status: MeetingStatus) -> u8 {
        match status {
            NotConfirm => 0,
            Confirm => 1,
            Start => 2,
            Finish => 3,
        }
    }

    #[test]
    fn confirm_on_meeting_substage_or_group() {
        let t = next_transition(NotConfirm, GroupSignal::Absent, Some(BookingSubstage::Meeting), false)
            .unwrap();
        assert_eq!(t.to, Confirm);
        assert_eq!(t.task_status, task_slugs::MEETINGS_CONFIRMED);

        let t = next_transition(
            NotConfirm,
            GroupSignal::Group(MeetingGroup::Meeting),
            None,
            true,
        )
        .unwrap();
        assert_eq!(t.task_status, task_slugs::MEETINGS_CONFIRMED_RESCHEDULED);
    }

    #[test]
    fn start_needs_confirmation_first() {
        assert_eq!(
            next_transition(
                NotConfirm,
                GroupSignal::Absent,
                Some(BookingSubstage::MeetingInProgress),
                false
            ),
            None
        );
        let t = next_transition(
            Confirm,
            GroupSignal::Absent,
            Some(BookingSubstage::MeetingInProgress),
            false,
        )
        .unwrap();
        assert_eq!(t.to, Start);
    }

    #[test]
    fn finish_once_meeting_family_is_left() {
        assert_eq!(
            next_transition(
                Start,
                GroupSignal::Group(MeetingGroup::MeetingInProgress),
                Some(BookingSubstage::MeetingInProgress),
                false
            ),
            None
        );
        let t = next_transition(Start, GroupSignal::Absent, Some(BookingSubstage::Booking), false)
            .unwrap();
        assert_eq!(t.to, Finish);
        assert_eq!(t.task_status, task_slugs::MEETINGS_FINISH);
        assert_eq!(next_transition(Finish, GroupSignal::Absent, None, false), None);
    }

    #[test]
    fn strategies_write_their_columns() {
        assert_eq!(
            StatusIdStrategy.write_for(Confirm),
            MeetingStatusWrite { status: Some(Confirm), status_ref: None }
        );
        assert_eq!(
            DualWriteStrategy.write_for(Confirm),
            MeetingStatusWrite { status: Some(Confirm), status_ref: Some(Confirm) }
        );
        assert_eq!(
            StatusRefStrategy.write_for(Confirm),
            MeetingStatusWrite { status: None, status_ref: Some(Confirm) }
        );
        assert_eq!("dual_write".parse::<MeetingStrategyKind>().unwrap(), MeetingStrategyKind::DualWrite);
        assert!("legacy".parse::<MeetingStrategyKind>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn sub_machine_never_skips_or_reverses(
            signals in proptest::collection::vec((group(), substage(), any::<bool>()), 1..20)
        ) {
            let mut status = NotConfirm;
            for (group, substage, rescheduled) in signals {
                if let Some(t) = next_transition(status, group, substage, rescheduled) {
                    prop_assert_eq!(t.from, status);
                    prop_assert_eq!(rank(t.to), rank(status) + 1);
                    status = t.to;
                }
            }
        }
    }
}
