//! Task-instance dispatch after a reconciliation pass.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::booking::Booking;
use crate::constants::task_slugs;
use crate::meeting::Meeting;
use crate::ports::TaskInstanceService;

/// Hints collected while importing a meeting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    /// The meeting was moved to a new date.
    #[serde(default)]
    pub meeting_new_date: bool,
    /// Task status the current transition maps to.
    #[serde(default)]
    pub status_slug: Option<String>,
}

/// What the dispatcher did for one booking.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dispatched {
    /// The meeting chain already started; its instance was moved.
    MeetingUpdated,
    /// A meeting chain was created.
    MeetingChainCreated,
    /// The booking's default chains were created or refreshed.
    DefaultChain,
}

#[derive(Clone)]
pub struct TaskDispatcher {
    tasks: Arc<dyn TaskInstanceService>,
}

impl TaskDispatcher {
    pub fn new(tasks: Arc<dyn TaskInstanceService>) -> Self {
        Self { tasks }
    }

    /// Creates or updates the booking's task instances. Failures are logged.
    pub async fn dispatch(
        &self,
        booking: &Booking,
        meeting: Option<&Meeting>,
        context: Option<&TaskContext>,
    ) -> Vec<Dispatched> {
        let booking_id = booking.id_typed();
        let mut done = Vec::new();
        let mut chain_created = false;

        if meeting.is_some() {
            match self
                .tasks
                .exists_with_status(booking_id, task_slugs::MEETINGS_START)
                .await
            {
                Ok(true) => {
                    if let Some(slug) = context.and_then(|c| c.status_slug.as_deref()) {
                        match self.tasks.update_status(booking_id, slug).await {
                            Ok(()) => done.push(Dispatched::MeetingUpdated),
                            Err(err) => {
                                warn!(booking_id = %booking_id, error = %err, "failed to update task instance")
                            }
                        }
                    }
                }
                Ok(false) => {
                    match self.tasks.create_chain(booking_id, context).await {
                        Ok(()) => {
                            done.push(Dispatched::MeetingChainCreated);
                            chain_created = true;
                        }
                        Err(err) => {
                            warn!(booking_id = %booking_id, error = %err, "failed to create meeting task chain")
                        }
                    }
                }
                Err(err) => {
                    warn!(booking_id = %booking_id, error = %err, "failed to look up meeting task instance")
                }
            }
        }

        if !chain_created {
            match self.tasks.create_chain(booking_id, None).await {
                Ok(()) => done.push(Dispatched::DefaultChain),
                Err(err) => {
                    warn!(booking_id = %booking_id, error = %err, "failed to create task chain")
                }
            }
        }
        debug!(booking_id = %booking_id, dispatched = ?done, "task instances dispatched");
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{RecordingTaskInstances, TaskInstanceCall};
    use crate::meeting::{MeetingStatus, MeetingType};
    use cabinet_core::{BookingId, MeetingId};
    use chrono::Utc;

    fn meeting(booking: BookingId) -> Meeting {
        Meeting {
            id: MeetingId::new(5),
            booking_id: booking,
            status: MeetingStatus::Confirm,
            status_ref: None,
            kind: MeetingType::Offline,
            date: Utc::now(),
            meeting_link: None,
        }
    }

    #[tokio::test]
    async fn without_meeting_only_default_chain_is_created() {
        let tasks = Arc::new(RecordingTaskInstances::new());
        let dispatcher = TaskDispatcher::new(tasks.clone());
        let booking = Booking::new(BookingId::new(1), Utc::now());

        let done = dispatcher.dispatch(&booking, None, None).await;

        assert_eq!(done, vec![Dispatched::DefaultChain]);
        assert_eq!(
            tasks.calls(),
            vec![TaskInstanceCall::CreateChain {
                booking: BookingId::new(1),
                context: None
            }]
        );
    }

    #[tokio::test]
    async fn started_meeting_chain_moves_to_context_status() {
        let tasks = Arc::new(RecordingTaskInstances::new());
        let booking = Booking::new(BookingId::new(2), Utc::now());
        tasks.seed(booking.id_typed(), task_slugs::MEETINGS_START);
        let dispatcher = TaskDispatcher::new(tasks.clone());
        let context = TaskContext {
            meeting_new_date: false,
            status_slug: Some("meeting_finished".into()),
        };

        let done = dispatcher
            .dispatch(&booking, Some(&meeting(booking.id_typed())), Some(&context))
            .await;

        assert_eq!(done, vec![Dispatched::MeetingUpdated, Dispatched::DefaultChain]);
        assert_eq!(
            tasks.calls()[0],
            TaskInstanceCall::UpdateStatus {
                booking: booking.id_typed(),
                status: "meeting_finished".into()
            }
        );
    }

    #[tokio::test]
    async fn new_meeting_gets_its_chain_once() {
        let tasks = Arc::new(RecordingTaskInstances::new());
        let booking = Booking::new(BookingId::new(3), Utc::now());
        let dispatcher = TaskDispatcher::new(tasks.clone());
        let context = TaskContext {
            meeting_new_date: true,
            status_slug: None,
        };

        let done = dispatcher
            .dispatch(&booking, Some(&meeting(booking.id_typed())), Some(&context))
            .await;

        assert_eq!(done, vec![Dispatched::MeetingChainCreated]);
        assert_eq!(
            tasks.calls(),
            vec![TaskInstanceCall::CreateChain {
                booking: booking.id_typed(),
                context: Some(context)
            }]
        );
    }

    #[tokio::test]
    async fn failed_meeting_chain_falls_back_to_default_chain() {
        let tasks = Arc::new(RecordingTaskInstances::new().failing_chains(1));
        let booking = Booking::new(BookingId::new(4), Utc::now());
        let dispatcher = TaskDispatcher::new(tasks.clone());
        let context = TaskContext {
            meeting_new_date: true,
            status_slug: None,
        };

        let done = dispatcher
            .dispatch(&booking, Some(&meeting(booking.id_typed())), Some(&context))
            .await;

        assert_eq!(done, vec![Dispatched::DefaultChain]);
        assert_eq!(
            tasks.calls(),
            vec![
                TaskInstanceCall::CreateChain {
                    booking: booking.id_typed(),
                    context: Some(context),
                },
                TaskInstanceCall::CreateChain {
                    booking: booking.id_typed(),
                    context: None,
                },
            ]
        );
    }
}
