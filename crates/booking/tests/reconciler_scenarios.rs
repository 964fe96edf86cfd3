//! End-to-end reconciliation scenarios against the in-memory adapters.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;

use cabinet_booking::activation::ActivationRequest;
use cabinet_booking::memory::{
    InMemoryBookingRepository, InMemoryHistoryStore, InMemoryLock,
    InMemoryMeetingStore, InMemoryProjectDirectory, InMemoryPropertyStore, InMemoryPurchaseMatrix,
    InMemoryStatusDirectory, InMemoryWebhookRequestStore, RecordingCrm, RecordingReservation,
    RecordingTaskInstances, RecordingTaskQueue, StaticCollaborators, TaskInstanceCall,
};
use cabinet_booking::ports::{CrmLead, ImportedUser, Property, PropertyStatus};
use cabinet_booking::sweep::{DistributedLock, ExpiredBookingSweep, LockError, LockLease};
use cabinet_booking::{
    ActivationService, Booking, BookingCreationService, BookingEnvelope, BookingRepository,
    BookingStage, BookingSubstage, BookingTask, ChangeLogger, DeactivationService, FeatureFlags,
    HistoryRecorder, HistoryStore, Meeting, MeetingStatus, MeetingStrategyKind, MeetingType,
    MeetingWorkflow, QueueRegressionMonitor, ReconcileMode, ReconcileOutcome, ReconcilerDeps,
    StatusCatalog, TaskDispatcher, WebhookReconciler, WebhookRequestStore,
};
use cabinet_core::{BookingId, LeadId, MeetingId, PipelineId, PropertyId, StatusId, UserId};
use cabinet_events::{EventBus, InMemoryEventBus};

const SECRET: &str = "hook-secret";
const TMN: i64 = 1305043;
const TMN_START: i64 = 21189703;
const TMN_MEETING: i64 = 21189706;
const TMN_MAKE_DECISION: i64 = 21189712;
const TMN_BOOKING: i64 = 21197641;
const TMN_PAID_BOOKING: i64 = 40850079;
const TMN_TERMINATION: i64 = 34654647;
const CALL_CENTER: i64 = 3934218;
const CALL_CENTER_REDIAL: i64 = 39338919;

const FIELD_PROPERTY: i64 = 363971;
const FIELD_PROPERTY_TYPE: i64 = 690114;
const FIELD_FINAL_PRICE: i64 = 679313;
const FIELD_BOOKING_PAYMENT: i64 = 683435;
const FIELD_BOOKING_EXPIRES: i64 = 643043;
const FIELD_COMMISSION: i64 = 822836;
const ENUM_NOT_PAID: i64 = 1309977;

enum Value<'a> {
    Text(&'a str),
    Enum(i64),
}

/// Form body in the CRM's bracketed-key shape.
fn payload(action: &str, lead: i64, status: i64, pipeline: i64, fields: &[(i64, Value)]) -> Vec<u8> {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    let prefix = format!("leads[{action}][0]");
    form.append_pair(&format!("{prefix}[id]"), &lead.to_string());
    form.append_pair(&format!("{prefix}[status_id]"), &status.to_string());
    form.append_pair(&format!("{prefix}[pipeline_id]"), &pipeline.to_string());
    for (n, (id, value)) in fields.iter().enumerate() {
        form.append_pair(&format!("{prefix}[custom_fields][{n}][id]"), &id.to_string());
        let key = format!("{prefix}[custom_fields][{n}][values][0]");
        match value {
            Value::Text(text) => form.append_pair(&format!("{key}[value]"), text),
            Value::Enum(e) => form.append_pair(&format!("{key}[enum]"), &e.to_string()),
        };
    }
    form.finish().into_bytes()
}

struct Harness {
    repo: Arc<InMemoryBookingRepository>,
    queue: Arc<RecordingTaskQueue>,
    catalog: Arc<StatusCatalog>,
    archive: Arc<InMemoryWebhookRequestStore>,
    history: Arc<InMemoryHistoryStore>,
    properties: Arc<InMemoryPropertyStore>,
    meetings: Arc<InMemoryMeetingStore>,
    tasks: Arc<RecordingTaskInstances>,
    crm: Arc<RecordingCrm>,
    reservation: Arc<RecordingReservation>,
    bus: Arc<InMemoryEventBus<BookingEnvelope>>,
    reconciler: WebhookReconciler,
}

impl Harness {
    fn new(flags: FeatureFlags, user: Option<ImportedUser>) -> Self {
        let queue = Arc::new(RecordingTaskQueue::new());
        let repo = Arc::new(InMemoryBookingRepository::with_monitor(Arc::new(
            QueueRegressionMonitor::new(queue.clone()),
        )));
        let catalog = Arc::new(StatusCatalog::builtin().unwrap());
        let archive = Arc::new(InMemoryWebhookRequestStore::new());
        let history = Arc::new(InMemoryHistoryStore::new());
        let properties = Arc::new(InMemoryPropertyStore::new());
        let meetings = Arc::new(InMemoryMeetingStore::new());
        let tasks = Arc::new(RecordingTaskInstances::new());
        let crm = Arc::new(RecordingCrm::new().with_lead(CrmLead {
            id: LeadId::new(555),
            status_id: Some(StatusId::new(TMN_BOOKING)),
            pipeline_id: Some(PipelineId::new(TMN)),
        }));
        let reservation = Arc::new(RecordingReservation::default());
        let bus = Arc::new(InMemoryEventBus::<BookingEnvelope>::new());
        let collaborators = Arc::new(StaticCollaborators::new().with_user(user));
        let projects = Arc::new(InMemoryProjectDirectory::default());

        let writer = ChangeLogger::new(repo.clone(), queue.clone(), "scenario", "Scenario");
        let deps = ReconcilerDeps {
            repo: repo.clone(),
            queue: queue.clone(),
            catalog: catalog.clone(),
            flags,
            archive: archive.clone(),
            contacts: collaborators.clone(),
            agents: collaborators.clone(),
            meeting_import: collaborators.clone(),
            pinning: collaborators.clone(),
            statuses: Arc::new(InMemoryStatusDirectory::from_catalog(&catalog)),
            projects: projects.clone(),
            properties: properties.clone(),
            task_instances: tasks.clone(),
            publisher: bus.clone(),
            history: HistoryRecorder::new(history.clone()),
            creation: BookingCreationService {
                catalog: catalog.clone(),
                projects,
                properties: properties.clone(),
                purchases: Arc::new(InMemoryPurchaseMatrix::default()),
                writer,
            },
            meetings: MeetingWorkflow {
                meetings: meetings.clone(),
                rooms: collaborators.clone(),
                templates: collaborators.clone(),
                contacts: collaborators,
                queue: queue.clone(),
                publisher: bus.clone(),
                strategy: MeetingStrategyKind::default().build(),
                dispatcher: TaskDispatcher::new(tasks.clone()),
            },
        };
        Self {
            reconciler: WebhookReconciler::new(SECRET, deps),
            repo,
            queue,
            catalog,
            archive,
            history,
            properties,
            meetings,
            tasks,
            crm,
            reservation,
            bus,
        }
    }

    fn plain() -> Self {
        Self::new(FeatureFlags::default(), None)
    }

    fn writer(&self) -> ChangeLogger {
        ChangeLogger::new(self.repo.clone(), self.queue.clone(), "scenario", "Scenario")
    }

    fn activation(&self) -> ActivationService {
        ActivationService {
            repo: self.repo.clone(),
            writer: self.writer(),
            catalog: self.catalog.clone(),
            properties: self.properties.clone(),
            projects: Arc::new(InMemoryProjectDirectory::default()),
            crm: self.crm.clone(),
            reservation: self.reservation.clone(),
            queue: self.queue.clone(),
            history: HistoryRecorder::new(self.history.clone()),
        }
    }

    fn deactivation(&self) -> DeactivationService {
        DeactivationService {
            repo: self.repo.clone(),
            writer: self.writer(),
            properties: self.properties.clone(),
            history: HistoryRecorder::new(self.history.clone()),
        }
    }

    fn sweep(&self) -> ExpiredBookingSweep {
        self.sweep_with(Arc::new(InMemoryLock::new()))
    }

    fn sweep_with(&self, lock: Arc<dyn DistributedLock>) -> ExpiredBookingSweep {
        ExpiredBookingSweep {
            repo: self.repo.clone(),
            writer: self.writer(),
            catalog: self.catalog.clone(),
            properties: self.properties.clone(),
            projects: Arc::new(InMemoryProjectDirectory::default()),
            crm: self.crm.clone(),
            reservation: self.reservation.clone(),
            history: HistoryRecorder::new(self.history.clone()),
            lock,
        }
    }

    fn property(&self, id: i64, external: &str, status: PropertyStatus) {
        self.properties
            .insert(Property {
                id: PropertyId::new(id),
                external_id: external.to_string(),
                kind: Some("flat".into()),
                status,
                final_price: None,
                project_id: None,
                building_id: None,
                floor_id: None,
            })
            .unwrap();
    }

    fn seed(&self, id: i64, lead: i64, edit: impl FnOnce(&mut Booking)) -> BookingId {
        let mut booking = Booking::new(BookingId::new(id), Utc::now());
        booking.amocrm_id = Some(LeadId::new(lead));
        edit(&mut booking);
        self.repo.insert(booking).unwrap();
        BookingId::new(id)
    }

    async fn booking(&self, id: BookingId) -> Booking {
        self.repo.get(id).await.unwrap().unwrap()
    }

    fn queued(&self, kind: &str) -> Vec<BookingTask> {
        self.queue
            .tasks()
            .into_iter()
            .filter(|t| t.kind() == kind)
            .collect()
    }
}

#[tokio::test]
async fn booking_status_activates_with_final_price() {
    let h = Harness::plain();
    h.property(10, "12345", PropertyStatus::Free);
    let id = h.seed(1, 555, |b| {
        b.active = false;
        b.property_id = Some(PropertyId::new(10));
        b.amocrm_substage = Some(BookingSubstage::MakeDecision);
        b.amocrm_stage = Some(BookingStage::Start);
        b.amocrm_status_id = Some(StatusId::new(TMN_MAKE_DECISION));
    });

    let body = payload(
        "status",
        555,
        TMN_BOOKING,
        TMN,
        &[
            (FIELD_PROPERTY, Value::Text("12345")),
            (FIELD_FINAL_PRICE, Value::Text("5 000 000")),
        ],
    );
    let outcome = h.reconciler.handle(ReconcileMode::Status, SECRET, &body).await;
    assert_eq!(outcome, ReconcileOutcome::Reconciled { booking_id: id });

    let reconciled = h.booking(id).await;
    assert_eq!(reconciled.amocrm_substage, Some(BookingSubstage::Booking));
    assert_eq!(reconciled.amocrm_stage, Some(BookingStage::Booking));
    assert_eq!(reconciled.amocrm_status_id, Some(StatusId::new(TMN_BOOKING)));
    assert_eq!(reconciled.final_payment_amount, Some(Decimal::new(5_000_000, 0)));

    let activations = h.queued("booking.activate");
    assert_eq!(activations.len(), 1);
    let BookingTask::ActivateBooking {
        booking_id,
        amocrm_substage,
        property_final_price,
        price_with_sale,
    } = activations[0].clone()
    else {
        unreachable!()
    };
    assert_eq!(property_final_price, Some(Decimal::new(5_000_000, 0)));

    let activated = h
        .activation()
        .activate(ActivationRequest {
            booking_id,
            amocrm_substage,
            property_final_price,
            price_with_sale,
        })
        .await
        .unwrap();

    assert!(activated.active);
    assert!(activated.should_be_deactivated_by_timer);
    assert!(activated.profitbase_booked);
    let property = h.properties.snapshot(PropertyId::new(10)).unwrap();
    assert_eq!(property.status, PropertyStatus::Booked);
    assert_eq!(property.final_price, Some(Decimal::new(5_000_000, 0)));
    assert_eq!(
        h.crm.updates().last().map(|u| u.status_id),
        Some(StatusId::new(TMN_BOOKING))
    );
    assert_eq!(h.reservation.booked(), vec![(PropertyId::new(10), LeadId::new(555))]);
    assert_eq!(h.queued("booking.send_sms").len(), 1);

    let history = h.history.for_booking(id).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn termination_deactivates_and_resets_stage() {
    let h = Harness::plain();
    h.property(11, "777", PropertyStatus::Booked);
    let id = h.seed(2, 556, |b| {
        b.property_id = Some(PropertyId::new(11));
        b.amocrm_substage = Some(BookingSubstage::Booking);
        b.amocrm_stage = Some(BookingStage::Booking);
        b.amocrm_status_id = Some(StatusId::new(TMN_BOOKING));
    });

    let body = payload(
        "status",
        556,
        TMN_TERMINATION,
        TMN,
        &[(FIELD_PROPERTY, Value::Text("777"))],
    );
    let outcome = h.reconciler.handle(ReconcileMode::Status, SECRET, &body).await;
    assert_eq!(outcome, ReconcileOutcome::Reconciled { booking_id: id });

    let deactivations = h.queued("booking.deactivate");
    assert_eq!(
        deactivations,
        vec![BookingTask::DeactivateBooking {
            booking_id: id,
            stages_valid: false
        }]
    );

    let deactivated = h.deactivation().deactivate(id, false).await.unwrap();
    assert!(!deactivated.active);
    assert_eq!(deactivated.amocrm_stage, Some(BookingStage::Start));
    assert_eq!(deactivated.amocrm_substage, Some(BookingSubstage::Start));
    assert_eq!(
        h.properties.snapshot(PropertyId::new(11)).unwrap().status,
        PropertyStatus::Free
    );
}

#[tokio::test]
async fn call_centre_status_keeps_active_booking_and_stage() {
    let h = Harness::plain();
    h.property(5, "505", PropertyStatus::Booked);
    let id = h.seed(9, 77, |b| {
        b.active = true;
        b.property_id = Some(PropertyId::new(5));
        b.amocrm_substage = Some(BookingSubstage::Booking);
        b.amocrm_stage = Some(BookingStage::Booking);
        b.amocrm_status_id = Some(StatusId::new(TMN_BOOKING));
    });

    for mode in [ReconcileMode::Status, ReconcileMode::Update] {
        let body = payload(
            "status",
            77,
            CALL_CENTER_REDIAL,
            CALL_CENTER,
            &[(FIELD_PROPERTY, Value::Text("505"))],
        );
        let outcome = h.reconciler.handle(mode, SECRET, &body).await;
        assert_eq!(outcome, ReconcileOutcome::Reconciled { booking_id: id });
    }

    let after = h.booking(id).await;
    assert!(after.active);
    assert_eq!(after.amocrm_substage, Some(BookingSubstage::Booking));
    assert_eq!(after.amocrm_stage, Some(BookingStage::Booking));
    assert!(h.queued("booking.deactivate").is_empty());
}

#[tokio::test]
async fn stale_delivery_never_regresses_payment() {
    let h = Harness::plain();
    h.property(12, "4242", PropertyStatus::Booked);
    let id = h.seed(3, 557, |b| {
        b.property_id = Some(PropertyId::new(12));
        b.price_payed = true;
        b.payment_amount = Some(Decimal::new(10_000, 0));
        b.final_payment_amount = Some(Decimal::new(4_000_000, 0));
        b.amocrm_substage = Some(BookingSubstage::PaidBooking);
        b.amocrm_stage = Some(BookingStage::Booking);
        b.amocrm_status_id = Some(StatusId::new(TMN_PAID_BOOKING));
    });

    let stale = payload(
        "status",
        557,
        TMN_MAKE_DECISION,
        TMN,
        &[
            (FIELD_PROPERTY, Value::Text("4242")),
            (FIELD_BOOKING_PAYMENT, Value::Enum(ENUM_NOT_PAID)),
        ],
    );
    let outcome = h.reconciler.handle(ReconcileMode::Status, SECRET, &stale).await;
    assert_eq!(outcome, ReconcileOutcome::Reconciled { booking_id: id });

    let after = h.booking(id).await;
    assert!(after.price_payed);
    assert_eq!(after.payment_amount, Some(Decimal::new(10_000, 0)));
    assert_eq!(after.final_payment_amount, Some(Decimal::new(4_000_000, 0)));
    assert_eq!(after.property_id, Some(PropertyId::new(12)));
    assert_eq!(after.amocrm_substage, Some(BookingSubstage::MakeDecision));
    assert!(after.active);
    assert!(h.queued("booking.deactivate").is_empty());
    assert_eq!(h.queued("booking.regression_alert").len(), 1);
}

#[tokio::test]
async fn payload_without_custom_fields_changes_nothing() {
    let h = Harness::plain();
    let id = h.seed(4, 558, |b| {
        b.amocrm_substage = Some(BookingSubstage::MakeDecision);
    });
    let before = h.booking(id).await;

    let body = payload("status", 558, TMN_BOOKING, TMN, &[]);
    let outcome = h.reconciler.handle(ReconcileMode::Status, SECRET, &body).await;

    assert_eq!(outcome, ReconcileOutcome::NoCustomFields);
    assert_eq!(h.booking(id).await, before);
    assert!(h.queue.tasks().is_empty());
    assert_eq!(h.archive.list(Some("status")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn crm_created_booking_starts_at_step_one() {
    let flags = FeatureFlags {
        update_contact_webhook: true,
        ..FeatureFlags::default()
    };
    let h = Harness::new(
        flags,
        Some(ImportedUser {
            id: UserId::new(42),
            email: Some("client@example.com".into()),
        }),
    );
    let expires = (Utc::now() + Duration::days(3)).timestamp();

    let body = payload(
        "status",
        600,
        TMN_BOOKING,
        TMN,
        &[
            (FIELD_BOOKING_EXPIRES, Value::Text(&expires.to_string())),
            (FIELD_PROPERTY, Value::Text("9001")),
            (FIELD_PROPERTY_TYPE, Value::Text("Flat")),
        ],
    );
    let outcome = h.reconciler.handle(ReconcileMode::Status, SECRET, &body).await;
    let ReconcileOutcome::Reconciled { booking_id } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };

    let created = h.booking(booking_id).await;
    assert_eq!(created.current_step(), 1);
    assert!(created.active);
    assert_eq!(created.amocrm_id, Some(LeadId::new(600)));
    assert_eq!(created.user_id, Some(UserId::new(42)));
    assert_eq!(created.amocrm_substage, Some(BookingSubstage::Booking));
    assert_eq!(created.expires.map(|e| e.timestamp()), Some(expires));
    let property = h.properties.snapshot(created.property_id.unwrap()).unwrap();
    assert_eq!(property.external_id, "9001");
    assert_eq!(property.kind.as_deref(), Some("flat"));
}

#[tokio::test]
async fn unknown_lead_without_creation_flag_is_missing() {
    let h = Harness::plain();
    let body = payload("update", 601, TMN_BOOKING, TMN, &[(FIELD_PROPERTY, Value::Text("1"))]);
    let outcome = h.reconciler.handle(ReconcileMode::Update, SECRET, &body).await;
    assert_eq!(outcome, ReconcileOutcome::BookingMissing);
    assert!(h.repo.all().unwrap().is_empty());
}

#[tokio::test]
async fn replayed_delivery_is_idempotent() {
    let h = Harness::plain();
    let id = h.seed(5, 559, |b| {
        b.amocrm_substage = Some(BookingSubstage::MakeDecision);
        b.amocrm_stage = Some(BookingStage::Start);
        b.amocrm_status_id = Some(StatusId::new(TMN_MAKE_DECISION));
    });
    let body = payload(
        "status",
        559,
        TMN_MEETING,
        TMN,
        &[(FIELD_PROPERTY, Value::Text("55")), (FIELD_COMMISSION, Value::Text("2,5"))],
    );

    h.reconciler.handle(ReconcileMode::Status, SECRET, &body).await;
    let first = h.booking(id).await;
    h.reconciler.handle(ReconcileMode::Status, SECRET, &body).await;
    let second = h.booking(id).await;

    assert_eq!(first.amocrm_substage, Some(BookingSubstage::Meeting));
    assert_eq!(second.amocrm_substage, first.amocrm_substage);
    assert_eq!(second.amocrm_status_id, first.amocrm_status_id);
    assert_eq!(second.commission, Some(Decimal::new(25, 1)));
    assert_eq!(second.active, first.active);
    assert_eq!(h.history.for_booking(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn non_sales_pipeline_gates_and_deactivates() {
    let h = Harness::plain();
    let id = h.seed(6, 560, |b| {
        b.amocrm_substage = Some(BookingSubstage::Booking);
    });
    let body = payload(
        "status",
        560,
        TMN_START,
        999_999,
        &[(FIELD_PROPERTY, Value::Text("1"))],
    );

    let outcome = h.reconciler.handle(ReconcileMode::StatusOnly, SECRET, &body).await;

    assert_eq!(outcome, ReconcileOutcome::PipelineGated { booking_id: id });
    assert_eq!(
        h.queued("booking.deactivate"),
        vec![BookingTask::DeactivateBooking {
            booking_id: id,
            stages_valid: true
        }]
    );
    assert_eq!(h.booking(id).await.amocrm_substage, Some(BookingSubstage::Booking));
}

#[tokio::test]
async fn wrong_secret_is_rejected_but_archived() {
    let h = Harness::plain();
    let id = h.seed(7, 561, |_| {});
    let before = h.booking(id).await;
    let body = payload("status", 561, TMN_BOOKING, TMN, &[(FIELD_PROPERTY, Value::Text("1"))]);

    let outcome = h.reconciler.handle(ReconcileMode::Status, "guess", &body).await;

    assert_eq!(outcome, ReconcileOutcome::Rejected);
    assert_eq!(h.booking(id).await, before);
    assert_eq!(h.archive.list(None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn meeting_confirms_when_lead_reaches_meeting_group() {
    let h = Harness::plain();
    let events = h.bus.subscribe();
    let id = h.seed(8, 562, |b| {
        b.amocrm_substage = Some(BookingSubstage::MakeAppointment);
        b.amocrm_stage = Some(BookingStage::Start);
    });
    h.meetings
        .insert(Meeting {
            id: MeetingId::new(80),
            booking_id: id,
            status: MeetingStatus::NotConfirm,
            status_ref: None,
            kind: MeetingType::Offline,
            date: Utc::now() + Duration::days(1),
            meeting_link: None,
        })
        .unwrap();
    let body = payload("update", 562, TMN_MEETING, TMN, &[(FIELD_PROPERTY, Value::Text("1"))]);

    let outcome = h.reconciler.handle(ReconcileMode::Update, SECRET, &body).await;

    assert_eq!(outcome, ReconcileOutcome::Reconciled { booking_id: id });
    assert_eq!(
        h.meetings.get(MeetingId::new(80)).unwrap().status,
        MeetingStatus::Confirm
    );
    let envelope = events.try_recv().unwrap();
    assert_eq!(envelope.booking_id(), id);
    assert!(h.tasks.calls().iter().any(|call| matches!(
        call,
        TaskInstanceCall::CreateChain { context: Some(ctx), .. }
            if ctx.status_slug.as_deref() == Some("meetings_confirmed")
    )));
}

#[tokio::test]
async fn sweep_releases_expired_unpaid_bookings() {
    let h = Harness::plain();
    h.property(13, "13", PropertyStatus::Booked);
    let expired = h.seed(9, 563, |b| {
        b.should_be_deactivated_by_timer = true;
        b.expires = Some(Utc::now() - Duration::minutes(5));
        b.property_id = Some(PropertyId::new(13));
        b.amocrm_substage = Some(BookingSubstage::Booking);
    });
    let paid = h.seed(10, 564, |b| {
        b.should_be_deactivated_by_timer = true;
        b.price_payed = true;
        b.expires = Some(Utc::now() - Duration::minutes(5));
    });

    let report = h.sweep().run(Utc::now()).await.unwrap();

    assert_eq!(report.deactivated, 1);
    assert_eq!(report.timers_cleared, 1);
    let released = h.booking(expired).await;
    assert!(!released.active);
    assert_eq!(released.amocrm_substage, Some(BookingSubstage::Start));
    assert_eq!(
        h.properties.snapshot(PropertyId::new(13)).unwrap().status,
        PropertyStatus::Free
    );
    let kept = h.booking(paid).await;
    assert!(kept.active);
    assert!(!kept.should_be_deactivated_by_timer);
}

/// Grants the lease, then reports it gone on the first renewal.
struct ExpiringLock(InMemoryLock);

#[async_trait]
impl DistributedLock for ExpiringLock {
    async fn try_acquire(&self, key: &str, ttl: StdDuration) -> Result<Option<LockLease>, LockError> {
        self.0.try_acquire(key, ttl).await
    }

    async fn renew(&self, _: &LockLease, _: StdDuration) -> Result<bool, LockError> {
        Ok(false)
    }

    async fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        self.0.release(lease).await
    }
}

#[tokio::test]
async fn sweep_stops_once_its_lease_is_lost() {
    let h = Harness::plain();
    h.property(14, "14", PropertyStatus::Booked);
    let expired = h.seed(11, 565, |b| {
        b.should_be_deactivated_by_timer = true;
        b.expires = Some(Utc::now() - Duration::minutes(5));
        b.property_id = Some(PropertyId::new(14));
    });

    let report = h
        .sweep_with(Arc::new(ExpiringLock(InMemoryLock::new())))
        .run(Utc::now())
        .await
        .unwrap();

    assert!(report.interrupted);
    assert_eq!(report.deactivated, 0);
    assert!(h.booking(expired).await.active);
    assert_eq!(
        h.properties.snapshot(PropertyId::new(14)).unwrap().status,
        PropertyStatus::Booked
    );
}
