//! Service wiring: storage, job queue, reconciler, and background workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use cabinet_booking::memory::{
    InMemoryBookingLogStore, InMemoryBookingRepository, InMemoryHistoryStore, InMemoryLock,
    InMemoryMeetingStore, InMemoryProjectDirectory, InMemoryPropertyStore,
    InMemoryPurchaseMatrix, InMemoryStatusDirectory, InMemoryWebhookRequestStore, RecordingCrm,
    RecordingReservation, RecordingTaskInstances, StaticCollaborators,
};
use cabinet_booking::{
    ActivationService, BookingCreationService, BookingEnvelope, BookingLogStore,
    BookingRepository, ChangeLogger, DeactivationService, DistributedLock, ExpiredBookingSweep,
    HistoryRecorder, HistoryStore, MeetingWorkflow, QueueRegressionMonitor, ReconcilerDeps,
    RegressionMonitor, TaskDispatcher, TaskQueue, WebhookReconciler, WebhookRequestStore,
};
use cabinet_events::InMemoryEventBus;
use cabinet_infra::AppConfig;
use cabinet_infra::jobs::{
    BookingTaskHandler, InMemoryJobStore, Job, JobExecutor, JobExecutorConfig, JobExecutorHandle,
    JobKind, JobStore, JobTaskQueue, LoggingNotifier, RetryPolicy, SweepHandler,
};
use cabinet_infra::postgres::{
    self, PostgresBookingLogStore, PostgresBookingRepository, PostgresHistoryStore,
    PostgresWebhookRequestStore,
};

/// Shared state of the HTTP handlers.
pub struct AppServices {
    pub reconciler: WebhookReconciler,
    pub bookings: Arc<dyn BookingRepository>,
    pub jobs: Arc<dyn JobStore>,
}

/// Everything `main` needs: handler state plus the pieces that run in the
/// background.
pub struct Wiring {
    pub services: Arc<AppServices>,
    executor: JobExecutor<Arc<dyn JobStore>>,
    sweep_interval: Duration,
    job_concurrency: usize,
}

/// Running background workers.
pub struct Background {
    executor: JobExecutorHandle,
    sweep_timer: JoinHandle<()>,
}

impl Background {
    pub async fn shutdown(self) {
        self.sweep_timer.abort();
        self.executor.shutdown().await;
        info!("background workers stopped");
    }
}

struct Storage {
    repo: Arc<dyn BookingRepository>,
    history: Arc<dyn HistoryStore>,
    logs: Arc<dyn BookingLogStore>,
    archive: Arc<dyn WebhookRequestStore>,
}

async fn storage(
    config: &AppConfig,
    monitor: Option<Arc<dyn RegressionMonitor>>,
) -> anyhow::Result<Storage> {
    let Some(url) = &config.database_url else {
        info!("DATABASE_URL not set, using in-memory booking storage");
        let repo = match monitor {
            Some(monitor) => InMemoryBookingRepository::with_monitor(monitor),
            None => InMemoryBookingRepository::new(),
        };
        return Ok(Storage {
            repo: Arc::new(repo),
            history: Arc::new(InMemoryHistoryStore::new()),
            logs: Arc::new(InMemoryBookingLogStore::new()),
            archive: Arc::new(InMemoryWebhookRequestStore::new()),
        });
    };

    let pool = postgres::connect(url, 10)
        .await
        .context("failed to connect to Postgres")?;
    postgres::ensure_schema(&pool)
        .await
        .context("failed to prepare booking schema")?;

    let mut repo = PostgresBookingRepository::new(pool.clone());
    if let Some(monitor) = monitor {
        repo = repo.with_monitor(monitor);
    }
    Ok(Storage {
        repo: Arc::new(repo),
        history: Arc::new(PostgresHistoryStore::new(pool.clone())),
        logs: Arc::new(PostgresBookingLogStore::new(pool.clone())),
        archive: Arc::new(PostgresWebhookRequestStore::new(pool)),
    })
}

fn sweep_lock(config: &AppConfig) -> anyhow::Result<Arc<dyn DistributedLock>> {
    match &config.redis_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let lock = cabinet_infra::lock::RedisLock::new(url).context("invalid REDIS_URL")?;
            Ok(Arc::new(lock))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("REDIS_URL is set but the redis feature is disabled, sweep lock stays in process");
            Ok(Arc::new(InMemoryLock::new()))
        }
        None => Ok(Arc::new(InMemoryLock::new())),
    }
}

/// Builds every service from `config`.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<Wiring> {
    let catalog = Arc::new(config.load_catalog().context("failed to load status catalog")?);
    let flags = config.feature_flags;

    let jobs: Arc<dyn JobStore> = InMemoryJobStore::arc();
    let queue: Arc<dyn TaskQueue> = Arc::new(JobTaskQueue::new(jobs.clone()));
    let monitor: Option<Arc<dyn RegressionMonitor>> = flags
        .regression_alerts
        .then(|| Arc::new(QueueRegressionMonitor::new(queue.clone())) as Arc<dyn RegressionMonitor>);
    let Storage {
        repo,
        history,
        logs,
        archive,
    } = storage(config, monitor).await?;

    // CRM, reservation and the other external systems run on in-process
    // stand-ins until real clients are configured.
    let crm = Arc::new(RecordingCrm::new());
    let reservation = Arc::new(RecordingReservation::default());
    let collaborators = Arc::new(StaticCollaborators::new());
    let properties = Arc::new(InMemoryPropertyStore::new());
    let projects = Arc::new(InMemoryProjectDirectory::default());
    let task_instances = Arc::new(RecordingTaskInstances::new());
    let bus = Arc::new(InMemoryEventBus::<BookingEnvelope>::new());
    let history = HistoryRecorder::new(history);

    let writer = |content: &str, use_case: &str| {
        ChangeLogger::new(repo.clone(), queue.clone(), content, use_case)
    };

    let deps = ReconcilerDeps {
        repo: repo.clone(),
        queue: queue.clone(),
        catalog: catalog.clone(),
        flags,
        archive,
        contacts: collaborators.clone(),
        agents: collaborators.clone(),
        meeting_import: collaborators.clone(),
        pinning: collaborators.clone(),
        statuses: Arc::new(InMemoryStatusDirectory::from_catalog(&catalog)),
        projects: projects.clone(),
        properties: properties.clone(),
        task_instances: task_instances.clone(),
        publisher: bus.clone(),
        history: history.clone(),
        creation: BookingCreationService {
            catalog: catalog.clone(),
            projects: projects.clone(),
            properties: properties.clone(),
            purchases: Arc::new(InMemoryPurchaseMatrix::default()),
            writer: writer("Booking created from AMOCRM", "BookingCreationService"),
        },
        meetings: MeetingWorkflow {
            meetings: Arc::new(InMemoryMeetingStore::new()),
            rooms: collaborators.clone(),
            templates: collaborators.clone(),
            contacts: collaborators,
            queue: queue.clone(),
            publisher: bus,
            strategy: config.meeting_strategy.build(),
            dispatcher: TaskDispatcher::new(task_instances),
        },
    };
    let reconciler = WebhookReconciler::new(config.webhook_secret.clone(), deps);

    let task_handler = BookingTaskHandler {
        activation: ActivationService {
            repo: repo.clone(),
            writer: writer("Booking activation", "ActivateBookingService"),
            catalog: catalog.clone(),
            properties: properties.clone(),
            projects: projects.clone(),
            crm: crm.clone(),
            reservation: reservation.clone(),
            queue: queue.clone(),
            history: history.clone(),
        },
        deactivation: DeactivationService {
            repo: repo.clone(),
            writer: writer("Booking deactivation", "DeactivateBookingService"),
            properties: properties.clone(),
            history: history.clone(),
        },
        logs,
        crm: crm.clone(),
        notifier: Arc::new(LoggingNotifier),
        alert_recipients: config.alert_recipients.clone(),
    };
    let sweep = ExpiredBookingSweep {
        repo: repo.clone(),
        writer: writer("Expired booking deactivation", "ExpiredBookingSweep"),
        catalog,
        properties,
        projects,
        crm,
        reservation,
        history,
        lock: sweep_lock(config)?,
    };

    let mut executor = JobExecutor::new(jobs.clone());
    executor.register_handler("booking.expired_sweep", Arc::new(SweepHandler { sweep }));
    executor.register_handler("booking.*", Arc::new(task_handler));

    Ok(Wiring {
        services: Arc::new(AppServices {
            reconciler,
            bookings: repo,
            jobs,
        }),
        executor,
        sweep_interval: config.sweep_interval,
        job_concurrency: config.job_concurrency,
    })
}

impl Wiring {
    /// Starts the job executor and the periodic sweep.
    pub fn start(self) -> (Arc<AppServices>, Background) {
        let executor = self.executor.spawn(
            JobExecutorConfig::default()
                .with_name("booking-jobs")
                .with_max_concurrent(self.job_concurrency),
        );

        let jobs = self.services.jobs.clone();
        let interval = self.sweep_interval;
        let sweep_timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let job = Job::new(JobKind::ExpiredSweep, serde_json::Value::Null)
                    .with_retry_policy(RetryPolicy::no_retry());
                if let Err(err) = jobs.enqueue(job).await {
                    error!(error = %err, "failed to schedule expired booking sweep");
                }
            }
        });

        (
            self.services,
            Background {
                executor,
                sweep_timer,
            },
        )
    }
}

/// Handler state over in-memory storage, with no background workers.
pub async fn in_memory(webhook_secret: &str) -> anyhow::Result<Arc<AppServices>> {
    let secret = webhook_secret.to_string();
    let config = AppConfig::from_lookup(move |var| {
        (var == "AMOCRM_WEBHOOK_SECRET").then(|| secret.clone())
    })?;
    Ok(build_services(&config).await?.services)
}
