//! `taskforge-worker`: runs a worker server, delayed-task promoter and cron
//! scheduler side by side until shutdown.

pub mod handlers;
pub mod settings;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use taskforge_core::{CronExpression, RetryPolicy, TaskPayload};
use taskforge_infra::{
    Client, Promoter, PromoterConfig, QueueTopics, Scheduler, SchedulerConfig, Server,
    ServerConfig,
};
use taskforge_transport::Transport;

pub use settings::{SettingsError, WorkerSettings};

/// One transport handle per component, so stopping one never closes another.
pub struct Transports<T> {
    pub server: T,
    pub promoter: T,
    pub scheduler: T,
}

/// Run every component until `shutdown` fires or one of them fails.
pub async fn run<T: Transport>(
    settings: &WorkerSettings,
    transports: Transports<T>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let topics = QueueTopics::new(&settings.queue);

    let server = Server::new(
        transports.server,
        ServerConfig::new(topics.clone())
            .with_group(settings.group.clone())
            .with_retry_policy(
                RetryPolicy::default()
                    .with_max_retries(settings.max_retries)
                    .never_retry_on("invalid input"),
            ),
    );
    handlers::register(&server).await;

    let promoter = Promoter::new(
        transports.promoter,
        PromoterConfig::new(topics.clone()).with_poll_interval(settings.promoter_interval),
    );

    let scheduler = Scheduler::new(
        Client::new(transports.scheduler, topics),
        SchedulerConfig::default().with_tick_interval(settings.scheduler_interval),
    );
    scheduler
        .add_job(
            "heartbeat",
            handlers::HEARTBEAT,
            CronExpression::every_minute(),
            TaskPayload::new().with("source", "scheduler"),
        )
        .await?;

    info!(queue = %settings.queue, group = %settings.group, "worker starting");

    // Whichever component exits first takes the others down with it.
    let (served, promoted, scheduled) = tokio::join!(
        async {
            let result = server.start(shutdown.clone()).await;
            shutdown.cancel();
            result
        },
        async {
            let result = promoter.start(shutdown.clone()).await;
            shutdown.cancel();
            result
        },
        async {
            let result = scheduler.start(shutdown.clone()).await;
            shutdown.cancel();
            result
        },
    );

    for stopped in [
        server.stop().await.map_err(anyhow::Error::from),
        promoter.stop().await.map_err(anyhow::Error::from),
        scheduler.stop().await.map_err(anyhow::Error::from),
    ] {
        if let Err(err) = stopped {
            error!(error = %err, "component did not shut down cleanly");
        }
    }

    let stats = server.stats();
    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        "worker stopped"
    );

    served?;
    promoted?;
    scheduled?;
    Ok(())
}
