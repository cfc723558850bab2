use tokio_util::sync::CancellationToken;

use taskforge_infra::transport::{RedisConfig, RedisStreamsTransport};
use taskforge_transport::InMemoryBroker;
use taskforge_worker::{Transports, WorkerSettings, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let settings = WorkerSettings::from_env()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("shutdown signal received");
                    shutdown.cancel();
                }
                Err(err) => tracing::warn!(error = %err, "cannot listen for shutdown signal"),
            }
        });
    }

    match settings.redis_url.clone() {
        Some(url) => {
            let mut config = RedisConfig::new(url);
            if let Some(consumer) = &settings.consumer {
                config = config.with_consumer_name(consumer.clone());
            }
            let transports = Transports {
                server: RedisStreamsTransport::connect(config.clone()).await?,
                promoter: RedisStreamsTransport::connect(config.clone()).await?,
                scheduler: RedisStreamsTransport::connect(config).await?,
            };
            run(&settings, transports, shutdown).await
        }
        None => {
            tracing::warn!("TASKFORGE_REDIS_URL not set; using in-process broker");
            let broker = InMemoryBroker::new();
            let transports = Transports {
                server: broker.connect(),
                promoter: broker.connect(),
                scheduler: broker.connect(),
            };
            run(&settings, transports, shutdown).await
        }
    }
}
