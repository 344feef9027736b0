use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use envconfig::Envconfig;
use health::{HealthHandle, HealthRegistry};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use queue_relay::config::Config;
use queue_relay::listener::RelayListener;
use queue_relay::server;
use queue_relay::sinks::kafka::KafkaSink;
use queue_relay::sinks::print::PrintSink;
use queue_relay::sinks::PublishSink;
use queue_relay::source::pgqueue::PgQueue;
use queue_relay::strategy::StrategyRegistry;
use queue_relay::worker::RelayWorker;

async fn shutdown(mut term: Signal, mut interrupt: Signal) {
    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

async fn cleanup_loop(
    queue: Arc<PgQueue>,
    liveness: HealthHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval.tick() => {},
            _ = shutdown.changed() => break,
        }

        if let Err(e) = queue.fail_stalled().await {
            error!("janitor failed cleanup with: {}", e);
        }
        liveness.report_healthy().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;

    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();
    tracing_subscriber::registry().with(log_layer).init();

    info!(
        queue = config.queue.queue_name.as_str(),
        topic = %config.kafka.kafka_topic,
        routing_key_field = config.routing_key_field.as_str(),
        "starting queue relay"
    );

    let liveness = HealthRegistry::new("liveness");

    let recorder_handle = if config.export_prometheus {
        Some(server::setup_metrics_recorder().context("Failed to install metrics recorder")?)
    } else {
        None
    };
    let router = server::router(liveness.clone(), recorder_handle);
    let bind = config.bind();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(router, &bind).await {
            error!("failed to serve probes on {bind}: {e}");
        }
    });
    info!("Started probe server on {}", config.bind());

    let strategy = StrategyRegistry::with_builtins().resolve(&config.partition_strategy);

    let kafka_sink = if config.print_sink {
        None
    } else {
        let handle = liveness
            .register("rdkafka".to_string(), Duration::from_secs(30))
            .await;
        Some(KafkaSink::new(&config.kafka, handle).context("Failed to create Kafka sink")?)
    };
    let sink: Arc<dyn PublishSink> = match &kafka_sink {
        Some(kafka) => Arc::new(kafka.clone()),
        None => Arc::new(PrintSink::new(
            &config.kafka.kafka_topic,
            config.print_sink_partitions,
        )),
    };

    let queue = PgQueue::new(
        config.queue.queue_name.as_str(),
        &config.worker_name,
        &config.queue.database_url,
        config.queue.max_pg_connections,
        config.queue.max_attempts,
        config.queue.retry_policy(),
        config.queue.lease_timeout.0,
    )
    .await
    .context("Failed to connect to the queue database")?;
    if config.queue.run_migrations {
        queue
            .migrate()
            .await
            .context("Failed to migrate the queue table")?;
    }

    let queue = Arc::new(queue);

    let listener = RelayListener::new(sink, strategy, config.routing_key_field.as_str());
    let worker_liveness = liveness
        .register("worker".to_string(), Duration::from_secs(60))
        .await;
    let worker = RelayWorker::new(
        &config.worker_name,
        queue.clone(),
        listener,
        config.queue.poll_interval.0,
        config.max_concurrent_messages,
        worker_liveness,
    );

    let term = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let interrupt =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown(term, interrupt).await;
        if shutdown_tx.send(true).is_err() {
            error!("relay worker exited before shutdown was requested");
        }
    });

    let janitor_liveness = liveness
        .register(
            "janitor".to_string(),
            config.queue.janitor_interval.0.saturating_mul(4),
        )
        .await;
    let janitor_handle = tokio::spawn(cleanup_loop(
        queue,
        janitor_liveness,
        config.queue.janitor_interval.0,
        shutdown_rx.clone(),
    ));

    worker.run(shutdown_rx).await?;
    if let Err(e) = janitor_handle.await {
        error!("janitor task failed: {e}");
    }

    if let Some(kafka) = kafka_sink {
        if let Err(e) = kafka.flush() {
            error!("failed to flush Kafka producer: {e}");
        }
    }
    server_handle.abort();

    Ok(())
}
