//! Command implementations.
//!
//! Short commands open the database, do one thing and print JSON to
//! stdout. Service commands connect to Redis and run until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use check_workers::{
    Dispatcher, EmailSendWorker, PrimeCheckWorker, ProbablePrime, SmtpConfig, SmtpEmailSender,
    StaticRecipient,
};
use checker_config_and_utils::{Config, Shutdown};
use checker_database::AsyncDatabase;
use checker_outbox::{OutboxPublisher, PrimeCheckService, PublisherConfig, SqliteOutboxStore};
use observability::TracePropagator;
use stream_courier::{
    BrokerGateway, MessageHandler, MessageType, RedeliveryPolicy, RedisGatewayConfig,
    RedisStreamsGateway, SubscribeOptions, Subscriber, SubscriptionExit, TraceContext,
};
use tracing::{info, info_span, warn, Instrument};

async fn open_database(config: &Config) -> anyhow::Result<AsyncDatabase> {
    AsyncDatabase::open(&config.database_path)
        .await
        .with_context(|| format!("opening database {}", config.database_path.display()))
}

async fn connect_broker(config: &Config) -> anyhow::Result<Arc<RedisStreamsGateway>> {
    let gateway_config = RedisGatewayConfig {
        retention: config.retention(),
        redelivery: RedeliveryPolicy::new(
            config.redelivery_backoff_base(),
            config.redelivery_backoff_max(),
        ),
        ..RedisGatewayConfig::new(config.redis_url.clone())
    };
    let gateway = RedisStreamsGateway::connect(gateway_config)
        .await
        .with_context(|| format!("connecting to {}", config.redis_url))?;
    Ok(Arc::new(gateway))
}

/// A trigger fired by the first Ctrl-C.
fn shutdown_on_ctrl_c() -> Shutdown {
    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down"),
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
        }
        trigger.trigger();
    });
    shutdown
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn submit(
    config: &Config,
    propagator: TracePropagator,
    user_id: i64,
    number: &str,
) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let service = PrimeCheckService::new(db.clone(), propagator);

    // Root span for the request; its context is what the envelope carries
    let span = info_span!("submit_prime_check", user_id);
    let check = service
        .create_prime_check(user_id, number, TraceContext::new())
        .instrument(span)
        .await?;

    print_json(&check)?;
    db.close().await?;
    Ok(())
}

pub async fn get(config: &Config, propagator: TracePropagator, id: i64) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let service = PrimeCheckService::new(db.clone(), propagator);
    let check = service
        .get_prime_check(id)
        .await?
        .with_context(|| format!("prime check {} not found", id))?;
    print_json(&check)?;
    db.close().await?;
    Ok(())
}

pub async fn list(config: &Config, propagator: TracePropagator) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let checks = PrimeCheckService::new(db.clone(), propagator)
        .list_prime_checks()
        .await?;
    print_json(&checks)?;
    db.close().await?;
    Ok(())
}

pub async fn run_publisher(config: &Config, propagator: TracePropagator) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let broker = connect_broker(config).await?;
    let shutdown = shutdown_on_ctrl_c();

    let publisher = OutboxPublisher::new(
        Arc::new(SqliteOutboxStore::new(db.clone())),
        broker.clone(),
        PublisherConfig::new(config.publish_interval()),
        propagator,
    );
    let exit = publisher.run(shutdown.signal()).await;
    info!(exit = ?exit, "Publisher exited");

    broker.close().await?;
    db.close().await?;
    Ok(())
}

pub async fn run_prime_worker(config: &Config, propagator: TracePropagator) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let worker = PrimeCheckWorker::new(
        db.clone(),
        Arc::new(ProbablePrime::default()),
        Arc::new(StaticRecipient::new(config.default_recipient.clone())),
        propagator.clone(),
    );
    let dispatcher = Dispatcher::new().register(MessageType::PrimeCheck, Arc::new(worker));

    consume(config, MessageType::PrimeCheck.topic(), Arc::new(dispatcher), propagator).await?;
    db.close().await?;
    Ok(())
}

pub async fn run_email_worker(config: &Config, propagator: TracePropagator) -> anyhow::Result<()> {
    let sender = SmtpEmailSender::new(SmtpConfig {
        host: config.smtp_host.clone(),
        port: config.smtp_port,
        from: config.smtp_from.clone(),
        ..SmtpConfig::default()
    });
    let worker = EmailSendWorker::new(Arc::new(sender));
    let dispatcher = Dispatcher::new().register(MessageType::EmailSend, Arc::new(worker));

    consume(config, MessageType::EmailSend.topic(), Arc::new(dispatcher), propagator).await
}

pub async fn run_unknown_sink(config: &Config, propagator: TracePropagator) -> anyhow::Result<()> {
    let sink = Arc::new(Dispatcher::new());
    let topic = MessageType::Unknown(String::new()).topic();
    consume(config, topic, sink.clone(), propagator).await?;
    info!(unknown = sink.unknown_count(), "Unknown sink exited");
    Ok(())
}

/// Subscribe `handler` to `topic` until Ctrl-C.
async fn consume(
    config: &Config,
    topic: &str,
    handler: Arc<dyn MessageHandler>,
    propagator: TracePropagator,
) -> anyhow::Result<()> {
    let broker = connect_broker(config).await?;
    let shutdown = shutdown_on_ctrl_c();

    let subscriber = Subscriber::new(broker.clone(), handler, propagator).with_options(
        SubscribeOptions {
            batch_size: config.pull_batch_size,
            max_wait: config.pull_wait(),
            max_deliveries: config.max_deliveries,
            ..SubscribeOptions::default()
        },
    );

    let SubscriptionExit::Cancelled(stats) = subscriber
        .run(topic, shutdown.signal())
        .await
        .with_context(|| format!("subscribing to {}", topic))?;
    info!(
        topic = %topic,
        acked = stats.acked,
        nacked = stats.nacked,
        poisoned = stats.poisoned,
        "Worker exited"
    );

    broker.close().await?;
    Ok(())
}
