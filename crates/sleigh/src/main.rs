//! `sleigh`: the long-lived daemon described in `SPEC_FULL.md`. Ingests
//! sensor data from a local MQTT broker and a cloud pub/sub service,
//! persists it to an embedded SQLite store, and periodically publishes
//! compressed analytical artifacts, switching to monthly cold backups
//! outside the configured season.

mod adapters;
mod config;
mod health_glue;
mod producer;
mod supervisor;

use crate::adapters::cloud::{HttpTokenProvider, WebSocketCloudStream};
use crate::adapters::mqtt::MqttBroker;
use crate::adapters::notify::EmailNotifier;
use crate::adapters::object_store::S3ObjectStore;
use crate::adapters::sqlite_store::{FileBackupSource, SqliteStore};
use crate::config::AppConfig;
use crate::health_glue::HealthGlue;
use crate::producer::StoreArtifactProducer;
use crate::supervisor::{Supervisor, run_with_restarts};
use anyhow::Context as _;
use clap::{Parser, Subcommand};
use domain::Qos;
use health::HealthMonitor;
use ingest::{IngestBuffer, IngestConfig};
use publish::{PublishConfig, Publisher};
use segment::SegmenterConfig;
use source_a::{SourceA, SourceAConfig};
use source_b::{SourceB, SourceBConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

#[derive(Parser)]
#[command(name = "sleigh", about = "Sensor ingest and analytics daemon")]
struct Cli {
    /// Path to a TOML configuration file. Defaults to `sleigh.toml` in the
    /// working directory if present; required to exist if given explicitly.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration utilities.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate the effective configuration, then exit.
    Check,
}

fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
}

fn build_ingest_config(store: &config::StoreAppConfig) -> IngestConfig {
    IngestConfig {
        batch_size: store.batch_size,
        flush_interval: Duration::from_secs(store.flush_interval_secs),
        ..IngestConfig::default()
    }
}

fn build_source_a_config(cfg: &config::SourceAAppConfig) -> anyhow::Result<SourceAConfig> {
    let qos = Qos::try_from(cfg.qos).context("source_a.qos")?;
    let mut builder =
        SourceAConfig::builder(cfg.broker.clone(), cfg.port).qos(qos).keepalive(Duration::from_secs(cfg.keepalive_secs));
    if let (Some(user), Some(pass)) = (&cfg.user, &cfg.pass) {
        builder = builder.credentials(user.clone(), pass.clone());
    }
    for topic in cfg.parse_topics().map_err(|err| anyhow::anyhow!("{err}"))? {
        builder = builder.topic(topic);
    }
    builder.build().map_err(|err| anyhow::anyhow!("source_a config: {err}"))
}

fn build_source_b_config(cfg: &config::SourceBAppConfig) -> anyhow::Result<SourceBConfig> {
    let mut builder = SourceBConfig::builder(cfg.id.clone(), cfg.secret.clone());
    for device in cfg.air_devices() {
        builder = builder.air_device(device);
    }
    for device in cfg.water_devices() {
        builder = builder.water_device(device);
    }
    builder.build().map_err(|err| anyhow::anyhow!("source_b config: {err}"))
}

fn build_publish_config(cfg: &config::PublishAppConfig, backup: &config::BackupAppConfig) -> anyhow::Result<PublishConfig> {
    PublishConfig::builder(cfg.key.clone(), cfg.backup_prefix.clone())
        .interval(Duration::from_secs(cfg.interval_seconds))
        .max_consecutive_failures(cfg.max_consecutive_failures)
        .backup_schedule(backup.day_of_month, backup.hour)
        .build()
        .map_err(|err| anyhow::anyhow!("publish config: {err}"))
}

fn build_segmenter_config(cfg: &config::PublishAppConfig) -> SegmenterConfig {
    SegmenterConfig::builder(cfg.empty_threshold)
        .min_goodness_r2(cfg.min_goodness_r2)
        .min_segment_len(cfg.min_segment_len)
        .min_points(cfg.min_points)
        .jump_threshold(cfg.jump_threshold)
        .build()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let effective = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;

    if let Some(Commands::Config { action: ConfigAction::Check }) = cli.command {
        return match effective.validate() {
            Ok(()) => {
                println!("configuration valid");
                Ok(())
            }
            Err(err) => {
                eprintln!("configuration invalid: {err}");
                std::process::exit(1);
            }
        };
    }

    effective.validate().context("invalid configuration")?;
    tracing::info!("sleigh.starting");

    let season = effective.season.parse().context("season configuration")?;
    let source_a_config = build_source_a_config(&effective.source_a)?;
    let source_b_config = build_source_b_config(&effective.source_b)?;
    let publish_config = build_publish_config(&effective.publish, &effective.backup)?;
    let segmenter_config = build_segmenter_config(&effective.publish);
    let ingest_config = build_ingest_config(&effective.store);

    let store = Arc::new(
        SqliteStore::open(&effective.store.path, effective.store.free_space_floor_bytes)
            .await
            .context("opening store")?,
    );
    let ingest_buffer = Arc::new(IngestBuffer::new(ingest_config));

    let object_store_client = crate::adapters::object_store::build_client(
        effective.publish.region.clone(),
        effective.publish.endpoint.as_deref(),
        effective.publish.aws_key.as_deref(),
        effective.publish.aws_secret.as_deref(),
    )
    .await;
    let object_store = Arc::new(S3ObjectStore::new(object_store_client, effective.publish.bucket.clone()));

    let health_monitor = Arc::new(HealthMonitor::new(
        health::HealthConfig::builder(effective.alert.db_size_mb, effective.alert.free_space_mb)
            .cooldown_hours(effective.alert.cooldown_hours)
            .build(),
    ));

    let notifier = if effective.alert.email_to.trim().is_empty() {
        crate::health_glue::NotifierHandle::Disabled
    } else {
        let recipients: Vec<String> =
            effective.alert.email_to.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect();
        crate::health_glue::NotifierHandle::Email(Arc::new(
            EmailNotifier::from_config(
                &effective.alert.smtp_host,
                effective.alert.smtp_port,
                effective.alert.smtp_tls,
                &effective.alert.smtp_from,
                &recipients,
            )
            .context("configuring SMTP notifier")?,
        ))
    };

    let supervisor = Supervisor::new(Duration::from_secs(effective.supervisor.shutdown_deadline_secs));
    let cancel = supervisor.cancel_token();
    let mut tasks = JoinSet::new();

    {
        let monitor = Arc::clone(&health_monitor);
        let startup_notifier = notifier.clone();
        let effective_config_summary = format!("{effective:?}");
        tokio::spawn(async move {
            if let Err(err) = monitor.startup(&startup_notifier, effective_config_summary).await {
                tracing::warn!("health.startup_notification.failed: {err}");
            }
        });
    }

    let glue = HealthGlue::new(Arc::clone(&health_monitor), Arc::clone(&store), notifier);

    spawn_ingest_drain(
        &mut tasks,
        &cancel,
        Arc::clone(&ingest_buffer),
        Arc::clone(&store),
        glue.clone(),
        effective.supervisor.max_task_restarts,
    );
    spawn_publisher(
        &mut tasks,
        &cancel,
        publish_config,
        season.clone(),
        Arc::clone(&store),
        Arc::clone(&object_store),
        segmenter_config,
        effective.publish.minutes_of_data,
        effective.publish.replay_delay_seconds,
        glue,
        effective.supervisor.max_task_restarts,
    );

    spawn_source_a(&mut tasks, &cancel, source_a_config, effective.source_a.clone(), Arc::clone(&ingest_buffer), effective.supervisor.max_task_restarts);
    spawn_source_b(&mut tasks, &cancel, source_b_config, effective.source_b.clone(), Arc::clone(&ingest_buffer), effective.supervisor.max_task_restarts);

    supervisor.run_until_shutdown(tasks).await?;
    if let Err(err) = domain::Store::close(store.as_ref()).await {
        tracing::warn!("store.close.failed: {err}");
    }
    tracing::info!("sleigh.stopped");
    Ok(())
}

#[expect(clippy::too_many_arguments, reason = "wiring glue; splitting further would only move the list around")]
fn spawn_ingest_drain<H>(
    tasks: &mut JoinSet<Result<(), String>>,
    cancel: &CancellationToken,
    buffer: Arc<IngestBuffer>,
    store: Arc<SqliteStore>,
    health: H,
    max_restarts: u32,
) where
    H: ingest::ShedSignal + ingest::FlushObserver + Clone + Send + Sync + 'static,
{
    let cancel = cancel.clone();
    tasks.spawn(
        async move {
            let cancel_inner = cancel.clone();
            run_with_restarts("ingest.drain", max_restarts, &cancel, || {
                let buffer = Arc::clone(&buffer);
                let store = Arc::clone(&store);
                let health = health.clone();
                let cancel = cancel_inner.clone();
                async move { buffer.run_drain(store.as_ref(), &health, &health, cancel).await }
            })
            .await
        }
        .instrument(tracing::info_span!("ingest_drain")),
    );
}

fn spawn_source_a(
    tasks: &mut JoinSet<Result<(), String>>,
    cancel: &CancellationToken,
    source_a_config: SourceAConfig,
    broker_cfg: config::SourceAAppConfig,
    sink: Arc<IngestBuffer>,
    max_restarts: u32,
) {
    let cancel = cancel.clone();
    tasks.spawn(
        async move {
            let cancel_inner = cancel.clone();
            let source_a = Arc::new(SourceA::new(source_a_config));
            run_with_restarts("source_a", max_restarts, &cancel, || {
                let source_a = Arc::clone(&source_a);
                let sink = Arc::clone(&sink);
                let cancel = cancel_inner.clone();
                let mut broker = MqttBroker::new(
                    broker_cfg.broker.clone(),
                    broker_cfg.port,
                    broker_cfg.user.clone(),
                    broker_cfg.pass.clone(),
                    Duration::from_secs(broker_cfg.keepalive_secs),
                    "data-sleigh",
                );
                async move { source_a.run(&mut broker, sink.as_ref(), cancel).await }
            })
            .await
        }
        .instrument(tracing::info_span!("source_a")),
    );
}

fn spawn_source_b(
    tasks: &mut JoinSet<Result<(), String>>,
    cancel: &CancellationToken,
    source_b_config: SourceBConfig,
    cfg: config::SourceBAppConfig,
    sink: Arc<IngestBuffer>,
    max_restarts: u32,
) {
    let cancel = cancel.clone();
    tasks.spawn(
        async move {
            let cancel_inner = cancel.clone();
            let source_b = Arc::new(SourceB::new(source_b_config));
            let auth = HttpTokenProvider::new(cfg.token_url.clone());
            run_with_restarts("source_b", max_restarts, &cancel, || {
                let source_b = Arc::clone(&source_b);
                let sink = Arc::clone(&sink);
                let auth = auth.clone();
                let cancel = cancel_inner.clone();
                let mut stream = WebSocketCloudStream::new(cfg.stream_url.clone());
                async move { source_b.run(&auth, &mut stream, sink.as_ref(), cancel).await }
            })
            .await
        }
        .instrument(tracing::info_span!("source_b")),
    );
}

#[expect(clippy::too_many_arguments, reason = "wiring glue; splitting further would only move the list around")]
fn spawn_publisher<H>(
    tasks: &mut JoinSet<Result<(), String>>,
    cancel: &CancellationToken,
    publish_config: PublishConfig,
    season: domain::SeasonConfig,
    store: Arc<SqliteStore>,
    object_store: Arc<S3ObjectStore>,
    segmenter_config: SegmenterConfig,
    minutes_of_data: u32,
    replay_delay_seconds: u64,
    health_probe: H,
    max_restarts: u32,
) where
    H: publish::HealthProbe + Clone + Send + Sync + 'static,
{
    let cancel = cancel.clone();
    tasks.spawn(
        async move {
            let cancel_inner = cancel.clone();
            let publisher = Arc::new(Publisher::new(publish_config));
            let producer = Arc::new(StoreArtifactProducer::new(
                Arc::clone(&store),
                season.clone(),
                segmenter_config,
                minutes_of_data,
                replay_delay_seconds,
            ));
            run_with_restarts("publish", max_restarts, &cancel, || {
                let publisher = Arc::clone(&publisher);
                let producer = Arc::clone(&producer);
                let store = Arc::clone(&store);
                let object_store = Arc::clone(&object_store);
                let health_probe = health_probe.clone();
                let season = season.clone();
                let cancel = cancel_inner.clone();
                async move {
                    publisher
                        .run(&season, store.as_ref(), object_store.as_ref(), &FileBackupSource, producer.as_ref(), &health_probe, cancel)
                        .await
                }
            })
            .await
        }
        .instrument(tracing::info_span!("publish")),
    );
}
