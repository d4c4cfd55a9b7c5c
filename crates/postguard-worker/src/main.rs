//! PostGuard Worker
//!
//! Scores new posts from the input queue and republishes the flagged ones
//! for moderation. `SIGHUP` reloads the scoring resource in place;
//! `SIGINT`/`SIGTERM` stop intake, drain in-flight work and exit.

use anyhow::{Context, Result};
use clap::Parser;
use postguard_classifiers::{default_compute_workers, ArtifactLoader, ArtifactRef, ResourceManager};
use postguard_telemetry::PipelineMetrics;
use postguard_worker::queue::{InMemoryBroker, QueueClient, RedisSettings, RedisStreamsClient};
use postguard_worker::{ConfigOverrides, LifecycleCoordinator, QueueBackend, WorkerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "postguard-worker")]
#[command(about = "PostGuard scoring consumer", long_about = None)]
struct Cli {
    /// Configuration file path (YAML)
    #[arg(short, long, env = "POSTGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact reference to load (builtin:lexicon, latest:<dir>, hf:<repo>[@rev], or a directory)
    #[arg(short, long)]
    artifact: Option<String>,

    /// Flag threshold; scores strictly above it are republished
    #[arg(short, long)]
    threshold: Option<f32>,

    /// Redis URL for the Streams transport
    #[arg(long)]
    redis_url: Option<String>,

    /// Queue to consume
    #[arg(long)]
    input_queue: Option<String>,

    /// Queue flagged posts are published to
    #[arg(long)]
    output_queue: Option<String>,

    /// Deliveries processed at the same time
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Prometheus scrape endpoint, e.g. 0.0.0.0:9090
    #[arg(long)]
    metrics_listen: Option<String>,

    /// Read posts from stdin and print flagged ones to stdout instead of using Redis
    #[arg(long)]
    in_memory: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            artifact: self.artifact.clone(),
            threshold: self.threshold,
            redis_url: self.redis_url.clone(),
            input_queue: self.input_queue.clone(),
            output_queue: self.output_queue.clone(),
            max_concurrency: self.max_concurrency,
            metrics_listen: self.metrics_listen.clone(),
            in_memory: self.in_memory,
        }
    }
}

/// The transport in use, kept concrete for shutdown
enum Transport {
    Redis(Arc<RedisStreamsClient>),
    Memory {
        broker: InMemoryBroker,
        drained: CancellationToken,
    },
}

impl Transport {
    fn client(&self) -> Arc<dyn QueueClient> {
        match self {
            Self::Redis(client) => Arc::clone(client) as Arc<dyn QueueClient>,
            Self::Memory { broker, .. } => Arc::new(broker.clone()),
        }
    }

    fn close(&self) {
        match self {
            Self::Redis(client) => client.close(),
            Self::Memory { broker, .. } => broker.close(),
        }
    }

    /// Cancelled when an in-memory run has consumed all of its input
    fn drained(&self) -> Option<CancellationToken> {
        match self {
            Self::Redis(_) => None,
            Self::Memory { drained, .. } => Some(drained.clone()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_json);

    info!("Starting PostGuard worker");

    let config = WorkerConfig::load(cli.config.as_deref(), &cli.overrides())
        .context("Failed to load configuration")?;
    info!(
        input = %config.queue.input_queue,
        output = %config.queue.output_queue,
        threshold = config.scoring.threshold,
        artifact = %config.scoring.artifact,
        backend = ?config.queue.backend,
        "Configuration loaded"
    );

    if let Some(listen) = config.metrics.listen {
        init_metrics(listen)?;
    }
    let metrics = PipelineMetrics::new();

    let artifact: ArtifactRef = config
        .scoring
        .artifact
        .parse()
        .context("Invalid artifact reference")?;

    let transport = connect_transport(&config).await?;

    let workers = config
        .scoring
        .compute_workers
        .unwrap_or_else(default_compute_workers);
    let manager = ResourceManager::new(
        Arc::new(ArtifactLoader::new(config.scoring.model.clone())),
        workers,
    );

    let mut coordinator = LifecycleCoordinator::new(
        manager,
        transport.client(),
        artifact,
        config.processor_settings(),
        metrics,
    );

    // A load failure here is fatal: nothing has been consumed yet.
    coordinator
        .start()
        .await
        .context("Failed to start consumer")?;
    info!(compute_workers = workers, "Worker running");

    if let Some(interval) = config.reload.poll_interval() {
        coordinator
            .watch(interval)
            .context("Failed to start artifact watcher")?;
    }

    let consumer_exited = coordinator
        .consumer_exited()
        .context("Consumer is not running")?;
    let drained = transport.drained();

    #[cfg(unix)]
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        #[cfg(unix)]
        let reload_requested = hangup.recv();
        #[cfg(not(unix))]
        let reload_requested = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = &mut shutdown => {
                warn!("Shutdown signal received");
                break;
            }
            _ = reload_requested => {
                info!("SIGHUP received, reloading scoring resource");
                // Failures are logged by the reloader; the current resource stays active.
                let _ = coordinator.reload().await;
            }
            _ = consumer_exited.cancelled() => {
                warn!("Consumer exited on its own");
                break;
            }
            _ = wait_for(drained.clone()) => {
                info!("Input drained");
                break;
            }
        }
    }

    let outcome = coordinator.stop(config.shutdown.grace()).await;
    transport.close();

    info!(?outcome, "Worker shutdown complete");
    Ok(())
}

async fn connect_transport(config: &WorkerConfig) -> Result<Transport> {
    match config.queue.backend {
        QueueBackend::Redis => {
            let settings = RedisSettings {
                url: config.queue.redis_url.clone(),
                group: config.queue.group.clone(),
                consumer: config.queue.consumer_name(),
                block_timeout: config.queue.block_timeout(),
                batch_size: config.queue.batch_size,
                claim_idle: config.queue.claim_idle(),
            };
            let client = RedisStreamsClient::connect(settings)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Transport::Redis(Arc::new(client)))
        }
        QueueBackend::Memory => {
            let broker = InMemoryBroker::new();
            let drained = CancellationToken::new();
            spawn_stdin_feeder(
                broker.clone(),
                config.queue.input_queue.clone(),
                config.queue.output_queue.clone(),
                drained.clone(),
            );
            spawn_output_printer(broker.clone(), config.queue.output_queue.clone()).await?;
            Ok(Transport::Memory { broker, drained })
        }
    }
}

/// Enqueue one message per stdin line; cancel `drained` once all of them
/// have been settled and every flagged result has been printed
fn spawn_stdin_feeder(
    broker: InMemoryBroker,
    queue: String,
    output_queue: String,
    drained: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        let mut fed = 0u64;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    broker.enqueue(&queue, line);
                    fed += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
        info!(messages = fed, "Finished reading input");

        broker.wait_idle(&[&queue, &output_queue]).await;
        drained.cancel();
    });
}

/// Print every published payload as one line on stdout
async fn spawn_output_printer(broker: InMemoryBroker, queue: String) -> Result<()> {
    use futures::StreamExt;

    let mut published = broker
        .consume(&queue)
        .await
        .context("Failed to consume output queue")?;
    tokio::spawn(async move {
        while let Some(delivery) = published.next().await {
            println!("{}", String::from_utf8_lossy(delivery.payload()));
            if let Err(e) = delivery.ack().await {
                warn!(error = %e, "Failed to ack printed message");
            }
        }
    });
    Ok(())
}

async fn wait_for(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("postguard=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("postguard=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Install the Prometheus exporter with its scrape endpoint
fn init_metrics(listen: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    postguard_telemetry::describe_metrics();

    info!(%listen, "Metrics exporter listening");
    Ok(())
}
