//! switchboard daemon: boots the request router, discovers adapters, keeps
//! provider availability fresh and drains ledger writes on ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sb_core::config::Config;
use sb_core::types::RequestContext;
use sb_harness::shutdown::{ShutdownListener, ShutdownSignal};
use sb_router::RequestRouter;
use sb_telemetry::logging::{init_logging, LogFormat};
use sb_telemetry::metrics::MetricsCollector;
use tracing::{debug, info, warn};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How long ctrl-c waits for queued ledger writes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// switchboard -- route LLM requests across local and hosted models.
#[derive(Parser)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// Config file. Defaults to ~/.switchboard/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset, e.g. "debug" or "sb_router=trace".
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Adapter root, overriding `adapters.dir`.
    #[arg(long)]
    adapters: Option<PathBuf>,

    /// Route a single prompt, print the result as JSON and exit.
    #[arg(long)]
    prompt: Option<String>,

    /// Project the one-shot prompt is billed to.
    #[arg(long, requires = "prompt")]
    project: Option<String>,

    /// Explicit catalog key for the one-shot prompt.
    #[arg(long, requires = "prompt")]
    model: Option<String>,

    /// Rendering of the periodic and final metrics snapshots.
    #[arg(long, value_enum, default_value_t = MetricsFormat::Json)]
    metrics_format: MetricsFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MetricsFormat {
    Json,
    Prometheus,
}

impl MetricsFormat {
    fn render(self, metrics: &MetricsCollector) -> String {
        match self {
            MetricsFormat::Json => metrics.export_json().to_string(),
            MetricsFormat::Prometheus => metrics.export_prometheus(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(dir) = &cli.adapters {
        config.adapters.dir = Some(dir.display().to_string());
    }

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.general.log_level.clone());
    let format = LogFormat::from_json_flag(cli.json_logs || config.general.json_logs);
    init_logging(&config.general.service_name, &level, format);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "switchboard starting");

    // 0 turns periodic upkeep off
    let refresh = match config.router.availability_refresh_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let shutdown = ShutdownSignal::new();
    let metrics = Arc::new(MetricsCollector::new());
    let router = Arc::new(RequestRouter::boot(config, shutdown.clone(), metrics).await);

    if let Some(prompt) = cli.prompt {
        return one_shot(&router, &prompt, cli.project, cli.model, cli.metrics_format).await;
    }

    for model in router.catalog().descriptors() {
        info!(
            model = model.key(),
            provider = %model.provider,
            free = model.is_free(),
            listed = router.catalog().is_listed(&model),
            "catalog entry"
        );
    }

    let upkeep = refresh.map(|every| {
        tokio::spawn(maintenance_loop(
            router.clone(),
            every,
            cli.metrics_format,
            shutdown.listener(),
        ))
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, draining ledger writes");

    let drained = router.shutdown(DRAIN_TIMEOUT).await;
    if !drained.is_complete() {
        warn!(?drained, "exiting with writes still queued");
    }
    if let Some(task) = upkeep {
        if let Err(e) = task.await {
            warn!(error = %e, "maintenance task ended abnormally");
        }
    }
    info!(metrics = %cli.metrics_format.render(router.metrics()), "switchboard stopped");
    Ok(())
}

async fn one_shot(
    router: &RequestRouter,
    prompt: &str,
    project: Option<String>,
    model: Option<String>,
    metrics_format: MetricsFormat,
) -> Result<()> {
    let model = match model {
        Some(key) => Some(
            router
                .model(&key)
                .with_context(|| format!("unknown model '{key}'"))?,
        ),
        None => None,
    };
    let ctx = match project {
        Some(project) => RequestContext::for_project(project),
        None => RequestContext::default(),
    };

    let outcome = router.generate(prompt, model, &ctx).await;
    let printed = match &outcome {
        Ok(generated) => serde_json::to_string_pretty(generated)?,
        Err(failure) => serde_json::to_string_pretty(failure)?,
    };
    println!("{printed}");

    let drained = router.shutdown(DRAIN_TIMEOUT).await;
    if !drained.is_complete() {
        warn!(?drained, "exiting with writes still queued");
    }
    debug!(metrics = %metrics_format.render(router.metrics()), "one-shot metrics");
    outcome.map(|_| ()).map_err(Into::into)
}

/// Availability refresh plus cache sweep, until shutdown. Each pass logs a
/// metrics snapshot.
async fn maintenance_loop(
    router: Arc<RequestRouter>,
    every: Duration,
    format: MetricsFormat,
    mut stop: ShutdownListener,
) {
    let mut ticker = tokio::time::interval(every);
    // boot already refreshed
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                router.maintain().await;
                info!(metrics = %format.render(router.metrics()), "metrics snapshot");
            }
            _ = stop.triggered() => break,
        }
    }
}
