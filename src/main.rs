mod aggregator;
mod config;
mod errors;
mod event;
mod http;
mod metrics;
mod parser;
mod pipeline;
mod rules;
mod source;
mod tags;
mod util;

use aggregator::Aggregator;
use clap::Parser;
use config::Config;
use errors::Result;
use http::MetricsCache;
use log::{error, info};
use parser::EventParser;
use source::{run_with_reconnect, ChannelSource, EventSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "salt-telemetry-collector")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "COLLECTOR_CONFIG", default_value = "/etc/salt-telemetry-collector/config.yaml")]
    config: PathBuf,
}

/// Wire up a real event-bus client here. The bundled `ChannelSource` is an
/// in-process stand-in with nothing feeding it, useful for running the rest
/// of the pipeline under test or in a dry-run deployment.
fn build_source() -> Box<dyn EventSource> {
    let (_tx, rx) = mpsc::channel(pipeline::QUEUE_CAPACITY);
    Box::new(ChannelSource::new(rx))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    info!("loading configuration from {}", cli.config.display());

    let config = match Config::from_path(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };
    let compiled = match config.compile() {
        Ok(compiled) => Arc::new(compiled),
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    info!("readers_subprocesses={}", compiled.readers_subprocesses);
    info!("job_timeout={}s metrics_timeout={}s", compiled.job_timeout, compiled.metrics_timeout);

    let shutdown = CancellationToken::new();
    let aggregator = Arc::new(Aggregator::new());
    let metrics_cache = Arc::new(MetricsCache::new());
    let parser = Arc::new(EventParser::new(compiled.rename_rules.clone()));
    let pipeline_metrics = Arc::new(pipeline::PipelineMetrics::default());

    let (filtered_tx, filtered_rx) = mpsc::channel(pipeline::QUEUE_CAPACITY);
    let filtered_rx = Arc::new(tokio::sync::Mutex::new(filtered_rx));
    let (parsed_tx, parsed_rx) = mpsc::channel(pipeline::QUEUE_CAPACITY);

    let source = build_source();
    let (raw_tx, raw_rx) = mpsc::channel(pipeline::QUEUE_CAPACITY);

    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(run_with_reconnect(source, raw_tx, shutdown.clone())));

    tasks.push(tokio::spawn(pipeline::run_ingress_filter(
        raw_rx,
        filtered_tx,
        compiled.clone(),
        pipeline_metrics.clone(),
        shutdown.clone(),
    )));

    for worker_index in 0..compiled.readers_subprocesses {
        tasks.push(tokio::spawn(pipeline::run_parser_worker(
            worker_index,
            filtered_rx.clone(),
            parsed_tx.clone(),
            parser.clone(),
            pipeline_metrics.clone(),
            shutdown.clone(),
        )));
    }
    drop(parsed_tx);

    tasks.push(tokio::spawn(pipeline::run_aggregator_writer(parsed_rx, aggregator.clone(), shutdown.clone())));

    tasks.push(tokio::spawn(run_maintenance_loop(aggregator.clone(), metrics_cache.clone(), compiled.clone(), shutdown.clone())));

    let router = http::router(metrics_cache.clone(), compiled.metrics_timeout);
    let listener = tokio::net::TcpListener::bind((compiled.restapi.host.as_str(), compiled.restapi.port))
        .await
        .unwrap_or_else(|err| {
            error!("failed to bind {}:{}: {err}", compiled.restapi.host, compiled.restapi.port);
            std::process::exit(1);
        });
    info!("metrics endpoint listening on {}:{}", compiled.restapi.host, compiled.restapi.port);

    let server_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
            .ok();
    }));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping pipeline");
    shutdown.cancel();

    let grace_period = tokio::time::sleep(Duration::from_secs(5));
    tokio::pin!(grace_period);
    for task in tasks {
        tokio::select! {
            _ = &mut grace_period => {
                info!("grace period elapsed, abandoning remaining tasks");
                break;
            }
            _ = task => {}
        }
    }

    Ok(())
}

/// Runs the three independent maintenance sweeps on one ticker, matching the
/// reference implementation's single 0.2s poll checking three deadlines
/// rather than three separate timers that could drift out of phase.
async fn run_maintenance_loop(
    aggregator: Arc<Aggregator>,
    metrics_cache: Arc<MetricsCache>,
    config: Arc<config::CompiledConfig>,
    shutdown: CancellationToken,
) {
    const TICK: Duration = Duration::from_millis(200);
    const PUBLISH_INTERVAL: Duration = Duration::from_secs(3);
    const STALE_REPUBLISH: Duration = Duration::from_secs(110);

    let mut since_timeout_check = Duration::ZERO;
    let mut since_metrics_update = Duration::ZERO;
    let mut since_cleanup = Duration::ZERO;
    let mut since_publish = Duration::ZERO;
    let mut last_epoch: Option<u64> = None;
    let mut last_publish_age = Duration::ZERO;

    let mut ticker = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }

        since_timeout_check += TICK;
        since_metrics_update += TICK;
        since_cleanup += TICK;
        since_publish += TICK;
        last_publish_age += TICK;

        if since_timeout_check >= Duration::from_secs(config.job_timeout_check_interval) {
            since_timeout_check = Duration::ZERO;
            aggregator.complete_with_timeout(config.job_timeout);
        }

        if since_cleanup >= Duration::from_secs(config.job_jids_cleanup_interval) {
            since_cleanup = Duration::ZERO;
            aggregator.cleanup_job_jids(config.job_timeout * 2);
        }

        if since_metrics_update >= Duration::from_secs(config.job_metrics_update_interval) {
            since_metrics_update = Duration::ZERO;
            let _ = aggregator.jobs_metrics_update();
        }

        if since_publish >= PUBLISH_INTERVAL {
            since_publish = Duration::ZERO;
            let epoch = aggregator.get_metrics_epoch();
            let changed = last_epoch != Some(epoch);
            if changed || last_epoch.is_none() || last_publish_age > STALE_REPUBLISH {
                last_epoch = Some(epoch);
                last_publish_age = Duration::ZERO;
                let snapshot = aggregator.jobs_metrics_update();
                metrics_cache.publish(metrics::render(&snapshot));
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
