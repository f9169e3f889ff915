//! Wires the event source to the parser pool to the aggregator: an ingress
//! filter drops anything not matched by the primary or additional regexes,
//! a bounded queue feeds N parser workers, and a second bounded queue feeds
//! the single aggregator writer. Both queues drop-and-count on backpressure
//! rather than blocking the source — a slow consumer must never stall the
//! bus read loop.

use crate::aggregator::Aggregator;
use crate::config::CompiledConfig;
use crate::event::{ParsedEvent, RawEvent};
use crate::parser::EventParser;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const QUEUE_CAPACITY: usize = 4096;

#[derive(Default)]
pub struct PipelineMetrics {
    pub ingress_dropped: AtomicU64,
    pub parsed_dropped: AtomicU64,
    pub ingress_filtered: AtomicU64,
}

fn matches_filter(tag: &str, primary: &Regex, additional: &[Regex]) -> bool {
    primary.is_match(tag) || additional.iter().any(|re| re.is_match(tag))
}

/// Reads off `raw_rx`, drops events the configured regexes don't select, and
/// forwards the rest to `filtered_tx`. This is the single consumer of the
/// source's output channel.
pub async fn run_ingress_filter(
    mut raw_rx: mpsc::Receiver<RawEvent>,
    filtered_tx: mpsc::Sender<RawEvent>,
    config: Arc<CompiledConfig>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = raw_rx.recv() => event,
            _ = shutdown.cancelled() => return,
        };
        let Some(event) = event else { return };

        if !matches_filter(&event.tag, &config.events_regex_filter, &config.events_additional) {
            metrics.ingress_filtered.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if filtered_tx.try_send(event).is_err() {
            metrics.ingress_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// One parser worker: pulls filtered events, parses them, forwards survivors
/// to the aggregator's input queue. `readers_subprocesses` of these run
/// concurrently, sharing the same `filtered_rx`. Each worker stamps its own
/// index onto every record it produces (`rix`).
pub async fn run_parser_worker(
    worker_index: usize,
    filtered_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RawEvent>>>,
    parsed_tx: mpsc::Sender<ParsedEvent>,
    parser: Arc<EventParser>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
) {
    loop {
        let event = {
            let mut rx = filtered_rx.lock().await;
            tokio::select! {
                event = rx.recv() => event,
                _ = shutdown.cancelled() => return,
            }
        };
        let Some(event) = event else { return };

        if let Some(mut parsed) = parser.parse(&event.tag, &event.payload) {
            parsed.rix = Some(worker_index);
            if parsed_tx.try_send(parsed).is_err() {
                metrics.parsed_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// The sole writer into the aggregator: drains `parsed_rx` and folds each
/// event in. Single-writer by construction — no lock contention from the
/// parser pool reaches the aggregator directly.
pub async fn run_aggregator_writer(
    mut parsed_rx: mpsc::Receiver<ParsedEvent>,
    aggregator: Arc<Aggregator>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = parsed_rx.recv() => event,
            _ = shutdown.cancelled() => return,
        };
        let Some(event) = event else { return };
        aggregator.add(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn filters_out_non_matching_tags() {
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (filtered_tx, mut filtered_rx) = mpsc::channel(8);
        let config = Arc::new(CompiledConfig {
            events_regex_filter: Regex::new("^salt/job/").unwrap(),
            events_additional: vec![],
            readers_subprocesses: 1,
            rename_rules: crate::rules::RenameRules::empty(),
            job_timeout: 1,
            job_timeout_check_interval: 1,
            job_metrics_update_interval: 1,
            job_jids_cleanup_interval: 1,
            metrics_timeout: 1,
            restapi: crate::config::RestApiConfig::default(),
        });
        let metrics = Arc::new(PipelineMetrics::default());
        let shutdown = CancellationToken::new();

        raw_tx.send(RawEvent { tag: "salt/job/1/new".to_string(), payload: json!({}) }).await.unwrap();
        raw_tx.send(RawEvent { tag: "minion/refresh".to_string(), payload: json!({}) }).await.unwrap();
        drop(raw_tx);

        run_ingress_filter(raw_rx, filtered_tx, config, metrics.clone(), shutdown).await;

        let passed = filtered_rx.recv().await.unwrap();
        assert_eq!(passed.tag, "salt/job/1/new");
        assert!(filtered_rx.recv().await.is_none());
        assert_eq!(metrics.ingress_filtered.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn parser_worker_drops_unparseable_events_silently() {
        let (filtered_tx, filtered_rx) = mpsc::channel(8);
        let (parsed_tx, mut parsed_rx) = mpsc::channel(8);
        let filtered_rx = Arc::new(tokio::sync::Mutex::new(filtered_rx));
        let parser = Arc::new(EventParser::new(crate::rules::RenameRules::empty()));
        let metrics = Arc::new(PipelineMetrics::default());
        let shutdown = CancellationToken::new();

        filtered_tx.send(RawEvent { tag: "salt/job/1/new".to_string(), payload: json!({"jid": "1"}) }).await.unwrap();
        drop(filtered_tx);

        run_parser_worker(0, filtered_rx, parsed_tx, parser, metrics, shutdown).await;
        assert!(parsed_rx.recv().await.is_none());
    }
}
