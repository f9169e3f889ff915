//! The event-bus boundary. `EventSource` is the seam between this collector
//! and whatever transport actually carries control-plane events; production
//! wiring plugs in a real bus client, tests plug in [`ChannelSource`].
//!
//! The reconnect supervisor reproduces the reference implementation's watchdog
//! cadence verbatim: check every 3 seconds, never attempt a reconnect less
//! than 10 seconds after the last attempt.

use crate::event::RawEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_secs(3);
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(String),
}

/// A connection to the event bus. Implementors own their own retry-free
/// connect/receive primitives; the supervisor in this module owns backoff.
#[async_trait::async_trait]
pub trait EventSource: Send {
    async fn connect(&mut self) -> Result<(), SourceError>;
    fn is_connected(&self) -> bool;
    /// Receive the next event, or `Ok(None)` on a clean disconnect.
    async fn recv(&mut self) -> Result<Option<RawEvent>, SourceError>;
}

/// Drives an [`EventSource`], forwarding events into `tx` and reconnecting on
/// failure with the watchdog's fixed cadence. Runs until `shutdown` fires.
pub async fn run_with_reconnect(
    mut source: Box<dyn EventSource>,
    tx: mpsc::Sender<RawEvent>,
    shutdown: CancellationToken,
) {
    let mut last_attempt: Option<Instant> = None;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        if !source.is_connected() {
            let ready = match last_attempt {
                Some(t) => t.elapsed() >= RECONNECT_BACKOFF,
                None => true,
            };
            if !ready {
                tokio::select! {
                    _ = tokio::time::sleep(WATCHDOG_CHECK_INTERVAL) => {}
                    _ = shutdown.cancelled() => return,
                }
                continue;
            }

            last_attempt = Some(Instant::now());
            if let Err(err) = source.connect().await {
                log::warn!("event source connect failed: {err}, retrying in {RECONNECT_BACKOFF:?}");
                tokio::select! {
                    _ = tokio::time::sleep(WATCHDOG_CHECK_INTERVAL) => {}
                    _ = shutdown.cancelled() => return,
                }
                continue;
            }
            log::info!("event source connected");
        }

        tokio::select! {
            received = source.recv() => {
                match received {
                    Ok(Some(event)) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        log::warn!("event source disconnected cleanly");
                    }
                    Err(err) => {
                        log::warn!("event source recv error: {err}");
                    }
                }
            }
            _ = shutdown.cancelled() => return,
        }
    }
}

/// In-process source backed by a channel — used in tests and for any
/// in-process event producer that doesn't need a real bus client.
pub struct ChannelSource {
    rx: mpsc::Receiver<RawEvent>,
    connected: bool,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<RawEvent>) -> Self {
        ChannelSource { rx, connected: false }
    }
}

#[async_trait::async_trait]
impl EventSource for ChannelSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn recv(&mut self) -> Result<Option<RawEvent>, SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected);
        }
        Ok(self.rx.recv().await)
    }
}
