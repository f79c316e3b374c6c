//! Printer command transport
//!
//! The core talks to printer firmware through an opaque capability: submit a
//! command line and await the firmware's result, plus a broadcast stream of
//! JSON status snapshots. The wire format belongs to the transport
//! implementation; this layer never inspects it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by the command transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Transport disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}

/// Opaque request/response channel to the printer firmware.
///
/// `submit` resolves when the firmware reports the command finished — for
/// feed commands that is the asynchronous completion of the hardware
/// operation the command started.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Submit a command and wait for the firmware's result.
    async fn submit(&self, command: &str) -> Result<(), TransportError>;

    /// Subscribe to JSON status snapshots pushed by the firmware.
    fn status_updates(&self) -> broadcast::Receiver<serde_json::Value>;
}

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// In-process transport double.
///
/// Commands are recorded and acknowledged after a configurable delay, with
/// outcomes optionally scripted ahead of time; status snapshots are injected
/// by whatever drives the simulation. Used by backend tests and the CLI.
pub struct ChannelTransport {
    status_tx: broadcast::Sender<serde_json::Value>,
    submitted: Mutex<Vec<String>>,
    scripted: Mutex<VecDeque<Result<(), TransportError>>>,
    ack_delay: Duration,
}

impl ChannelTransport {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        ChannelTransport {
            status_tx,
            submitted: Mutex::new(Vec::new()),
            scripted: Mutex::new(VecDeque::new()),
            ack_delay: Duration::ZERO,
        }
    }

    /// Delay applied before each command acknowledgement. Uses tokio time,
    /// so paused-clock tests advance through it instantly.
    pub fn with_ack_delay(mut self, delay: Duration) -> Self {
        self.ack_delay = delay;
        self
    }

    /// Queue an outcome for a future `submit`. Unscripted submits succeed.
    pub fn script_outcome(&self, outcome: Result<(), TransportError>) {
        self.scripted.lock().unwrap().push_back(outcome);
    }

    /// Commands submitted so far, in order.
    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    /// Push a status snapshot to all subscribers.
    pub fn push_status(&self, status: serde_json::Value) {
        let _ = self.status_tx.send(status);
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        ChannelTransport::new()
    }
}

#[async_trait]
impl CommandTransport for ChannelTransport {
    async fn submit(&self, command: &str) -> Result<(), TransportError> {
        self.submitted.lock().unwrap().push(command.to_string());
        if !self.ack_delay.is_zero() {
            tokio::time::sleep(self.ack_delay).await;
        }
        self.scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn status_updates(&self) -> broadcast::Receiver<serde_json::Value> {
        self.status_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_records_and_acks() {
        let transport = ChannelTransport::new();
        transport.submit("T0").await.unwrap();
        transport.submit("TOOL_UNLOAD LANE=lane0").await.unwrap();
        assert_eq!(transport.submitted(), vec!["T0", "TOOL_UNLOAD LANE=lane0"]);
    }

    #[tokio::test]
    async fn test_scripted_outcomes_consumed_in_order() {
        let transport = ChannelTransport::new();
        transport.script_outcome(Err(TransportError::Rejected("jam".into())));
        transport.script_outcome(Ok(()));

        assert!(transport.submit("T0").await.is_err());
        assert!(transport.submit("T1").await.is_ok());
        // Script exhausted: default is success.
        assert!(transport.submit("T2").await.is_ok());
    }

    #[tokio::test]
    async fn test_status_updates_reach_subscribers() {
        let transport = ChannelTransport::new();
        let mut rx = transport.status_updates();
        transport.push_status(json!({"AFC": {"current_lane": "lane1"}}));
        let status = rx.recv().await.unwrap();
        assert_eq!(status["AFC"]["current_lane"], "lane1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_delay_uses_virtual_time() {
        let transport = ChannelTransport::new().with_ack_delay(Duration::from_secs(3));
        let before = tokio::time::Instant::now();
        transport.submit("T0").await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(3));
    }
}
