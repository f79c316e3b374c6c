//! Feed system backends
//!
//! One capability contract, two conforming implementations: [`afc::AfcBackend`]
//! drives real AFC hardware through the command transport, [`mock::MockBackend`]
//! simulates the same behavior deterministically. The tool-change machine
//! treats both identically.

pub mod afc;
pub mod mock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::topology::{PathSegment, ToolId, Topology};
use crate::transport::TransportError;

/// Capacity of backend event channels.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors surfaced by feed operations.
#[derive(Error, Debug)]
pub enum FeedError {
    /// The request references a tool or lane absent from the current
    /// topology. Rejected synchronously, no state change.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// An operation is already in flight. Rejected synchronously, never
    /// queued.
    #[error("Operation in progress: {0}")]
    Busy(String),

    /// Unload requested with no mounted lane.
    #[error("No filament mounted")]
    NothingMounted,

    /// The backend's asynchronous operation failed.
    #[error("Hardware failure: {0}")]
    HardwareFailure(String),

    /// The backend has not been started.
    #[error("Backend not running")]
    NotRunning,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Event published on a backend's broadcast channel.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// The lane/tool arrangement was replaced.
    TopologyChanged,
    /// Mount state, sensors, or path segment changed.
    StateChanged,
    /// A previously accepted operation finished. Exactly one of these is
    /// published per accepted request, carrying its sequence number.
    OperationComplete {
        seq: u64,
        outcome: Result<(), String>,
    },
    /// Asynchronous fault outside any operation (e.g. a hardware error
    /// report on the status feed).
    Fault(String),
}

/// Capability contract for feed-system hardware.
///
/// Every accepted `begin_*` call MUST eventually publish exactly one
/// [`FeedEvent::OperationComplete`] with the same `seq` — a silently dropped
/// completion is a fatal communication fault. There is no cancellation: feed
/// motors cannot be safely interrupted mid-stroke, so operations run to
/// completion or failure.
#[async_trait]
pub trait FeedBackend: Send + Sync {
    /// Current topology snapshot.
    fn topology(&self) -> Topology;

    /// Name of the lane whose filament is mounted, if any.
    fn mounted_lane(&self) -> Option<String>;

    /// Furthest point filament has reached along the feed path.
    fn path_segment(&self) -> PathSegment;

    /// Subscribe to backend events.
    fn events(&self) -> broadcast::Receiver<FeedEvent>;

    /// Start consuming the hardware status feed.
    async fn start(&self) -> Result<(), FeedError>;

    /// Stop the backend. In-flight asynchronous work is abandoned cleanly;
    /// no completion is delivered after teardown.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Begin a tool change toward `tool`.
    async fn begin_change_tool(&self, tool: ToolId, seq: u64) -> Result<(), FeedError>;

    /// Begin loading filament from `lane`.
    async fn begin_load(&self, lane: &str, seq: u64) -> Result<(), FeedError>;

    /// Begin unloading the mounted filament back into `lane`.
    async fn begin_unload(&self, lane: &str, seq: u64) -> Result<(), FeedError>;
}
