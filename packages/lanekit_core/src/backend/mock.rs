//! Deterministic feed-system simulator
//!
//! Reproduces the full backend contract without hardware: accepted
//! operations walk the filament path segment by segment on tokio timers and
//! publish exactly one completion tagged with the request's sequence number.
//! All simulated durations are divided by a shared speedup factor so a test
//! suite can compress a multi-second hardware load into milliseconds without
//! changing any logic path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::broadcast;

use super::{FeedBackend, FeedError, FeedEvent, EVENT_CHANNEL_CAPACITY};
use crate::topology::{
    FilamentInfo, Lane, LaneStatus, PathSegment, ToolId, Topology, TopologyKind,
};

/// Base duration of one path-segment step at speedup 1.0.
const SEGMENT_STEP: Duration = Duration::from_millis(250);

/// Segments traversed while loading, nearest to furthest.
const LOAD_SEQUENCE: [PathSegment; 7] = [
    PathSegment::Spool,
    PathSegment::Prep,
    PathSegment::Lane,
    PathSegment::Hub,
    PathSegment::Output,
    PathSegment::Toolhead,
    PathSegment::Nozzle,
];

/// Segments traversed while unloading, furthest back to none.
const UNLOAD_SEQUENCE: [PathSegment; 8] = [
    PathSegment::Nozzle,
    PathSegment::Toolhead,
    PathSegment::Output,
    PathSegment::Hub,
    PathSegment::Lane,
    PathSegment::Prep,
    PathSegment::Spool,
    PathSegment::None,
];

// ---------------------------------------------------------------------------
// Simulation speed
// ---------------------------------------------------------------------------

/// Shared scalar dividing all simulated operation durations.
///
/// Cloning shares the underlying value, so a test can hold a handle to the
/// same speed a backend uses.
#[derive(Clone)]
pub struct SimulationSpeed {
    factor: Arc<Mutex<f64>>,
}

impl SimulationSpeed {
    pub fn new(factor: f64) -> Self {
        SimulationSpeed {
            factor: Arc::new(Mutex::new(Self::clamp(factor))),
        }
    }

    fn clamp(factor: f64) -> f64 {
        if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            1.0
        }
    }

    pub fn get(&self) -> f64 {
        *self.factor.lock().unwrap()
    }

    pub fn set(&self, factor: f64) {
        *self.factor.lock().unwrap() = Self::clamp(factor);
    }

    /// Divide `base` by the current factor.
    pub fn scaled(&self, base: Duration) -> Duration {
        base.div_f64(self.get())
    }

    /// Scoped override: the prior factor is reinstated when the returned
    /// guard drops, so a test cannot leak its compression into the next.
    pub fn override_with(&self, factor: f64) -> SpeedOverride {
        let prior = self.get();
        self.set(factor);
        SpeedOverride {
            speed: self.clone(),
            prior,
        }
    }
}

impl Default for SimulationSpeed {
    fn default() -> Self {
        SimulationSpeed::new(1.0)
    }
}

/// Guard restoring a [`SimulationSpeed`] to its prior value on drop.
pub struct SpeedOverride {
    speed: SimulationSpeed,
    prior: f64,
}

impl Drop for SpeedOverride {
    fn drop(&mut self) {
        self.speed.set(self.prior);
    }
}

// ---------------------------------------------------------------------------
// Sample filament data
// ---------------------------------------------------------------------------

/// Sample filaments cycled across simulated lanes for realistic snapshots.
const SAMPLE_FILAMENTS: [(u32, &str); 8] = [
    (0xE53935, "PLA"),
    (0x1E88E5, "PETG"),
    (0x43A047, "ABS"),
    (0xFDD835, "ASA"),
    (0x424242, "PLA-CF"),
    (0x8E24AA, "PA-CF"),
    (0xFF6F00, "TPU"),
    (0x90CAF9, "PETG-GF"),
];

fn sample_lane(index: usize, tool: ToolId) -> Lane {
    let (color_rgb, material) = SAMPLE_FILAMENTS[index % SAMPLE_FILAMENTS.len()];
    let mut lane = Lane::with_tool(format!("lane{index}"), tool);
    lane.status = LaneStatus::Available;
    lane.filament = FilamentInfo {
        color_rgb,
        material: material.to_string(),
        spool_weight_g: Some(1000.0),
    };
    lane
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

struct MockState {
    topology: Topology,
    mounted: Option<String>,
    segment: PathSegment,
    current_op: Option<u64>,
    fail_next: Option<String>,
}

struct MockInner {
    state: Mutex<MockState>,
    events: broadcast::Sender<FeedEvent>,
    running: AtomicBool,
    speed: SimulationSpeed,
}

/// Simulated feed backend.
pub struct MockBackend {
    inner: Arc<MockInner>,
}

impl MockBackend {
    fn with_topology(topology: Topology, speed: SimulationSpeed) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        MockBackend {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    topology,
                    mounted: None,
                    segment: PathSegment::None,
                    current_op: None,
                    fail_next: None,
                }),
                events,
                running: AtomicBool::new(false),
                speed,
            }),
        }
    }

    /// Hub scenario: `lane_count` lanes converging on the single nozzle T0.
    pub fn hub(lane_count: usize, speed: SimulationSpeed) -> Self {
        let lanes = (0..lane_count.max(1))
            .map(|i| sample_lane(i, ToolId(0)))
            .collect();
        Self::with_topology(Topology::new(TopologyKind::Hub, lanes), speed)
    }

    /// Tool-changer scenario: one lane per physical tool, 1:1 mapping.
    pub fn tool_changer(lane_count: usize, speed: SimulationSpeed) -> Self {
        let lanes = (0..lane_count.max(1))
            .map(|i| sample_lane(i, ToolId(i as u32)))
            .collect();
        Self::with_topology(Topology::new(TopologyKind::ToolChanger, lanes), speed)
    }

    /// Single-extruder scenario: one lane, one nozzle.
    pub fn single_extruder(speed: SimulationSpeed) -> Self {
        Self::with_topology(
            Topology::new(TopologyKind::SingleExtruder, vec![sample_lane(0, ToolId(0))]),
            speed,
        )
    }

    /// Handle to the speed scalar shared with this backend.
    pub fn speed(&self) -> SimulationSpeed {
        self.inner.speed.clone()
    }

    /// Make the next accepted operation fail with `message`.
    pub fn fail_next_operation(&self, message: impl Into<String>) {
        self.inner.state.lock().unwrap().fail_next = Some(message.into());
    }

    /// Replace the topology snapshot, as hardware hot-plug would.
    pub fn replace_topology(&self, topology: Topology) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.topology = topology;
        }
        let _ = self.inner.events.send(FeedEvent::TopologyChanged);
    }

    /// Force a lane's status, e.g. to simulate a spool running out.
    pub fn force_lane_status(&self, lane: &str, status: LaneStatus) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(l) = state.topology.lanes.iter_mut().find(|l| l.name == lane) {
            l.status = status;
        }
    }
}

impl MockInner {
    fn emit(&self, event: FeedEvent) {
        let _ = self.events.send(event);
    }

    /// Common acceptance path: backend running, no operation in flight.
    /// Marks `seq` outstanding.
    fn accept(&self, seq: u64) -> Result<(), FeedError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(FeedError::NotRunning);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.current_op {
            return Err(FeedError::Busy(format!("request #{active} in flight")));
        }
        state.current_op = Some(seq);
        Ok(())
    }

    /// Take the scripted failure, if any. Called only after a request has
    /// passed validation so a rejection does not consume it.
    fn take_scripted_failure(&self) -> Option<String> {
        self.state.lock().unwrap().fail_next.take()
    }

    fn rollback(&self, seq: u64) {
        let mut state = self.state.lock().unwrap();
        if state.current_op == Some(seq) {
            state.current_op = None;
        }
    }

    fn finish(&self, seq: u64, outcome: Result<(), String>, mounted: Option<Option<String>>) {
        {
            let mut state = self.state.lock().unwrap();
            state.current_op = None;
            if outcome.is_ok() {
                if let Some(mounted) = mounted {
                    // Update lane statuses to match the new mount state.
                    if let Some(prev) = state.mounted.take() {
                        if let Some(l) =
                            state.topology.lanes.iter_mut().find(|l| l.name == prev)
                        {
                            l.status = LaneStatus::Available;
                        }
                    }
                    if let Some(name) = &mounted {
                        if let Some(l) =
                            state.topology.lanes.iter_mut().find(|l| &l.name == name)
                        {
                            l.status = LaneStatus::Loaded;
                        }
                    }
                    state.mounted = mounted;
                }
            }
        }
        self.emit(FeedEvent::OperationComplete { seq, outcome });
        self.emit(FeedEvent::StateChanged);
    }
}

/// Walk `segments`, sleeping one scaled step between each, publishing
/// `StateChanged` as the filament advances. Returns `false` if the backend
/// was torn down or stopped mid-walk.
async fn walk_segments(weak: &Weak<MockInner>, segments: &[PathSegment]) -> bool {
    for segment in segments {
        let step = {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            if !inner.running.load(Ordering::SeqCst) {
                return false;
            }
            inner.state.lock().unwrap().segment = *segment;
            inner.emit(FeedEvent::StateChanged);
            inner.speed.scaled(SEGMENT_STEP)
        };
        tokio::time::sleep(step).await;
    }
    true
}

/// Simulate an operation: optional unload walk, optional load walk, then one
/// completion. A scripted failure aborts after the first half-walk.
async fn run_operation(
    weak: Weak<MockInner>,
    seq: u64,
    unload_first: bool,
    load_after: bool,
    target: Option<String>,
    fail: Option<String>,
) {
    if unload_first {
        if !walk_segments(&weak, &UNLOAD_SEQUENCE).await {
            return;
        }
        if let Some(message) = &fail {
            if let Some(inner) = weak.upgrade() {
                inner.finish(seq, Err(message.clone()), None);
            }
            return;
        }
    }

    if load_after {
        if let Some(message) = &fail {
            // Failure scripted on a pure load: stall partway down the path.
            if !walk_segments(&weak, &LOAD_SEQUENCE[..3]).await {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.finish(seq, Err(message.clone()), None);
            }
            return;
        }
        if !walk_segments(&weak, &LOAD_SEQUENCE).await {
            return;
        }
    }

    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mounted = if load_after {
        Some(target)
    } else {
        Some(None) // unload-only: clear the mount record
    };
    inner.finish(seq, Ok(()), mounted);
}

#[async_trait]
impl FeedBackend for MockBackend {
    fn topology(&self) -> Topology {
        self.inner.state.lock().unwrap().topology.clone()
    }

    fn mounted_lane(&self) -> Option<String> {
        self.inner.state.lock().unwrap().mounted.clone()
    }

    fn path_segment(&self) -> PathSegment {
        self.inner.state.lock().unwrap().segment
    }

    fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.inner.events.subscribe()
    }

    async fn start(&self) -> Result<(), FeedError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("[mock] backend started ({} lanes)", self.topology().lanes.len());
        self.inner.emit(FeedEvent::StateChanged);
        Ok(())
    }

    fn stop(&self) {
        // In-flight simulation tasks observe the flag and exit quietly.
        self.inner.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn begin_change_tool(&self, tool: ToolId, seq: u64) -> Result<(), FeedError> {
        self.inner.accept(seq)?;

        let (target, was_mounted) = {
            let state = self.inner.state.lock().unwrap();
            let Some(lane) = state.topology.lane_for_tool(tool) else {
                drop(state);
                self.inner.rollback(seq);
                return Err(FeedError::InvalidTarget(format!("no lane feeds {tool}")));
            };
            (lane.name.clone(), state.mounted.is_some())
        };
        let fail = self.inner.take_scripted_failure();

        debug!("[mock] #{seq} change tool -> {tool} via {target}");
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(run_operation(weak, seq, was_mounted, true, Some(target), fail));
        Ok(())
    }

    async fn begin_load(&self, lane: &str, seq: u64) -> Result<(), FeedError> {
        self.inner.accept(seq)?;

        {
            let state = self.inner.state.lock().unwrap();
            match state.topology.lane(lane) {
                None => {
                    drop(state);
                    self.inner.rollback(seq);
                    return Err(FeedError::InvalidTarget(format!("unknown lane {lane}")));
                }
                Some(l) if l.status == LaneStatus::Empty => {
                    drop(state);
                    self.inner.rollback(seq);
                    return Err(FeedError::InvalidTarget(format!("lane {lane} is empty")));
                }
                Some(_) => {}
            }
        }
        let fail = self.inner.take_scripted_failure();

        debug!("[mock] #{seq} load {lane}");
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(run_operation(
            weak,
            seq,
            false,
            true,
            Some(lane.to_string()),
            fail,
        ));
        Ok(())
    }

    async fn begin_unload(&self, lane: &str, seq: u64) -> Result<(), FeedError> {
        self.inner.accept(seq)?;

        {
            let state = self.inner.state.lock().unwrap();
            if state.mounted.is_none() {
                drop(state);
                self.inner.rollback(seq);
                return Err(FeedError::NothingMounted);
            }
        }
        let fail = self.inner.take_scripted_failure();

        debug!("[mock] #{seq} unload {lane}");
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(run_operation(weak, seq, true, false, None, fail));
        Ok(())
    }
}
