//! AFC hardware backend
//!
//! Drives a real AFC-style filament changer through the printer command
//! transport. Status snapshots pushed by the firmware are translated into
//! the topology model; change/load/unload are issued as firmware commands
//! and the transport's asynchronous result is relayed as the completion,
//! tagged with the request's sequence number.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{FeedBackend, FeedError, FeedEvent, EVENT_CHANNEL_CAPACITY};
use crate::lanes::sort_and_dedupe;
use crate::topology::{
    Lane, LaneStatus, PathSegment, ToolId, Topology, TopologyKind,
};
use crate::transport::CommandTransport;

const STEPPER_KEY_PREFIX: &str = "AFC_stepper ";
const LANE_KEY_PREFIX: &str = "AFC_lane ";
const HUB_KEY_PREFIX: &str = "AFC_hub ";
const EXTRUDER_KEY: &str = "AFC_extruder extruder";

/// Parsed hardware state, refreshed from the status feed.
struct AfcStatus {
    topology: Topology,
    current_lane: Option<String>,
    filament_loaded: bool,
    hub_sensor: bool,
    tool_start_sensor: bool,
    tool_end_sensor: bool,
    last_error: Option<String>,
    current_op: Option<u64>,
}

impl AfcStatus {
    fn new() -> Self {
        AfcStatus {
            topology: Topology::empty(TopologyKind::Hub),
            current_lane: None,
            filament_loaded: false,
            hub_sensor: false,
            tool_start_sensor: false,
            tool_end_sensor: false,
            last_error: None,
            current_op: None,
        }
    }

    fn lane_names(&self) -> Vec<String> {
        self.topology.lanes.iter().map(|l| l.name.clone()).collect()
    }

    /// Replace the lane set, carrying over data for lanes that survive.
    /// New lanes default to the shared hub nozzle until a `map` field says
    /// otherwise.
    fn rebuild_lanes(&mut self, names: Vec<String>) {
        let lanes = names
            .iter()
            .map(|name| {
                self.topology
                    .lane(name)
                    .cloned()
                    .unwrap_or_else(|| Lane::with_tool(name.clone(), ToolId(0)))
            })
            .collect();
        self.topology = Topology::new(TopologyKind::Hub, lanes);
    }

    /// Furthest point filament has reached, from sensor states.
    ///
    /// Sensor progression on the hub path:
    ///   tool_end → Nozzle, tool_start → Toolhead, hub → Output,
    ///   loaded_to_hub → Hub, load → Lane, prep → Prep,
    ///   otherwise Spool when something is loaded, else None.
    fn path_segment(&self) -> PathSegment {
        if self.tool_end_sensor {
            return PathSegment::Nozzle;
        }
        if self.tool_start_sensor {
            return PathSegment::Toolhead;
        }
        if self.hub_sensor {
            return PathSegment::Output;
        }

        let lane_segment = |lane: &Lane| {
            if lane.sensors.loaded_to_hub {
                Some(PathSegment::Hub)
            } else if lane.sensors.load {
                Some(PathSegment::Lane)
            } else if lane.sensors.prep {
                Some(PathSegment::Prep)
            } else {
                None
            }
        };

        if let Some(current) = &self.current_lane {
            if let Some(segment) = self.topology.lane(current).and_then(lane_segment) {
                return segment;
            }
        }
        if let Some(segment) = self.topology.lanes.iter().find_map(lane_segment) {
            return segment;
        }

        if self.filament_loaded || self.current_lane.is_some() {
            PathSegment::Spool
        } else {
            PathSegment::None
        }
    }
}

struct AfcInner {
    transport: Arc<dyn CommandTransport>,
    state: Mutex<AfcStatus>,
    events: broadcast::Sender<FeedEvent>,
    running: AtomicBool,
}

/// Backend for AFC-style hub hardware.
pub struct AfcBackend {
    inner: Arc<AfcInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AfcBackend {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        AfcBackend {
            inner: Arc::new(AfcInner {
                transport,
                state: Mutex::new(AfcStatus::new()),
                events,
                running: AtomicBool::new(false),
            }),
            listener: Mutex::new(None),
        }
    }

    /// Seed lane names known from discovery before the first status arrives.
    pub fn set_discovered_lanes(&self, names: Vec<String>) {
        let names = sort_and_dedupe(names);
        if names.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        debug!("[afc] seeding {} discovered lanes", names.len());
        state.rebuild_lanes(names);
    }
}

impl Drop for AfcBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl AfcInner {
    fn emit(&self, event: FeedEvent) {
        let _ = self.events.send(event);
    }

    /// Apply one status snapshot from the firmware.
    ///
    /// Accepts either the raw params object or the notify wrapper
    /// `{"params": [{...}, timestamp]}`.
    fn apply_status(&self, status: &Value) {
        let params = match status.get("params").and_then(Value::as_array) {
            Some(array) => match array.first() {
                Some(first) if first.is_object() => first,
                _ => return,
            },
            None => status,
        };
        let Some(params) = params.as_object() else {
            return;
        };

        let mut topology_changed = false;
        let mut state_changed = false;
        let mut fault = None;

        {
            let mut state = self.state.lock().unwrap();

            // Global AFC object; older firmware uses a lowercase key.
            for key in ["AFC", "afc"] {
                if let Some(afc) = params.get(key).filter(|v| v.is_object()) {
                    fault = parse_afc_global(&mut state, afc);
                    state_changed = true;
                }
            }

            // Discover lanes directly from the notification keys so units
            // that appear only in runtime updates are still picked up.
            let mut discovered: Vec<String> = params
                .keys()
                .filter_map(|key| {
                    key.strip_prefix(STEPPER_KEY_PREFIX)
                        .or_else(|| key.strip_prefix(LANE_KEY_PREFIX))
                        .map(str::to_string)
                })
                .collect();

            if !discovered.is_empty() {
                discovered.extend(state.lane_names());
                let merged = sort_and_dedupe(discovered);
                if merged != state.lane_names() {
                    debug!("[afc] lane map synchronized ({} lanes)", merged.len());
                    state.rebuild_lanes(merged);
                    topology_changed = true;
                }
            }

            // Per-lane payloads.
            for (key, payload) in params {
                let Some(lane_name) = key
                    .strip_prefix(STEPPER_KEY_PREFIX)
                    .or_else(|| key.strip_prefix(LANE_KEY_PREFIX))
                else {
                    continue;
                };
                if payload.is_object() && parse_afc_lane(&mut state, lane_name, payload) {
                    state_changed = true;
                }
            }

            // Hub sensor state, keys like "AFC_hub Turtle_1".
            for (key, payload) in params {
                if key.starts_with(HUB_KEY_PREFIX) {
                    if let Some(hub_state) = payload.get("state").and_then(Value::as_bool) {
                        state.hub_sensor = hub_state;
                        state_changed = true;
                    }
                }
            }

            // Toolhead sensors.
            if let Some(extruder) = params.get(EXTRUDER_KEY).filter(|v| v.is_object()) {
                parse_afc_extruder(&mut state, extruder);
                state_changed = true;
            }
        }

        // Emit outside the lock.
        if topology_changed {
            self.emit(FeedEvent::TopologyChanged);
        }
        if state_changed {
            self.emit(FeedEvent::StateChanged);
        }
        if let Some(message) = fault {
            self.emit(FeedEvent::Fault(message));
        }
    }

    /// Common acceptance path: backend running, no operation in flight.
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

    fn rollback(&self, seq: u64) {
        let mut state = self.state.lock().unwrap();
        if state.current_op == Some(seq) {
            state.current_op = None;
        }
    }

    /// Submit `command` and relay the transport result as the operation's
    /// one completion. The spawned wait holds only a weak reference so a
    /// torn-down backend is never touched.
    fn dispatch(self: &Arc<Self>, seq: u64, command: String) {
        info!("[afc] #{seq} executing: {command}");
        let transport = Arc::clone(&self.transport);
        let weak: Weak<AfcInner> = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = transport.submit(&command).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.running.load(Ordering::SeqCst) {
                return;
            }
            if let Err(error) = &outcome {
                warn!("[afc] #{seq} command failed: {error}");
            }
            {
                let mut state = inner.state.lock().unwrap();
                if state.current_op == Some(seq) {
                    state.current_op = None;
                }
                if let Err(error) = &outcome {
                    state.last_error = Some(error.to_string());
                }
            }
            inner.emit(FeedEvent::OperationComplete {
                seq,
                outcome: outcome.map_err(|e| e.to_string()),
            });
        });
    }
}

/// Parse the global `AFC` status object. Returns an error message when the
/// firmware reports a new error.
fn parse_afc_global(state: &mut AfcStatus, afc: &Value) -> Option<String> {
    if let Some(lane) = afc.get("current_lane").and_then(Value::as_str) {
        state.current_lane = Some(lane.to_string());
        trace!("[afc] current lane: {lane}");
    }

    if let Some(loaded) = afc.get("filament_loaded").and_then(Value::as_bool) {
        state.filament_loaded = loaded;
    }

    // current_load overrides current_lane when present.
    if let Some(lane) = afc.get("current_load").and_then(Value::as_str) {
        state.current_lane = Some(lane.to_string());
        state.filament_loaded = true;
        trace!("[afc] current load: {lane}");
    }

    // Lane roster reported as an array of names.
    if let Some(lanes) = afc.get("lanes").and_then(Value::as_array) {
        let mut names: Vec<String> = lanes
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if !names.is_empty() {
            names.extend(state.lane_names());
            let merged = sort_and_dedupe(names);
            if merged != state.lane_names() {
                state.rebuild_lanes(merged);
            }
        }
    }

    // Error reports arrive as { "message": { "message": ..., "type": "error" } }.
    let mut fault = None;
    if let Some(message) = afc.get("message").filter(|v| v.is_object()) {
        if let Some(text) = message.get("message").and_then(Value::as_str) {
            let is_error = message.get("type").and_then(Value::as_str) == Some("error");
            if is_error && !text.is_empty() && state.last_error.as_deref() != Some(text) {
                state.last_error = Some(text.to_string());
                fault = Some(text.to_string());
            }
        }
    }

    fault
}

/// Parse an `AFC_stepper <lane>` payload. Returns true when anything known
/// about the lane changed.
fn parse_afc_lane(state: &mut AfcStatus, lane_name: &str, data: &Value) -> bool {
    // A mapping update may retarget another lane, so resolve it first.
    let mapped_tool = data
        .get("map")
        .and_then(Value::as_str)
        .and_then(ToolId::parse_label)
        .filter(|tool| tool.0 <= 64);

    let tool_loaded = data.get("tool_loaded").and_then(Value::as_bool);
    let status_str = data.get("status").and_then(Value::as_str).map(str::to_string);

    let Some(lane) = state
        .topology
        .lanes
        .iter_mut()
        .find(|l| l.name == lane_name)
    else {
        trace!("[afc] unknown lane name: {lane_name}");
        return false;
    };

    let mut changed = false;

    if let Some(prep) = data.get("prep").and_then(Value::as_bool) {
        changed |= lane.sensors.prep != prep;
        lane.sensors.prep = prep;
    }
    if let Some(load) = data.get("load").and_then(Value::as_bool) {
        changed |= lane.sensors.load != load;
        lane.sensors.load = load;
    }
    if let Some(hub) = data.get("loaded_to_hub").and_then(Value::as_bool) {
        changed |= lane.sensors.loaded_to_hub != hub;
        lane.sensors.loaded_to_hub = hub;
    }

    if let Some(color) = data.get("color").and_then(Value::as_str) {
        if let Ok(rgb) = u32::from_str_radix(color.trim_start_matches('#'), 16) {
            changed |= lane.filament.color_rgb != rgb;
            lane.filament.color_rgb = rgb;
        }
    }
    if let Some(material) = data.get("material").and_then(Value::as_str) {
        changed |= lane.filament.material != material;
        lane.filament.material = material.to_string();
    }
    if let Some(weight) = data.get("weight").and_then(Value::as_f64) {
        lane.filament.spool_weight_g = Some(weight as f32);
        changed = true;
    }

    if let Some(tool) = mapped_tool {
        changed |= lane.mapped_tool != Some(tool);
        lane.mapped_tool = Some(tool);
        trace!("[afc] lane {lane_name} mapped to {tool}");
    }

    // Derive occupancy from sensors and the status string.
    let status = match (tool_loaded, status_str.as_deref()) {
        (Some(true), _) | (_, Some("Tool Loaded")) | (_, Some("Tooled")) => LaneStatus::Loaded,
        (_, Some("Loaded")) => LaneStatus::Loaded,
        _ if lane.sensors.prep || lane.sensors.load => LaneStatus::Available,
        (_, Some("None")) | (_, Some("")) | (_, None) => LaneStatus::Empty,
        _ => LaneStatus::Available,
    };
    changed |= lane.status != status;
    lane.status = status;

    // This lane's filament is in the toolhead; update the global view.
    if status == LaneStatus::Loaded && tool_loaded == Some(true) {
        state.current_lane = Some(lane_name.to_string());
        state.filament_loaded = true;
    }

    changed
}

/// Parse the `AFC_extruder` payload for toolhead sensors.
fn parse_afc_extruder(state: &mut AfcStatus, data: &Value) {
    if let Some(start) = data.get("tool_start_status").and_then(Value::as_bool) {
        state.tool_start_sensor = start;
    }
    if let Some(end) = data.get("tool_end_status").and_then(Value::as_bool) {
        state.tool_end_sensor = end;
    }
    match data.get("lane_loaded") {
        Some(Value::String(lane)) => {
            state.current_lane = Some(lane.clone());
            state.filament_loaded = true;
        }
        Some(Value::Null) => {
            state.current_lane = None;
            state.filament_loaded = false;
        }
        _ => {}
    }
    trace!(
        "[afc] extruder: tool_start={} tool_end={} lane={:?}",
        state.tool_start_sensor,
        state.tool_end_sensor,
        state.current_lane
    );
}

#[async_trait]
impl FeedBackend for AfcBackend {
    fn topology(&self) -> Topology {
        self.inner.state.lock().unwrap().topology.clone()
    }

    fn mounted_lane(&self) -> Option<String> {
        let state = self.inner.state.lock().unwrap();
        if state.filament_loaded {
            state.current_lane.clone()
        } else {
            None
        }
    }

    fn path_segment(&self) -> PathSegment {
        self.inner.state.lock().unwrap().path_segment()
    }

    fn events(&self) -> broadcast::Receiver<FeedEvent> {
        self.inner.events.subscribe()
    }

    async fn start(&self) -> Result<(), FeedError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut updates = self.inner.transport.status_updates();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let status = match updates.recv().await {
                    Ok(status) => status,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[afc] status feed lagged, skipped {skipped} updates");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                inner.apply_status(&status);
            }
        });
        *self.listener.lock().unwrap() = Some(handle);

        info!("[afc] backend started");
        self.inner.emit(FeedEvent::StateChanged);
        Ok(())
    }

    fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.listener.lock().unwrap().take() {
            handle.abort();
        }
        info!("[afc] backend stopped");
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn begin_change_tool(&self, tool: ToolId, seq: u64) -> Result<(), FeedError> {
        self.inner.accept(seq)?;

        {
            let state = self.inner.state.lock().unwrap();
            if !state.topology.has_tool(tool) {
                drop(state);
                self.inner.rollback(seq);
                return Err(FeedError::InvalidTarget(format!("no lane feeds {tool}")));
            }
        }

        self.inner.dispatch(seq, format!("T{}", tool.0));
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

        self.inner.dispatch(seq, format!("CHANGE_TOOL LANE={lane}"));
        Ok(())
    }

    async fn begin_unload(&self, lane: &str, seq: u64) -> Result<(), FeedError> {
        self.inner.accept(seq)?;

        {
            let state = self.inner.state.lock().unwrap();
            if state.topology.lane(lane).is_none() {
                drop(state);
                self.inner.rollback(seq);
                return Err(FeedError::InvalidTarget(format!("unknown lane {lane}")));
            }
        }

        self.inner.dispatch(seq, format!("TOOL_UNLOAD LANE={lane}"));
        Ok(())
    }
}
