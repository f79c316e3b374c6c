//! Tool-change state machine
//!
//! Orchestrates change/load/unload requests against the active backend,
//! enforcing mutual exclusion and race-free transitions. The busy transition
//! happens synchronously under one lock before any asynchronous work begins,
//! so two concurrent requests can never both observe an idle machine — the
//! first caller's transition is visible before its call returns.
//!
//! Completions arrive on the backend's event stream tagged with the request
//! sequence number; a completion for anything but the outstanding request is
//! discarded. The router task holds only a weak reference to the machine, so
//! a late completion can never touch a dropped one.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::broadcast;

use crate::backend::{FeedBackend, FeedError, FeedEvent};
use crate::topology::ToolId;

const MACHINE_EVENT_CAPACITY: usize = 64;

/// Observable state of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineState {
    /// No operation in flight.
    Idle,
    /// Tool change accepted, hardware not yet confirmed.
    Selecting,
    /// Lane load accepted, hardware not yet confirmed.
    Loading,
    /// Unload accepted, hardware not yet confirmed.
    Unloading,
    /// The last operation failed. Cleared by the next accepted operation or
    /// an explicit [`ToolChangeMachine::reset`].
    Error { message: String },
}

impl MachineState {
    /// An in-flight operation locks out new requests.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            MachineState::Selecting | MachineState::Loading | MachineState::Unloading
        )
    }

    fn name(&self) -> &'static str {
        match self {
            MachineState::Idle => "idle",
            MachineState::Selecting => "selecting",
            MachineState::Loading => "loading",
            MachineState::Unloading => "unloading",
            MachineState::Error { .. } => "error",
        }
    }
}

/// Diagnostic record of the last failed operation.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Event published to machine subscribers.
#[derive(Debug, Clone)]
pub enum MachineEvent {
    StateChanged(MachineState),
    /// Terminal notification for an accepted request.
    OperationFinished {
        seq: u64,
        outcome: Result<(), String>,
    },
}

struct MachineCore {
    state: MachineState,
    /// Sequence number of the one outstanding request, if any.
    outstanding: Option<u64>,
    next_seq: u64,
    /// Lane whose filament is currently mounted.
    mounted: Option<String>,
    /// What `mounted` becomes if the outstanding request succeeds.
    pending_mount: Option<String>,
    last_error: Option<ErrorRecord>,
}

impl MachineCore {
    /// Perform the synchronous busy transition. Must be called with the
    /// core lock held and the request already validated.
    fn begin(&mut self, busy_state: MachineState, mount_on_success: Option<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.state = busy_state;
        self.outstanding = Some(seq);
        self.pending_mount = mount_on_success;
        seq
    }
}

struct MachineInner {
    backend: Arc<dyn FeedBackend>,
    core: Mutex<MachineCore>,
    events: broadcast::Sender<MachineEvent>,
}

impl MachineInner {
    fn notify_state(&self) {
        let state = self.core.lock().unwrap().state.clone();
        let _ = self.events.send(MachineEvent::StateChanged(state));
    }

    /// Settle a `begin_*` submission result. A refusal after acceptance is
    /// the request's one failure: the machine records it and no completion
    /// event will follow from the backend.
    fn settle_submit(&self, seq: u64, submit: Result<(), FeedError>) -> Result<(), FeedError> {
        let error = match submit {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let message = error.to_string();
        {
            let mut core = self.core.lock().unwrap();
            if core.outstanding == Some(seq) {
                core.outstanding = None;
                core.pending_mount = None;
                core.state = MachineState::Error {
                    message: message.clone(),
                };
                core.last_error = Some(ErrorRecord {
                    message: message.clone(),
                    at: Utc::now(),
                });
            }
        }
        self.notify_state();
        let _ = self.events.send(MachineEvent::OperationFinished {
            seq,
            outcome: Err(message),
        });
        Err(error)
    }

    fn handle_backend_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::OperationComplete { seq, outcome } => {
                self.handle_completion(seq, outcome);
            }
            FeedEvent::Fault(message) => {
                // Faults outside an operation carry no state transition;
                // they surface through the backend's own reporting.
                warn!("[machine] backend fault: {message}");
            }
            FeedEvent::TopologyChanged | FeedEvent::StateChanged => {}
        }
    }

    fn handle_completion(&self, seq: u64, outcome: Result<(), String>) {
        let new_state = {
            let mut core = self.core.lock().unwrap();
            if core.outstanding != Some(seq) {
                // A superseded or timed-out request already has its own
                // success/failure path; this one is stale.
                debug!("[machine] discarding stale completion #{seq}");
                return;
            }
            core.outstanding = None;
            match &outcome {
                Ok(()) => {
                    core.mounted = core.pending_mount.take();
                    core.state = MachineState::Idle;
                }
                Err(message) => {
                    core.pending_mount = None;
                    core.state = MachineState::Error {
                        message: message.clone(),
                    };
                    core.last_error = Some(ErrorRecord {
                        message: message.clone(),
                        at: Utc::now(),
                    });
                }
            }
            core.state.clone()
        };

        let _ = self.events.send(MachineEvent::StateChanged(new_state));
        let _ = self
            .events
            .send(MachineEvent::OperationFinished { seq, outcome });
    }
}

/// Routes backend events into the machine until either side goes away.
fn spawn_router(inner: &Arc<MachineInner>) {
    let weak = Arc::downgrade(inner);
    let mut rx = inner.backend.events();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[machine] backend event feed lagged, skipped {skipped}");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.handle_backend_event(event);
        }
    });
}

/// The tool-change orchestrator. One instance per feed system; never more
/// than one outstanding hardware operation.
pub struct ToolChangeMachine {
    inner: Arc<MachineInner>,
}

impl ToolChangeMachine {
    pub fn new(backend: Arc<dyn FeedBackend>) -> Self {
        let (events, _) = broadcast::channel(MACHINE_EVENT_CAPACITY);
        let mounted = backend.mounted_lane();
        let inner = Arc::new(MachineInner {
            backend,
            core: Mutex::new(MachineCore {
                state: MachineState::Idle,
                outstanding: None,
                next_seq: 1,
                mounted,
                pending_mount: None,
                last_error: None,
            }),
            events,
        });
        spawn_router(&inner);
        ToolChangeMachine { inner }
    }

    pub fn state(&self) -> MachineState {
        self.inner.core.lock().unwrap().state.clone()
    }

    pub fn mounted_lane(&self) -> Option<String> {
        self.inner.core.lock().unwrap().mounted.clone()
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.inner.core.lock().unwrap().last_error.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MachineEvent> {
        self.inner.events.subscribe()
    }

    /// Change to `tool`. Returns the accepted request's sequence number.
    ///
    /// Rejected with `Busy` while an operation is in flight and with
    /// `InvalidTarget` when no lane in the current topology feeds `tool`;
    /// rejections leave the machine in its prior state.
    pub async fn change_tool(&self, tool: ToolId) -> Result<u64, FeedError> {
        let seq = {
            let mut core = self.inner.core.lock().unwrap();
            if core.state.is_busy() {
                return Err(FeedError::Busy(core.state.name().to_string()));
            }
            let topology = self.inner.backend.topology();
            let lane = topology
                .lane_for_tool(tool)
                .ok_or_else(|| FeedError::InvalidTarget(format!("no lane feeds {tool}")))?;
            core.begin(MachineState::Selecting, Some(lane.name.clone()))
        };
        self.inner.notify_state();

        debug!("[machine] #{seq} change tool -> {tool}");
        let submit = self.inner.backend.begin_change_tool(tool, seq).await;
        self.inner.settle_submit(seq, submit)?;
        Ok(seq)
    }

    /// Load filament from `lane`.
    ///
    /// A convenience over the tool-change path: the lane's mapped tool is
    /// resolved up front and the request inherits all busy/validation
    /// semantics. A lane that is unknown or feeds no tool is an invalid
    /// target. Loading the already-mounted lane still cycles the machine.
    pub async fn load_filament(&self, lane: &str) -> Result<u64, FeedError> {
        let seq = {
            let mut core = self.inner.core.lock().unwrap();
            if core.state.is_busy() {
                return Err(FeedError::Busy(core.state.name().to_string()));
            }
            let topology = self.inner.backend.topology();
            let entry = topology
                .lane(lane)
                .ok_or_else(|| FeedError::InvalidTarget(format!("unknown lane {lane}")))?;
            entry.mapped_tool.ok_or_else(|| {
                FeedError::InvalidTarget(format!("lane {lane} feeds no tool"))
            })?;
            core.begin(MachineState::Loading, Some(lane.to_string()))
        };
        self.inner.notify_state();

        debug!("[machine] #{seq} load {lane}");
        let submit = self.inner.backend.begin_load(lane, seq).await;
        self.inner.settle_submit(seq, submit)?;
        Ok(seq)
    }

    /// Unload the mounted filament. Rejected with `NothingMounted` when no
    /// lane is recorded as mounted.
    pub async fn unload_filament(&self) -> Result<u64, FeedError> {
        let (seq, lane) = {
            let mut core = self.inner.core.lock().unwrap();
            if core.state.is_busy() {
                return Err(FeedError::Busy(core.state.name().to_string()));
            }
            let lane = core.mounted.clone().ok_or(FeedError::NothingMounted)?;
            (core.begin(MachineState::Unloading, None), lane)
        };
        self.inner.notify_state();

        debug!("[machine] #{seq} unload {lane}");
        let submit = self.inner.backend.begin_unload(&lane, seq).await;
        self.inner.settle_submit(seq, submit)?;
        Ok(seq)
    }

    /// Explicitly clear the `Error` state. A no-op when idle; rejected while
    /// an operation is in flight.
    pub fn reset(&self) -> Result<(), FeedError> {
        let cleared = {
            let mut core = self.inner.core.lock().unwrap();
            if core.state.is_busy() {
                return Err(FeedError::Busy(core.state.name().to_string()));
            }
            if matches!(core.state, MachineState::Error { .. }) {
                core.state = MachineState::Idle;
                true
            } else {
                false
            }
        };
        if cleared {
            self.inner.notify_state();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EVENT_CHANNEL_CAPACITY;
    use crate::topology::{Lane, PathSegment, Topology, TopologyKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend double that records begin calls and completes only when the
    /// test says so, so sequencing and staleness are fully scripted.
    struct ScriptedBackend {
        topology: Mutex<Topology>,
        events: broadcast::Sender<FeedEvent>,
        begun: Mutex<Vec<(String, u64)>>,
        refuse_submit: AtomicBool,
        running: AtomicBool,
    }

    impl ScriptedBackend {
        fn new(topology: Topology) -> Arc<Self> {
            let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
            Arc::new(ScriptedBackend {
                topology: Mutex::new(topology),
                events,
                begun: Mutex::new(Vec::new()),
                refuse_submit: AtomicBool::new(false),
                running: AtomicBool::new(true),
            })
        }

        fn tool_changer(lanes: u32) -> Arc<Self> {
            let lanes = (0..lanes)
                .map(|i| Lane::with_tool(format!("lane{i}"), ToolId(i)))
                .collect();
            Self::new(Topology::new(TopologyKind::ToolChanger, lanes))
        }

        fn complete(&self, seq: u64, outcome: Result<(), String>) {
            let _ = self
                .events
                .send(FeedEvent::OperationComplete { seq, outcome });
        }

        fn begun(&self) -> Vec<(String, u64)> {
            self.begun.lock().unwrap().clone()
        }

        fn record(&self, what: String, seq: u64) -> Result<(), FeedError> {
            if self.refuse_submit.load(Ordering::SeqCst) {
                return Err(FeedError::Transport(
                    crate::transport::TransportError::Disconnected,
                ));
            }
            self.begun.lock().unwrap().push((what, seq));
            Ok(())
        }
    }

    #[async_trait]
    impl FeedBackend for ScriptedBackend {
        fn topology(&self) -> Topology {
            self.topology.lock().unwrap().clone()
        }

        fn mounted_lane(&self) -> Option<String> {
            None
        }

        fn path_segment(&self) -> PathSegment {
            PathSegment::None
        }

        fn events(&self) -> broadcast::Receiver<FeedEvent> {
            self.events.subscribe()
        }

        async fn start(&self) -> Result<(), FeedError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn begin_change_tool(&self, tool: ToolId, seq: u64) -> Result<(), FeedError> {
            self.record(format!("change:{tool}"), seq)
        }

        async fn begin_load(&self, lane: &str, seq: u64) -> Result<(), FeedError> {
            self.record(format!("load:{lane}"), seq)
        }

        async fn begin_unload(&self, lane: &str, seq: u64) -> Result<(), FeedError> {
            self.record(format!("unload:{lane}"), seq)
        }
    }

    async fn wait_finished(
        rx: &mut broadcast::Receiver<MachineEvent>,
        want_seq: u64,
    ) -> Result<(), String> {
        loop {
            match rx.recv().await.expect("machine event stream closed") {
                MachineEvent::OperationFinished { seq, outcome } if seq == want_seq => {
                    return outcome;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_change_tool_transitions_synchronously() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());

        let seq = machine.change_tool(ToolId(1)).await.unwrap();
        // Hardware has confirmed nothing yet, but the machine is already
        // locked out.
        assert_eq!(machine.state(), MachineState::Selecting);
        assert_eq!(backend.begun(), vec![("change:T1".to_string(), seq)]);
    }

    #[tokio::test]
    async fn test_second_request_rejected_busy() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());

        let first = machine.change_tool(ToolId(1)).await.unwrap();
        let second = machine.change_tool(ToolId(2)).await;
        assert!(matches!(second, Err(FeedError::Busy(_))));

        // The first request is still the only one the backend saw.
        assert_eq!(backend.begun().len(), 1);
        assert_eq!(backend.begun()[0].1, first);
        assert_eq!(machine.state(), MachineState::Selecting);
    }

    #[tokio::test]
    async fn test_invalid_target_leaves_prior_state() {
        let backend = ScriptedBackend::tool_changer(2);
        let machine = ToolChangeMachine::new(backend.clone());

        let result = machine.change_tool(ToolId(9)).await;
        assert!(matches!(result, Err(FeedError::InvalidTarget(_))));
        assert_eq!(machine.state(), MachineState::Idle);
        assert!(backend.begun().is_empty());
    }

    #[tokio::test]
    async fn test_successful_completion_returns_to_idle_and_mounts() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let seq = machine.change_tool(ToolId(1)).await.unwrap();
        backend.complete(seq, Ok(()));
        wait_finished(&mut rx, seq).await.unwrap();

        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(machine.mounted_lane().as_deref(), Some("lane1"));
    }

    #[tokio::test]
    async fn test_sequential_operations_after_idle() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let first = machine.change_tool(ToolId(1)).await.unwrap();
        backend.complete(first, Ok(()));
        wait_finished(&mut rx, first).await.unwrap();

        // No cooldown: the next request is accepted immediately.
        let second = machine.change_tool(ToolId(2)).await.unwrap();
        assert!(second > first);
        assert_eq!(machine.state(), MachineState::Selecting);
    }

    #[tokio::test]
    async fn test_stale_completion_discarded() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let seq = machine.change_tool(ToolId(1)).await.unwrap();

        // A delayed completion from some earlier life of the system.
        backend.complete(seq + 100, Ok(()));
        backend.complete(seq.wrapping_sub(1), Err("ghost".into()));

        // Still selecting: the stale completions changed nothing.
        backend.complete(seq, Ok(()));
        wait_finished(&mut rx, seq).await.unwrap();
        assert_eq!(machine.state(), MachineState::Idle);
        assert_eq!(machine.mounted_lane().as_deref(), Some("lane1"));
        assert!(machine.last_error().is_none());
    }

    #[tokio::test]
    async fn test_failure_enters_error_and_keeps_diagnostic() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let seq = machine.change_tool(ToolId(1)).await.unwrap();
        backend.complete(seq, Err("filament jam".into()));
        assert!(wait_finished(&mut rx, seq).await.is_err());

        assert_eq!(
            machine.state(),
            MachineState::Error {
                message: "filament jam".into()
            }
        );
        assert_eq!(machine.last_error().unwrap().message, "filament jam");
        assert_eq!(machine.mounted_lane(), None);
    }

    #[tokio::test]
    async fn test_new_operation_recovers_from_error() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let seq = machine.change_tool(ToolId(1)).await.unwrap();
        backend.complete(seq, Err("jam".into()));
        let _ = wait_finished(&mut rx, seq).await;

        // No explicit clear required: the next request transitions out.
        let retry = machine.change_tool(ToolId(1)).await.unwrap();
        assert_eq!(machine.state(), MachineState::Selecting);
        backend.complete(retry, Ok(()));
        wait_finished(&mut rx, retry).await.unwrap();
        assert_eq!(machine.state(), MachineState::Idle);
    }

    #[tokio::test]
    async fn test_reset_clears_error() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let seq = machine.change_tool(ToolId(1)).await.unwrap();
        backend.complete(seq, Err("jam".into()));
        let _ = wait_finished(&mut rx, seq).await;

        machine.reset().unwrap();
        assert_eq!(machine.state(), MachineState::Idle);

        // Reset while busy is refused.
        let _ = machine.change_tool(ToolId(1)).await.unwrap();
        assert!(matches!(machine.reset(), Err(FeedError::Busy(_))));
    }

    #[tokio::test]
    async fn test_unload_requires_mounted_lane() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());

        let result = machine.unload_filament().await;
        assert!(matches!(result, Err(FeedError::NothingMounted)));
        assert_eq!(machine.state(), MachineState::Idle);
    }

    #[tokio::test]
    async fn test_unload_targets_mounted_lane_and_clears_it() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let load = machine.load_filament("lane2").await.unwrap();
        assert_eq!(machine.state(), MachineState::Loading);
        backend.complete(load, Ok(()));
        wait_finished(&mut rx, load).await.unwrap();
        assert_eq!(machine.mounted_lane().as_deref(), Some("lane2"));

        let unload = machine.unload_filament().await.unwrap();
        assert_eq!(machine.state(), MachineState::Unloading);
        backend.complete(unload, Ok(()));
        wait_finished(&mut rx, unload).await.unwrap();

        assert_eq!(machine.mounted_lane(), None);
        assert_eq!(
            backend.begun().last().unwrap().0,
            "unload:lane2".to_string()
        );
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_and_unmapped_lanes() {
        let mut lanes = vec![Lane::with_tool("lane0", ToolId(0)), Lane::new("lane1")];
        lanes[1].mapped_tool = None;
        let backend = ScriptedBackend::new(Topology::new(TopologyKind::Hub, lanes));
        let machine = ToolChangeMachine::new(backend.clone());

        assert!(matches!(
            machine.load_filament("lane9").await,
            Err(FeedError::InvalidTarget(_))
        ));
        assert!(matches!(
            machine.load_filament("lane1").await,
            Err(FeedError::InvalidTarget(_))
        ));
        assert_eq!(machine.state(), MachineState::Idle);
    }

    #[tokio::test]
    async fn test_load_of_mounted_lane_still_cycles() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let first = machine.load_filament("lane1").await.unwrap();
        backend.complete(first, Ok(()));
        wait_finished(&mut rx, first).await.unwrap();

        // Loading the lane already mounted is not a no-op.
        let again = machine.load_filament("lane1").await.unwrap();
        assert_eq!(machine.state(), MachineState::Loading);
        assert!(again > first);
    }

    #[tokio::test]
    async fn test_submit_refusal_is_the_one_failure() {
        let backend = ScriptedBackend::tool_changer(4);
        backend.refuse_submit.store(true, Ordering::SeqCst);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let result = machine.change_tool(ToolId(1)).await;
        assert!(result.is_err());
        assert!(matches!(machine.state(), MachineState::Error { .. }));

        // Subscribers saw exactly one terminal notification for it.
        let outcome = wait_finished(&mut rx, 1).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn test_completion_after_machine_dropped_is_harmless() {
        let backend = ScriptedBackend::tool_changer(4);
        let seq = {
            let machine = ToolChangeMachine::new(backend.clone());
            machine.change_tool(ToolId(1)).await.unwrap()
        };

        // The machine is gone; the router's weak reference lapses and the
        // late completion touches nothing.
        backend.complete(seq, Ok(()));
        tokio::task::yield_now().await;
        backend.complete(seq, Err("late".into()));
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_state_change_events_published() {
        let backend = ScriptedBackend::tool_changer(4);
        let machine = ToolChangeMachine::new(backend.clone());
        let mut rx = machine.subscribe();

        let seq = machine.change_tool(ToolId(1)).await.unwrap();
        match rx.recv().await.unwrap() {
            MachineEvent::StateChanged(state) => assert_eq!(state, MachineState::Selecting),
            other => panic!("unexpected event: {other:?}"),
        }

        backend.complete(seq, Ok(()));
        match rx.recv().await.unwrap() {
            MachineEvent::StateChanged(state) => assert_eq!(state, MachineState::Idle),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
