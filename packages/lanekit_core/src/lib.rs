// lanekit - Multi-material feed control core

pub mod backend;
pub mod config;
pub mod lanes;
pub mod machine;
pub mod topology;
pub mod transport;

pub use backend::{FeedBackend, FeedError, FeedEvent};
pub use machine::{MachineEvent, MachineState, ToolChangeMachine};
pub use topology::{Lane, PathSegment, PhysicalLayout, ToolId, Topology, TopologyKind};
