//! Lane/tool topology model
//!
//! Snapshots of the lane and tool arrangement reported by the active
//! backend. A snapshot is replaced wholesale whenever the hardware
//! reconfigures (hot-plug, remap); consumers never mutate one
//! field-by-field.

pub mod layout;

pub use layout::{PhysicalLayout, PhysicalPosition};

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lanes::compare_lane_names;

/// Identifier of a physical tool position (nozzle).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ToolId(pub u32);

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

impl ToolId {
    /// Parse a `T<N>` tool label as reported by AFC lane `map` fields.
    pub fn parse_label(label: &str) -> Option<ToolId> {
        let suffix = label.strip_prefix('T')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok().map(ToolId)
    }
}

/// Lane occupancy as derivable from sensors and status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LaneStatus {
    #[default]
    Unknown,
    /// Filament present at the lane entry, ready to load.
    Available,
    /// No filament in the lane.
    Empty,
    /// This lane's filament is mounted in the toolhead.
    Loaded,
}

/// Material/color metadata carried for the presentation layer. Opaque to the
/// control core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilamentInfo {
    pub color_rgb: u32,
    pub material: String,
    pub spool_weight_g: Option<f32>,
}

/// Raw per-lane sensor chain (AFC prep → load → hub).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneSensors {
    pub prep: bool,
    pub load: bool,
    pub loaded_to_hub: bool,
}

/// How far filament has travelled along the feed path, nearest to furthest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum PathSegment {
    #[default]
    None,
    Spool,
    Prep,
    Lane,
    Hub,
    Output,
    Toolhead,
    Nozzle,
}

/// A physical feed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    /// Unique name within a snapshot, format `lane<N>`.
    pub name: String,
    /// Physical tool this lane feeds. `None` = unconfigured. Several lanes
    /// may share one tool on hub hardware.
    pub mapped_tool: Option<ToolId>,
    pub status: LaneStatus,
    pub filament: FilamentInfo,
    pub sensors: LaneSensors,
}

impl Lane {
    pub fn new(name: impl Into<String>) -> Self {
        Lane {
            name: name.into(),
            mapped_tool: None,
            status: LaneStatus::Unknown,
            filament: FilamentInfo::default(),
            sensors: LaneSensors::default(),
        }
    }

    pub fn with_tool(name: impl Into<String>, tool: ToolId) -> Self {
        let mut lane = Lane::new(name);
        lane.mapped_tool = Some(tool);
        lane
    }

    /// Numeric ordering key parsed from the name, if any.
    pub fn index(&self) -> Option<u32> {
        crate::lanes::parse_lane_index(&self.name)
    }
}

/// Hardware arrangement class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyKind {
    /// One lane feeding one nozzle, no changer.
    SingleExtruder,
    /// One lane-to-tool mapping per physical tool.
    ToolChanger,
    /// Multiple lanes converging on a shared nozzle through a hub merger.
    Hub,
}

/// Snapshot of the current lane/tool arrangement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Identity of this snapshot. A new id means the arrangement was
    /// replaced; cheaper to compare than the lane list itself.
    pub snapshot_id: Uuid,
    pub kind: TopologyKind,
    /// Lanes in canonical order (see [`crate::lanes`]), names unique.
    pub lanes: Vec<Lane>,
}

impl Topology {
    /// Build a snapshot from arbitrary lane input: lanes are sorted into the
    /// canonical order and duplicate names collapse to the first occurrence.
    pub fn new(kind: TopologyKind, mut lanes: Vec<Lane>) -> Self {
        lanes.sort_by(|a, b| compare_lane_names(&a.name, &b.name));
        lanes.dedup_by(|a, b| a.name == b.name);
        Topology {
            snapshot_id: Uuid::new_v4(),
            kind,
            lanes,
        }
    }

    pub fn empty(kind: TopologyKind) -> Self {
        Topology::new(kind, Vec::new())
    }

    pub fn lane(&self, name: &str) -> Option<&Lane> {
        self.lanes.iter().find(|l| l.name == name)
    }

    /// First lane feeding `tool`, in canonical lane order.
    pub fn lane_for_tool(&self, tool: ToolId) -> Option<&Lane> {
        self.lanes.iter().find(|l| l.mapped_tool == Some(tool))
    }

    pub fn has_tool(&self, tool: ToolId) -> bool {
        self.lane_for_tool(tool).is_some()
    }

    /// Distinct mapped tools, ascending.
    pub fn tools(&self) -> BTreeSet<ToolId> {
        self.lanes.iter().filter_map(|l| l.mapped_tool).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_label_parse() {
        assert_eq!(ToolId::parse_label("T0"), Some(ToolId(0)));
        assert_eq!(ToolId::parse_label("T12"), Some(ToolId(12)));
        assert_eq!(ToolId::parse_label("T"), None);
        assert_eq!(ToolId::parse_label("T1a"), None);
        assert_eq!(ToolId::parse_label("t1"), None);
        assert_eq!(ToolId::parse_label("X1"), None);
    }

    #[test]
    fn test_tool_display() {
        assert_eq!(ToolId(3).to_string(), "T3");
    }

    #[test]
    fn test_new_sorts_and_dedupes_lanes() {
        let topo = Topology::new(
            TopologyKind::Hub,
            vec![
                Lane::new("lane10"),
                Lane::new("lane2"),
                Lane::new("lane2"),
                Lane::new("lane1"),
            ],
        );
        let names: Vec<_> = topo.lanes.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["lane1", "lane2", "lane10"]);
    }

    #[test]
    fn test_lane_lookup() {
        let topo = Topology::new(
            TopologyKind::ToolChanger,
            vec![
                Lane::with_tool("lane0", ToolId(0)),
                Lane::with_tool("lane1", ToolId(1)),
            ],
        );
        assert!(topo.lane("lane1").is_some());
        assert!(topo.lane("lane9").is_none());
        assert_eq!(topo.lane_for_tool(ToolId(1)).unwrap().name, "lane1");
        assert!(topo.has_tool(ToolId(0)));
        assert!(!topo.has_tool(ToolId(2)));
    }

    #[test]
    fn test_distinct_tools() {
        let topo = Topology::new(
            TopologyKind::Hub,
            vec![
                Lane::with_tool("lane0", ToolId(0)),
                Lane::with_tool("lane1", ToolId(0)),
                Lane::new("lane2"),
            ],
        );
        let tools: Vec<_> = topo.tools().into_iter().collect();
        assert_eq!(tools, vec![ToolId(0)]);
    }

    #[test]
    fn test_snapshot_identity_changes_on_rebuild() {
        let a = Topology::empty(TopologyKind::Hub);
        let b = Topology::empty(TopologyKind::Hub);
        assert_ne!(a.snapshot_id, b.snapshot_id);
    }
}
