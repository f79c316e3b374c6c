//! Physical layout resolution
//!
//! Hub hardware lets several lanes converge on one nozzle, and some firmware
//! still reports a distinct mapped tool per lane. The resolver collapses
//! lanes sharing a `mapped_tool` so the apparent nozzle count never inflates
//! past the real print head.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ToolId, Topology};

/// One physical nozzle position and the lanes feeding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPosition {
    pub tool: ToolId,
    /// Names of lanes feeding this position, in canonical lane order.
    pub lanes: Vec<String>,
}

/// Derived, read-only view of the print-head arrangement. Recomputed from
/// every topology snapshot; never cached across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhysicalLayout {
    /// One entry per distinct mapped tool, ascending by tool id.
    pub positions: Vec<PhysicalPosition>,
    /// Lanes with no tool mapping. Excluded from the physical count but
    /// retained for diagnostics.
    pub unmapped_lanes: Vec<String>,
}

impl PhysicalLayout {
    /// Derive the layout from a topology snapshot.
    ///
    /// Pure function of its input: two lanes with equal `mapped_tool` values
    /// are the same physical position regardless of lane ordering.
    pub fn resolve(topology: &Topology) -> PhysicalLayout {
        let mut groups: BTreeMap<ToolId, Vec<String>> = BTreeMap::new();
        let mut unmapped = Vec::new();

        for lane in &topology.lanes {
            match lane.mapped_tool {
                Some(tool) => groups.entry(tool).or_default().push(lane.name.clone()),
                None => unmapped.push(lane.name.clone()),
            }
        }

        PhysicalLayout {
            positions: groups
                .into_iter()
                .map(|(tool, lanes)| PhysicalPosition { tool, lanes })
                .collect(),
            unmapped_lanes: unmapped,
        }
    }

    /// Number of distinct physical nozzle positions.
    pub fn physical_tool_count(&self) -> usize {
        self.positions.len()
    }

    pub fn position_for(&self, tool: ToolId) -> Option<&PhysicalPosition> {
        self.positions.iter().find(|p| p.tool == tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Lane, TopologyKind};

    fn hub_topology(lanes: Vec<Lane>) -> Topology {
        Topology::new(TopologyKind::Hub, lanes)
    }

    #[test]
    fn test_hub_lanes_sharing_one_tool_collapse() {
        // lane0..lane3 all feed the single hub nozzle T0.
        let topo = hub_topology(vec![
            Lane::with_tool("lane0", ToolId(0)),
            Lane::with_tool("lane1", ToolId(0)),
            Lane::with_tool("lane2", ToolId(0)),
            Lane::with_tool("lane3", ToolId(0)),
        ]);

        let layout = PhysicalLayout::resolve(&topo);
        assert_eq!(layout.physical_tool_count(), 1);
        assert_eq!(
            layout.positions[0].lanes,
            vec!["lane0", "lane1", "lane2", "lane3"]
        );
    }

    #[test]
    fn test_tool_changer_is_one_to_one() {
        let topo = Topology::new(
            TopologyKind::ToolChanger,
            vec![
                Lane::with_tool("lane0", ToolId(0)),
                Lane::with_tool("lane1", ToolId(1)),
                Lane::with_tool("lane2", ToolId(2)),
            ],
        );

        let layout = PhysicalLayout::resolve(&topo);
        assert_eq!(layout.physical_tool_count(), 3);
        for (i, pos) in layout.positions.iter().enumerate() {
            assert_eq!(pos.tool, ToolId(i as u32));
            assert_eq!(pos.lanes.len(), 1);
        }
    }

    #[test]
    fn test_distinct_count_never_raw_lane_count() {
        // 6 lanes, 2 distinct tools: the count is 2, not 6.
        let topo = hub_topology(vec![
            Lane::with_tool("lane0", ToolId(0)),
            Lane::with_tool("lane1", ToolId(0)),
            Lane::with_tool("lane2", ToolId(0)),
            Lane::with_tool("lane3", ToolId(1)),
            Lane::with_tool("lane4", ToolId(1)),
            Lane::with_tool("lane5", ToolId(1)),
        ]);

        let layout = PhysicalLayout::resolve(&topo);
        assert_eq!(layout.physical_tool_count(), 2);
        assert_eq!(layout.position_for(ToolId(0)).unwrap().lanes.len(), 3);
        assert_eq!(layout.position_for(ToolId(1)).unwrap().lanes.len(), 3);
    }

    #[test]
    fn test_unmapped_lane_excluded_but_reported() {
        let topo = hub_topology(vec![
            Lane::with_tool("lane0", ToolId(0)),
            Lane::new("lane1"),
        ]);

        let layout = PhysicalLayout::resolve(&topo);
        assert_eq!(layout.physical_tool_count(), 1);
        assert_eq!(layout.unmapped_lanes, vec!["lane1"]);
    }

    #[test]
    fn test_empty_topology() {
        let layout = PhysicalLayout::resolve(&Topology::empty(TopologyKind::SingleExtruder));
        assert_eq!(layout.physical_tool_count(), 0);
        assert!(layout.positions.is_empty());
        assert!(layout.unmapped_lanes.is_empty());
    }

    #[test]
    fn test_resolution_is_pure() {
        let topo = hub_topology(vec![
            Lane::with_tool("lane0", ToolId(4)),
            Lane::with_tool("lane1", ToolId(4)),
        ]);
        assert_eq!(PhysicalLayout::resolve(&topo), PhysicalLayout::resolve(&topo));
    }

    #[test]
    fn test_positions_ordered_by_tool_id() {
        let topo = hub_topology(vec![
            Lane::with_tool("lane0", ToolId(7)),
            Lane::with_tool("lane1", ToolId(2)),
            Lane::with_tool("lane2", ToolId(5)),
        ]);

        let layout = PhysicalLayout::resolve(&topo);
        let tools: Vec<_> = layout.positions.iter().map(|p| p.tool).collect();
        assert_eq!(tools, vec![ToolId(2), ToolId(5), ToolId(7)]);
    }
}
