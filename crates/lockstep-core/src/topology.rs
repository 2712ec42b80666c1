//! Cluster topology: which nodes exist and what they do.
//!
//! A topology is an ordered list of entries and may be replaced between
//! frames (nodes added or removed). Role state machines reconcile against
//! the new expected repeater set before processing the next frame.

use serde::{Deserialize, Serialize};

use crate::node_set::NodeIdBitVec;
use crate::wire::NodeId;

/// What a node does in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Produces the authoritative per-frame state and drives progression.
    Emitter,
    /// Consumes emitter-produced state and acknowledges readiness.
    Repeater,
    /// A repeater that is also ready to take over as emitter.
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopologyEntry {
    pub node_id: NodeId,
    pub node_role: NodeRole,
    /// Identifier of the render surface this node feeds. Opaque to the
    /// sync protocol, carried for the owning application.
    pub render_node_id: u8,
}

/// Ordered collection of topology entries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub entries: Vec<ClusterTopologyEntry>,
}

impl ClusterTopology {
    pub fn new(entries: Vec<ClusterTopologyEntry>) -> Self {
        Self { entries }
    }

    /// Node ids of every repeater (Backup counts: it repeats until it is
    /// promoted).
    pub fn repeater_set(&self) -> NodeIdBitVec {
        NodeIdBitVec::from_node_ids(
            self.entries
                .iter()
                .filter(|e| matches!(e.node_role, NodeRole::Repeater | NodeRole::Backup))
                .map(|e| e.node_id),
        )
    }

    pub fn repeater_count(&self) -> usize {
        self.repeater_set().len()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.entries.iter().any(|e| e.node_id == node_id)
    }

    pub fn entry(&self, node_id: NodeId) -> Option<&ClusterTopologyEntry> {
        self.entries.iter().find(|e| e.node_id == node_id)
    }
}
