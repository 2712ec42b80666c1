//! Lockstep integration test harness.
//!
//! Whole clusters run inside one process on the loopback hub (a
//! virtual multicast segment), so every scenario is deterministic and
//! needs no real network. Each module covers one scenario family.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lockstep_core::topology::{ClusterTopologyEntry, NodeRole};
use lockstep_core::{ClusterConfig, ClusterTopology, NodeId};
use lockstep_node::{CustomDataRegistry, RegistrationGuard};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

mod delayed;
mod lifecycle;
mod recovery;
mod survey;
mod sync;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Small enough that a modest frame blob spans several datagrams.
pub const MAX_MESSAGE_SIZE: usize = 192;

/// Section tag used by the per-frame payload provider below.
pub const SCENE_STATE_TAG: i32 = 7;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Topology with node 0 as emitter plus the given repeaters.
pub fn cluster_topology(repeaters: &[NodeId]) -> ClusterTopology {
    let mut entries = vec![ClusterTopologyEntry {
        node_id: 0,
        node_role: NodeRole::Emitter,
        render_node_id: 0,
    }];
    entries.extend(repeaters.iter().map(|&node_id| ClusterTopologyEntry {
        node_id,
        node_role: NodeRole::Repeater,
        render_node_id: node_id,
    }));
    ClusterTopology::new(entries)
}

/// Baseline config for in-process tests: short handshake window so a
/// broken scenario fails fast, everything else at defaults.
pub fn test_config(node_id: NodeId, repeaters: &[NodeId]) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.node_id = node_id;
    config.topology = cluster_topology(repeaters);
    config.timeouts.handshake = Duration::from_secs(10);
    config.timeouts.communication = Duration::from_secs(10);
    config
}

/// Event type exercised by the scenarios: two of these ride every
/// frame, with values derived from the frame index.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SceneEvent {
    pub frame_index: u64,
    pub channel: u32,
    pub padding: u32,
}

impl SceneEvent {
    pub fn new(frame_index: u64, channel: u32) -> Self {
        Self {
            frame_index,
            channel,
            padding: 0,
        }
    }
}

/// Deterministic frame payload: every byte derived from the frame
/// index, long enough to fragment at MAX_MESSAGE_SIZE.
pub fn scene_state_bytes(frame_index: u64) -> Vec<u8> {
    (0..600u32)
        .map(|i| (frame_index as u32).wrapping_mul(31).wrapping_add(i) as u8)
        .collect()
}

/// Register an emitter-side provider writing `scene_state_bytes` for
/// consecutive frame indices starting at `first_frame_index`.
pub fn provide_scene_state(
    registry: &Arc<CustomDataRegistry>,
    first_frame_index: u64,
) -> RegistrationGuard {
    let mut frame_index = first_frame_index;
    registry.register_provider(
        SCENE_STATE_TAG,
        Box::new(move |out| {
            out.extend_from_slice(&scene_state_bytes(frame_index));
            frame_index += 1;
        }),
    )
}

/// Record every scene-state section a repeater receives.
pub fn record_scene_state(
    registry: &Arc<CustomDataRegistry>,
) -> (Arc<Mutex<Vec<Vec<u8>>>>, RegistrationGuard) {
    let record = Arc::new(Mutex::new(Vec::new()));
    let hook_record = record.clone();
    let guard = registry.register_consumer(
        SCENE_STATE_TAG,
        Box::new(move |payload| hook_record.lock().unwrap().push(payload.to_vec())),
    );
    (record, guard)
}
