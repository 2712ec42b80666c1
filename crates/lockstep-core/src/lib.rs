//! Core types of the lockstep frame-synchronization protocol: wire
//! messages, the node-set bitmask, cluster topology, configuration, and
//! the error taxonomy. Everything network- or state-machine-shaped lives
//! in the lockstep-net and lockstep-node crates.

pub mod config;
pub mod error;
pub mod node_set;
pub mod topology;
pub mod wire;

pub use config::{ClusterConfig, SurveyedRepeater};
pub use error::{Error, Result, WireError};
pub use node_set::NodeIdBitVec;
pub use topology::{ClusterTopology, ClusterTopologyEntry, NodeRole};
pub use wire::{Message, MessageType, NodeId};
