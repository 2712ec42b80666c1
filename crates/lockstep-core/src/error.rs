//! Error taxonomy for the lockstep protocol.
//!
//! Four families of conditions, handled very differently:
//!   Timeout            - a required control message never arrived; fatal.
//!   Protocol violation - rejected registration, out-of-order frame index,
//!                        frame data before registration; fatal, distinct
//!                        from timeout so operators can tell them apart.
//!   Transient          - stale datagrams, mismatched control traffic,
//!                        retransmit requests outside history; dropped,
//!                        at most a warning log, never surfaced as errors.
//!   Back-pressure      - full event queue; a bool return, not an error.
//!
//! Only the first two families appear in this module.

use std::time::Duration;

/// Errors raised while interpreting raw wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty datagram")]
    EmptyDatagram,

    #[error("unknown message type byte: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("truncated header for message type {message_type}: got {got} bytes")]
    TruncatedHeader { message_type: u8, got: usize },
}

/// Fatal errors terminating a node's run loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A control message required to make progress did not arrive within
    /// the configured window. Not retried internally.
    #[error("timed out after {elapsed:?} while {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        elapsed: Duration,
    },

    /// The emitter answered our registration with accepted = false.
    #[error("emitter rejected registration of node {node_id}")]
    RegistrationRejected { node_id: u8 },

    /// Frame data for a frame past the first one was observed before this
    /// repeater ever completed registration. Frames have been missed and
    /// state consistency cannot be guaranteed.
    #[error(
        "received data for frame {received_frame_index} before registration completed \
         (expected first frame {expected_first_frame_index})"
    )]
    MissedFrames {
        received_frame_index: u64,
        expected_first_frame_index: u64,
    },

    /// The splitter was handed a frame index that does not follow the
    /// previous one. This is a caller bug, not a network condition.
    #[error("non consecutive frame index: previous was {previous}, new one is {new}")]
    NonConsecutiveFrameIndex { previous: u64, new: u64 },

    /// Construction-time parameter validation.
    #[error("retransmit history must be >= 2, got {0}")]
    RetransmitHistoryTooSmall(usize),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport was stopped while a wait was in progress.
    #[error("network agent stopped")]
    AgentStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
