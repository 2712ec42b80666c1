//! Networking layer of the lockstep protocol: the multicast agent with
//! its receive task and pre-processor chain, the frame buffer pool, the
//! emitter-side splitter/retransmission ring, and the repeater-side
//! assembler.

pub mod agent;
pub mod assembler;
pub mod pool;
pub mod splitter;
pub mod testing;

pub use agent::{
    pre_process_priority, send_message, try_receive, NetworkAgent, NetworkStats, PreProcess,
    PreProcessorFn, PreProcessorHandle, UdpAgent,
};
pub use assembler::{CompletedFrame, FrameDataAssembler};
pub use pool::{BufferPool, FrameDataBuffer};
pub use splitter::FrameDataSplitter;
