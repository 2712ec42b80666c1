//! Repeater-side frame reassembly.
//!
//! Datagrams for the current frame accumulate into a growable buffer
//! keyed by datagram index and offset; the frame completes once
//! data_length bytes are present. Stale datagrams (older frame) are
//! discarded; datagrams for a newer frame while the current one is
//! incomplete mean the tail of the current frame was lost, so the
//! missing ranges are requested for retransmission. Completed frames
//! are delivered exactly once, in order.
//!
//! Reassembly runs as a pre-processing hook on the receive task; the
//! frame loop awaits completed frames from `next_frame`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use zerocopy::AsBytes;

use lockstep_core::wire::{
    FrameData, Message, MessageType, NodeId, RetransmitFrameData, RetransmittedReceivedFrameData,
};

use crate::agent::{pre_process_priority, NetworkAgent, PreProcess, PreProcessorHandle};

/// How long the current frame may sit incomplete without new datagrams
/// before the missing ranges are requested again. A timing heuristic,
/// not a wire contract.
pub const RETRANSMIT_NUDGE_INTERVAL: Duration = Duration::from_millis(20);

/// One fully reassembled frame.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    pub frame_index: u64,
    pub data: Bytes,
}

struct AssemblerInner {
    current_frame_index: u64,
    data: Vec<u8>,
    data_length: Option<usize>,
    received: Vec<bool>,
    received_bytes: usize,
    last_progress_at: Instant,
    completed: VecDeque<CompletedFrame>,
    /// Kept to answer RetransmitReceivedFrameData for this node.
    last_delivered: Option<CompletedFrame>,
}

impl AssemblerInner {
    fn reset_for(&mut self, frame_index: u64) {
        self.current_frame_index = frame_index;
        self.data = Vec::new();
        self.data_length = None;
        self.received.clear();
        self.received_bytes = 0;
        self.last_progress_at = Instant::now();
    }
}

/// Reassembles the emitter's datagram stream back into frame blobs.
pub struct FrameDataAssembler {
    agent: Arc<dyn NetworkAgent>,
    inner: Arc<Mutex<AssemblerInner>>,
    completed_notify: Arc<Notify>,
    max_data_per_message: usize,
    _hook: PreProcessorHandle,
}

impl FrameDataAssembler {
    /// `node_id` identifies this repeater for received-frame
    /// retransmission requests; `first_frame_index` is the frame the
    /// assembler starts waiting for.
    pub fn new(agent: Arc<dyn NetworkAgent>, node_id: NodeId, first_frame_index: u64) -> Self {
        let max_data_per_message =
            agent.maximum_message_size() - std::mem::size_of::<FrameData>() - 1;

        let inner = Arc::new(Mutex::new(AssemblerInner {
            current_frame_index: first_frame_index,
            data: Vec::new(),
            data_length: None,
            received: Vec::new(),
            received_bytes: 0,
            last_progress_at: Instant::now(),
            completed: VecDeque::new(),
            last_delivered: None,
        }));
        let completed_notify = Arc::new(Notify::new());

        let hook_inner = inner.clone();
        let hook_notify = completed_notify.clone();
        let hook_agent = agent.clone();
        let hook = agent.add_pre_processor(
            pre_process_priority::FRAME_ASSEMBLY,
            Box::new(move |message| match message {
                Message::FrameData(header, payload) => {
                    process_datagram(
                        &hook_inner,
                        hook_agent.as_ref(),
                        &hook_notify,
                        max_data_per_message,
                        header,
                        &payload,
                    );
                    PreProcess::Stop
                }
                Message::RetransmittedReceivedFrameData(header, payload) => {
                    // Same content as FrameData, re-sent by a peer
                    // repeater; feed it through the same path.
                    let as_frame_data = FrameData {
                        frame_index: header.frame_index,
                        data_length: header.data_length,
                        datagram_index: header.datagram_index,
                        datagram_data_offset: header.datagram_data_offset,
                    };
                    process_datagram(
                        &hook_inner,
                        hook_agent.as_ref(),
                        &hook_notify,
                        max_data_per_message,
                        as_frame_data,
                        &payload,
                    );
                    PreProcess::Stop
                }
                Message::RetransmitReceivedFrameData(request) => {
                    if request.node_id == node_id {
                        answer_received_frame_request(
                            &hook_inner,
                            hook_agent.as_ref(),
                            max_data_per_message,
                            request.frame_index,
                        );
                    }
                    PreProcess::Stop
                }
                other => PreProcess::Continue(other),
            }),
        );

        Self {
            agent,
            inner,
            completed_notify,
            max_data_per_message,
            _hook: hook,
        }
    }

    /// Wait up to `timeout` for the next completed frame.
    pub async fn next_frame(&self, timeout: Duration) -> Option<CompletedFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.inner.lock().unwrap().completed.pop_front() {
                return Some(frame);
            }
            if self.agent.is_stopped() {
                return None;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            tokio::select! {
                _ = self.completed_notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }

    /// Frame index the assembler is currently collecting.
    pub fn current_frame_index(&self) -> u64 {
        self.inner.lock().unwrap().current_frame_index
    }

    /// Re-request missing datagrams if the current frame has been
    /// stalled for longer than the nudge interval. Called from the
    /// frame loop while it waits on frame data.
    pub fn nudge(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.received_bytes == inner.data_length.unwrap_or(usize::MAX)
            || inner.last_progress_at.elapsed() < RETRANSMIT_NUDGE_INTERVAL
        {
            return;
        }
        inner.last_progress_at = Instant::now();
        request_missing(&inner, self.agent.as_ref(), self.max_data_per_message);
    }
}

fn datagram_count(data_length: usize, max_data_per_message: usize) -> usize {
    data_length.div_ceil(max_data_per_message).max(1)
}

fn process_datagram(
    inner: &Mutex<AssemblerInner>,
    agent: &dyn NetworkAgent,
    notify: &Notify,
    max_data_per_message: usize,
    header: FrameData,
    payload: &[u8],
) {
    let frame_index = header.frame_index;
    let mut inner = inner.lock().unwrap();

    if frame_index < inner.current_frame_index {
        tracing::trace!(
            frame_index,
            current = inner.current_frame_index,
            "dropping stale datagram"
        );
        return;
    }

    if frame_index > inner.current_frame_index {
        // The emitter moved on while we are still missing pieces of the
        // current frame: ask for them and drop this datagram, it will
        // be retransmitted once we catch up.
        tracing::debug!(
            frame_index,
            current = inner.current_frame_index,
            "datagram for a newer frame, requesting missing ranges"
        );
        request_missing(&inner, agent, max_data_per_message);
        return;
    }

    let data_length = header.data_length as usize;
    let index = header.datagram_index as usize;
    let offset = header.datagram_data_offset as usize;

    if inner.data_length.is_none() {
        inner.data_length = Some(data_length);
        inner.data = vec![0u8; data_length];
        inner
            .received
            .resize(datagram_count(data_length, max_data_per_message), false);
    }

    if inner.received.get(index).copied().unwrap_or(true) {
        tracing::trace!(frame_index, datagram_index = index, "dropping duplicate datagram");
        return;
    }
    if offset + payload.len() > inner.data.len() {
        tracing::warn!(
            frame_index,
            datagram_index = index,
            "datagram does not fit the announced frame length, dropping"
        );
        return;
    }

    inner.data[offset..offset + payload.len()].copy_from_slice(payload);
    inner.received[index] = true;
    inner.received_bytes += payload.len();
    inner.last_progress_at = Instant::now();

    if inner.received_bytes == data_length {
        let frame = CompletedFrame {
            frame_index,
            data: Bytes::from(std::mem::take(&mut inner.data)),
        };
        inner.last_delivered = Some(frame.clone());
        inner.completed.push_back(frame);
        inner.reset_for(frame_index + 1);
        notify.notify_one();
        tracing::trace!(frame_index, "frame complete");
    }
}

/// Request every datagram range of the current frame that has not
/// arrived yet. Before any datagram of the frame was seen the total
/// count is unknown; the full range is requested and the emitter clamps
/// it to what exists.
fn request_missing(inner: &AssemblerInner, agent: &dyn NetworkAgent, max_data_per_message: usize) {
    let frame_index = inner.current_frame_index;
    let mut send = |start: usize, end: u32| {
        let request = RetransmitFrameData {
            frame_index,
            datagram_index_start: start as u32,
            datagram_index_end: end,
        };
        if let Err(e) = agent.send(MessageType::RetransmitFrameData, request.as_bytes(), &[]) {
            tracing::warn!(error = %e, frame_index, "retransmit request failed to send");
        }
    };

    let Some(data_length) = inner.data_length else {
        send(0, u32::MAX);
        return;
    };

    let count = datagram_count(data_length, max_data_per_message);
    let mut run_start = None;
    for index in 0..count {
        let missing = !inner.received.get(index).copied().unwrap_or(false);
        match (missing, run_start) {
            (true, None) => run_start = Some(index),
            (false, Some(start)) => {
                send(start, index as u32);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        send(start, count as u32);
    }
}

/// Re-send a frame this node already received, asked for by a peer that
/// needs to catch up (an emitter taking over, typically).
fn answer_received_frame_request(
    inner: &Mutex<AssemblerInner>,
    agent: &dyn NetworkAgent,
    max_data_per_message: usize,
    frame_index: u64,
) {
    let frame = {
        let inner = inner.lock().unwrap();
        match &inner.last_delivered {
            Some(frame) if frame.frame_index == frame_index => frame.clone(),
            _ => {
                tracing::debug!(frame_index, "no kept frame to re-send, ignoring request");
                return;
            }
        }
    };

    let count = datagram_count(frame.data.len(), max_data_per_message);
    for datagram_index in 0..count {
        let offset = max_data_per_message * datagram_index;
        let to_send = (frame.data.len() - offset).min(max_data_per_message);
        let header = RetransmittedReceivedFrameData {
            frame_index,
            data_length: frame.data.len() as u32,
            datagram_index: datagram_index as u32,
            datagram_data_offset: offset as u32,
        };
        if let Err(e) = agent.send(
            MessageType::RetransmittedReceivedFrameData,
            header.as_bytes(),
            &frame.data[offset..offset + to_send],
        ) {
            tracing::warn!(error = %e, frame_index, datagram_index, "received-frame re-send failed");
        }
    }
}
