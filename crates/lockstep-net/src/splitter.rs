//! Emitter-side frame splitter and retransmission cache.
//!
//! Fragments one frame's state blob into datagrams sized for the
//! transport, keeps a bounded ring of recently sent frames, and answers
//! RetransmitFrameData requests from a pre-processing hook on the
//! receive task. The ring lock is held for the whole retransmission
//! scan; a concurrent rotation must not invalidate the buffer being
//! read. Retransmission volume is expected to be low, so the wide lock
//! does not hurt.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use zerocopy::AsBytes;

use lockstep_core::wire::{FrameData, Message, MessageType, RetransmitFrameData};
use lockstep_core::{Error, Result};

use crate::agent::{pre_process_priority, NetworkAgent, PreProcess, PreProcessorHandle};
use crate::pool::{BufferPool, FrameDataBuffer};

/// Minimum delay between two transmissions of the same datagram. Many
/// repeaters asking for the same range within this window produce a
/// single send.
const SHORT_RETRANSMISSION_WINDOW: Duration = Duration::from_millis(2);

struct SentFrameEntry {
    frame_index: u64,
    buffer: Option<FrameDataBuffer>,
    /// Last send time per datagram index. Grown on demand; a frame
    /// rarely needs more than 64 datagrams.
    datagram_sent_at: Vec<Option<Instant>>,
}

impl SentFrameEntry {
    fn new() -> Self {
        Self {
            frame_index: 0,
            buffer: None,
            datagram_sent_at: vec![None; 64],
        }
    }

    fn clear_send_times(&mut self) {
        for slot in &mut self.datagram_sent_at {
            *slot = None;
        }
    }

    fn sent_at(&self, datagram_index: usize) -> Option<Instant> {
        self.datagram_sent_at.get(datagram_index).copied().flatten()
    }

    fn mark_sent(&mut self, datagram_index: usize, at: Instant) {
        if datagram_index >= self.datagram_sent_at.len() {
            self.datagram_sent_at.resize(datagram_index + 16, None);
        }
        self.datagram_sent_at[datagram_index] = Some(at);
    }
}

struct Ring {
    entries: Vec<SentFrameEntry>,
    oldest: usize,
    newest: usize,
    sent_frames: u64,
}

/// An empty frame still goes out as one zero-payload datagram so
/// repeaters learn its length and can complete it.
fn datagram_count(buffer_len: usize, max_data_per_message: usize) -> usize {
    buffer_len.div_ceil(max_data_per_message).max(1)
}

/// Splits frames into datagrams and serves retransmissions from a
/// bounded history ring.
pub struct FrameDataSplitter {
    agent: Arc<dyn NetworkAgent>,
    ring: Arc<Mutex<Ring>>,
    pool: BufferPool,
    max_data_per_message: usize,
    _retransmit_hook: PreProcessorHandle,
}

impl FrameDataSplitter {
    /// `retransmit_history` must be >= 2: the previous frame has to stay
    /// retransmittable while the current one is being sent.
    pub fn new(agent: Arc<dyn NetworkAgent>, retransmit_history: usize) -> Result<Self> {
        if retransmit_history < 2 {
            return Err(Error::RetransmitHistoryTooSmall(retransmit_history));
        }

        let max_data_per_message =
            agent.maximum_message_size() - std::mem::size_of::<FrameData>() - 1;

        let ring = Arc::new(Mutex::new(Ring {
            entries: (0..retransmit_history).map(|_| SentFrameEntry::new()).collect(),
            oldest: 0,
            newest: retransmit_history - 1,
            sent_frames: 0,
        }));
        let pool = BufferPool::new();

        let hook_ring = ring.clone();
        let hook_agent = agent.clone();
        let retransmit_hook = agent.add_pre_processor(
            pre_process_priority::RETRANSMIT_HANDLING,
            Box::new(move |message| match message {
                Message::RetransmitFrameData(request) => {
                    handle_retransmit_request(
                        &hook_ring,
                        hook_agent.as_ref(),
                        max_data_per_message,
                        request,
                    );
                    PreProcess::Stop
                }
                other => PreProcess::Continue(other),
            }),
        );

        Ok(Self {
            agent,
            ring,
            pool,
            max_data_per_message,
            _retransmit_hook: retransmit_hook,
        })
    }

    /// A buffer for the next frame, recycled from the pool when one is
    /// available.
    pub fn get_new_frame_buffer(&self) -> FrameDataBuffer {
        self.pool.acquire()
    }

    /// Buffers waiting for reuse. Debugging aid.
    pub fn inactive_buffer_count(&self) -> usize {
        self.pool.inactive_count()
    }

    /// Send one frame, splitting it into datagrams that repeaters can
    /// reassemble. Ownership of `frame_data` moves to the ring; it comes
    /// back through `get_new_frame_buffer` after eviction.
    ///
    /// The first call establishes the frame-index baseline; every later
    /// call must pass the previous index plus one.
    pub fn send_frame_data(&self, frame_index: u64, frame_data: FrameDataBuffer) -> Result<()> {
        let mut ring = self.ring.lock().unwrap();

        let newest = &ring.entries[ring.newest];
        if newest.buffer.is_some() && newest.frame_index + 1 != frame_index {
            return Err(Error::NonConsecutiveFrameIndex {
                previous: newest.frame_index,
                new: frame_index,
            });
        }

        // Rotate: the oldest slot is reused for the new frame and its
        // previous occupant goes back to the pool.
        let oldest = ring.oldest;
        if let Some(evicted) = ring.entries[oldest].buffer.take() {
            self.pool.release(evicted);
        }
        let entry = &mut ring.entries[oldest];
        entry.frame_index = frame_index;
        entry.buffer = Some(frame_data);
        entry.clear_send_times();

        let capacity = ring.entries.len();
        ring.oldest = (ring.oldest + 1) % capacity;
        ring.newest = (ring.newest + 1) % capacity;
        ring.sent_frames += 1;

        let slot = ring.newest;
        let buffer_len = ring.entries[slot]
            .buffer
            .as_ref()
            .map(FrameDataBuffer::len)
            .unwrap_or(0);
        let datagram_count = datagram_count(buffer_len, self.max_data_per_message);
        for datagram_index in 0..datagram_count {
            send_datagram_of(
                &mut ring.entries[slot],
                datagram_index,
                self.agent.as_ref(),
                self.max_data_per_message,
            );
        }
        Ok(())
    }
}

impl Drop for FrameDataSplitter {
    fn drop(&mut self) {
        // Return every ringed buffer to the pool; nobody can be reading
        // them once the splitter is gone.
        let mut ring = self.ring.lock().unwrap();
        for entry in &mut ring.entries {
            if let Some(buffer) = entry.buffer.take() {
                self.pool.release(buffer);
            }
        }
    }
}

/// Send one datagram of a ringed frame, unless the same datagram went
/// out within the dedup window.
fn send_datagram_of(
    entry: &mut SentFrameEntry,
    datagram_index: usize,
    agent: &dyn NetworkAgent,
    max_data_per_message: usize,
) {
    let now = Instant::now();
    if let Some(last) = entry.sent_at(datagram_index) {
        if now < last + SHORT_RETRANSMISSION_WINDOW {
            return;
        }
    }

    let Some(buffer) = entry.buffer.as_ref() else {
        return;
    };
    let offset = max_data_per_message * datagram_index;
    let to_send = (buffer.len() - offset).min(max_data_per_message);
    let header = FrameData {
        frame_index: entry.frame_index,
        data_length: buffer.len() as u32,
        datagram_index: datagram_index as u32,
        datagram_data_offset: offset as u32,
    };
    let payload = &buffer.as_slice()[offset..offset + to_send];
    if let Err(e) = agent.send(MessageType::FrameData, header.as_bytes(), payload) {
        tracing::warn!(error = %e, frame_index = entry.frame_index, datagram_index, "datagram send failed");
        return;
    }
    entry.mark_sent(datagram_index, now);
}

/// Answer a retransmission request from the receive task. The ring lock
/// is held for the whole scan.
fn handle_retransmit_request(
    ring: &Mutex<Ring>,
    agent: &dyn NetworkAgent,
    max_data_per_message: usize,
    request: RetransmitFrameData,
) {
    let frame_index = request.frame_index;
    let mut ring = ring.lock().unwrap();

    let oldest_frame_index = ring.entries[ring.oldest].frame_index;
    let newest_frame_index = ring.entries[ring.newest].frame_index;
    if frame_index < oldest_frame_index || frame_index > newest_frame_index {
        // A request for "the next frame" is a repeater running slightly
        // ahead of us; the data is about to be sent anyway. Anything
        // else asks for history we no longer have.
        if frame_index != newest_frame_index + 1 {
            tracing::warn!(
                frame_index,
                oldest = oldest_frame_index,
                newest = newest_frame_index,
                "retransmit request outside kept history, skipping"
            );
        }
        return;
    }

    let capacity = ring.entries.len();
    let mut slot =
        (ring.oldest + (frame_index - oldest_frame_index) as usize) % capacity;
    if ring.sent_frames < capacity as u64 {
        // The ring has not wrapped yet; slot arithmetic is not stable,
        // so search for a matching occupied entry instead.
        for (i, entry) in ring.entries.iter().enumerate() {
            if entry.frame_index == frame_index && entry.buffer.is_some() {
                slot = i;
                break;
            }
        }
    }

    let Some(buffer_len) = ring.entries[slot].buffer.as_ref().map(FrameDataBuffer::len) else {
        // Requests for frame 0 hit this a lot before anything was sent,
        // especially with delayed repeaters; only warn past that.
        if frame_index > 0 {
            tracing::warn!(frame_index, "retransmit request for a frame with no kept data");
        }
        return;
    };

    let datagram_count = datagram_count(buffer_len, max_data_per_message);
    let start = request.datagram_index_start as usize;
    let stop = (request.datagram_index_end as usize).min(datagram_count);
    for datagram_index in start..stop {
        send_datagram_of(
            &mut ring.entries[slot],
            datagram_index,
            agent,
            max_data_per_message,
        );
        agent.shared().record_retransmission();
    }
}
