//! Network agent: framed message send/receive over UDP multicast.
//!
//! A background task continuously drains the socket into an internal
//! queue so the network layer itself never blocks on the frame loop.
//! Parsed messages flow through a priority-ordered pre-processor chain
//! on that task (retransmission handling and frame reassembly live
//! there); survivors land in the receive queue that `try_receive`
//! serves to the frame-loop thread.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use zerocopy::AsBytes;

use lockstep_core::config::NetworkConfig;
use lockstep_core::wire::{Message, MessageType, MESSAGE_TYPE_COUNT};
use lockstep_core::{NodeIdBitVec, Result};

/// Outcome of one pre-processor invocation.
pub enum PreProcess {
    /// Hand the message to the next hook (or the receive queue).
    Continue(Message),
    /// The hook consumed the message; nothing further sees it.
    Stop,
}

pub type PreProcessorFn = Box<dyn FnMut(Message) -> PreProcess + Send>;

/// Well-known pre-processor priorities. Lower values run first.
pub mod pre_process_priority {
    /// Retransmission requests must be answered before anything else
    /// looks at the stream.
    pub const RETRANSMIT_HANDLING: i32 = 100;
    /// Frame reassembly consumes FrameData on the receive task.
    pub const FRAME_ASSEMBLY: i32 = 200;
    /// Emitter-side acknowledgement gathering.
    pub const ACK_GATHERING: i32 = 300;
}

/// Snapshot of per-type network counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub sent: [u64; MESSAGE_TYPE_COUNT],
    pub received: [u64; MESSAGE_TYPE_COUNT],
    /// FrameData sends that were repeats of earlier datagrams.
    pub retransmitted: u64,
    /// Datagrams that failed to parse and were dropped.
    pub parse_failures: u64,
}

/// The seam between the protocol engines and the actual network. The UDP
/// implementation below is the production one; tests plug in the loopback
/// hub from the `testing` module.
pub trait NetworkAgent: Send + Sync {
    /// Send one framed message to the whole cluster.
    fn send(&self, message_type: MessageType, header: &[u8], payload: &[u8]) -> Result<()>;

    /// Register a pre-processing hook. Hooks run on the receive task in
    /// ascending priority order. The returned handle unregisters the
    /// hook when dropped.
    fn add_pre_processor(&self, priority: i32, hook: PreProcessorFn) -> PreProcessorHandle;

    /// Node ids observed in any received message so far.
    fn node_presence_mask(&self) -> NodeIdBitVec;

    /// Largest datagram this agent will emit, type byte and header
    /// included.
    fn maximum_message_size(&self) -> usize;

    fn stats(&self) -> NetworkStats;

    /// Unblock pending receives and stop the background task. Safe to
    /// call from any thread, any number of times.
    fn stop(&self);

    fn is_stopped(&self) -> bool;

    /// Access to the shared receive queue, used by `try_receive`.
    fn shared(&self) -> &Arc<AgentShared>;
}

/// Convenience wrapper over the queue shared by all agent
/// implementations: wait up to `timeout` for the next queued message.
pub async fn try_receive(
    agent: &dyn NetworkAgent,
    timeout: Duration,
) -> Option<Message> {
    agent.shared().try_receive(timeout).await
}

/// Typed send for a header struct (prepends the message type byte).
pub fn send_message<H: AsBytes>(
    agent: &dyn NetworkAgent,
    message_type: MessageType,
    header: &H,
) -> Result<()> {
    agent.send(message_type, header.as_bytes(), &[])
}

// ── Shared agent machinery ───────────────────────────────────────────────────

struct Registered {
    id: u64,
    priority: i32,
    hook: PreProcessorFn,
}

/// State shared between an agent handle, its receive task, and the
/// pre-processor handles it gave out.
pub struct AgentShared {
    queue: Mutex<VecDeque<Message>>,
    queue_notify: Notify,
    pre_processors: Mutex<Vec<Registered>>,
    next_pre_processor_id: AtomicU64,
    presence: Mutex<NodeIdBitVec>,
    sent: [AtomicU64; MESSAGE_TYPE_COUNT],
    received: [AtomicU64; MESSAGE_TYPE_COUNT],
    retransmitted: AtomicU64,
    parse_failures: AtomicU64,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl AgentShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            pre_processors: Mutex::new(Vec::new()),
            next_pre_processor_id: AtomicU64::new(1),
            presence: Mutex::new(NodeIdBitVec::empty()),
            sent: Default::default(),
            received: Default::default(),
            retransmitted: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    /// Feed one raw datagram through parsing, presence tracking, the
    /// pre-processor chain, and finally the receive queue. Runs on the
    /// receive task (or the sender's task, for the loopback hub).
    pub fn ingest(&self, datagram: &[u8]) {
        let message = match Message::parse(datagram) {
            Ok(m) => m,
            Err(e) => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(error = %e, len = datagram.len(), "dropping unparseable datagram");
                return;
            }
        };

        self.received[message.message_type().index()].fetch_add(1, Ordering::Relaxed);
        if let Some(node_id) = message.source_node_id() {
            self.presence.lock().unwrap().set(node_id);
        }

        let mut current = message;
        {
            let mut hooks = self.pre_processors.lock().unwrap();
            for registered in hooks.iter_mut() {
                match (registered.hook)(current) {
                    PreProcess::Continue(m) => current = m,
                    PreProcess::Stop => return,
                }
            }
        }

        self.queue.lock().unwrap().push_back(current);
        self.queue_notify.notify_one();
    }

    /// Pop the next queued message without waiting.
    pub fn try_pop(&self) -> Option<Message> {
        self.queue.lock().unwrap().pop_front()
    }

    pub async fn try_receive(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.queue.lock().unwrap().pop_front() {
                return Some(message);
            }
            if self.stopped.load(Ordering::Acquire) {
                return None;
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            tokio::select! {
                _ = self.queue_notify.notified() => {}
                _ = self.stop_notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }

    pub fn register_pre_processor(
        self: &Arc<Self>,
        priority: i32,
        hook: PreProcessorFn,
    ) -> PreProcessorHandle {
        let id = self.next_pre_processor_id.fetch_add(1, Ordering::Relaxed);
        let mut hooks = self.pre_processors.lock().unwrap();
        let at = hooks
            .iter()
            .position(|r| r.priority > priority)
            .unwrap_or(hooks.len());
        hooks.insert(at, Registered { id, priority, hook });
        PreProcessorHandle {
            id,
            shared: Arc::downgrade(self),
        }
    }

    fn unregister(&self, id: u64) {
        self.pre_processors.lock().unwrap().retain(|r| r.id != id);
    }

    pub fn record_sent(&self, message_type: MessageType) {
        self.sent[message_type.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retransmission(&self) {
        self.retransmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = NetworkStats::default();
        for i in 0..MESSAGE_TYPE_COUNT {
            stats.sent[i] = self.sent[i].load(Ordering::Relaxed);
            stats.received[i] = self.received[i].load(Ordering::Relaxed);
        }
        stats.retransmitted = self.retransmitted.load(Ordering::Relaxed);
        stats.parse_failures = self.parse_failures.load(Ordering::Relaxed);
        stats
    }

    pub fn presence(&self) -> NodeIdBitVec {
        *self.presence.lock().unwrap()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
        self.queue_notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Scoped registration of a pre-processing hook. Dropping it removes the
/// hook from the chain.
pub struct PreProcessorHandle {
    id: u64,
    shared: Weak<AgentShared>,
}

impl Drop for PreProcessorHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unregister(self.id);
        }
    }
}

// ── UDP implementation ────────────────────────────────────────────────────────

/// Production agent: one multicast group, one socket, one receive task.
pub struct UdpAgent {
    shared: Arc<AgentShared>,
    send_socket: StdUdpSocket,
    destination: SocketAddrV4,
    max_message_size: usize,
}

impl UdpAgent {
    /// Bind the configured adapter, join the multicast group, and start
    /// the background receive task on the current tokio runtime.
    pub fn start(config: &NetworkConfig) -> Result<Arc<Self>> {
        let socket = make_multicast_socket(config)?;
        let send_socket = socket.try_clone()?;
        let recv_socket = UdpSocket::from_std(socket)?;

        let shared = AgentShared::new();
        let agent = Arc::new(Self {
            shared: shared.clone(),
            send_socket,
            destination: SocketAddrV4::new(config.multicast_address, config.port),
            max_message_size: config.max_message_size,
        });

        tokio::spawn(receive_loop(recv_socket, shared));

        tracing::info!(
            group = %config.multicast_address,
            port = config.port,
            adapter = %config.adapter_address,
            "network agent started"
        );
        Ok(agent)
    }
}

impl NetworkAgent for UdpAgent {
    fn send(&self, message_type: MessageType, header: &[u8], payload: &[u8]) -> Result<()> {
        let datagram = assemble_datagram(message_type, header, payload);
        match self.send_socket.send_to(&datagram, self.destination) {
            Ok(_) => {
                self.shared.record_sent(message_type);
                Ok(())
            }
            Err(e) => {
                // UDP is lossy by contract; a failed send is recovered
                // by the retransmission layer, not by the sender.
                tracing::warn!(error = %e, message_type = ?message_type, "send failed");
                Ok(())
            }
        }
    }

    fn add_pre_processor(&self, priority: i32, hook: PreProcessorFn) -> PreProcessorHandle {
        self.shared.register_pre_processor(priority, hook)
    }

    fn node_presence_mask(&self) -> NodeIdBitVec {
        self.shared.presence()
    }

    fn maximum_message_size(&self) -> usize {
        self.max_message_size
    }

    fn stats(&self) -> NetworkStats {
        self.shared.stats()
    }

    fn stop(&self) {
        self.shared.stop();
    }

    fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    fn shared(&self) -> &Arc<AgentShared> {
        &self.shared
    }
}

impl Drop for UdpAgent {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

pub(crate) fn assemble_datagram(message_type: MessageType, header: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(1 + header.len() + payload.len());
    datagram.push(message_type as u8);
    datagram.extend_from_slice(header);
    datagram.extend_from_slice(payload);
    datagram
}

async fn receive_loop(socket: UdpSocket, shared: Arc<AgentShared>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = shared.stop_notify.notified() => {
                tracing::debug!("receive loop stopping");
                return;
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, _from)) => shared.ingest(&buf[..len]),
                    Err(e) => {
                        tracing::warn!(error = %e, "recv_from failed");
                        continue;
                    }
                }
            }
        }
    }
}

/// Create a UDP socket bound to the sync port and joined to the
/// multicast group on the configured adapter. Loopback stays enabled so
/// several nodes can share one machine.
fn make_multicast_socket(config: &NetworkConfig) -> Result<StdUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
    socket.bind(&bind_addr.into())?;

    socket.join_multicast_v4(&config.multicast_address, &config.adapter_address)?;
    socket.set_multicast_if_v4(&config.adapter_address)?;
    socket.set_multicast_ttl_v4(config.ttl)?;
    socket.set_multicast_loop_v4(true)?;

    Ok(socket.into())
}
