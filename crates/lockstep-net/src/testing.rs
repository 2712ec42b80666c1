//! In-process loopback hub: a virtual multicast segment.
//!
//! Protocol tests run whole clusters inside one process by attaching
//! several agents to a hub. A send from one agent is ingested by every
//! other agent synchronously on the sender's task, which plays the part
//! of the receive thread (pre-processors included). A drop filter
//! simulates packet loss so retransmission paths can be exercised
//! deterministically.

use std::sync::{Arc, Mutex};

use lockstep_core::wire::MessageType;
use lockstep_core::{NodeIdBitVec, Result};

use crate::agent::{AgentShared, NetworkAgent, NetworkStats, PreProcessorFn, PreProcessorHandle};

/// Decides whether a datagram is "lost". Return true to drop.
pub type DropFilter = Box<dyn FnMut(MessageType, &[u8]) -> bool + Send>;

struct HubInner {
    members: Vec<Arc<AgentShared>>,
    drop_filter: Option<DropFilter>,
    /// Datagrams waiting for delivery. Kept in a flat queue so a hook
    /// that sends while its own datagram is being delivered cannot
    /// recurse back into an agent's pre-processor chain.
    pending: std::collections::VecDeque<(Option<Arc<AgentShared>>, Vec<u8>)>,
    delivering: bool,
}

/// A virtual multicast segment connecting loopback agents.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
    max_message_size: usize,
}

impl LoopbackHub {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                members: Vec::new(),
                drop_filter: None,
                pending: std::collections::VecDeque::new(),
                delivering: false,
            })),
            max_message_size,
        }
    }

    /// Attach a new agent to the segment.
    pub fn attach(&self) -> Arc<LoopbackAgent> {
        let shared = AgentShared::new();
        self.inner.lock().unwrap().members.push(shared.clone());
        Arc::new(LoopbackAgent {
            hub: self.clone(),
            shared,
            max_message_size: self.max_message_size,
        })
    }

    /// Install (or clear) the packet-loss filter.
    pub fn set_drop_filter(&self, filter: Option<DropFilter>) {
        self.inner.lock().unwrap().drop_filter = filter;
    }

    /// Deliver a raw datagram to every attached agent, bypassing the
    /// loss filter. For malformed-input tests.
    pub fn inject_raw(&self, datagram: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.push_back((None, datagram.to_vec()));
        self.drain(inner);
    }

    fn broadcast(&self, from: &Arc<AgentShared>, message_type: MessageType, datagram: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(filter) = inner.drop_filter.as_mut() {
            if filter(message_type, datagram) {
                tracing::trace!(message_type = ?message_type, "loopback hub dropped datagram");
                return;
            }
        }
        inner.pending.push_back((Some(from.clone()), datagram.to_vec()));
        self.drain(inner);
    }

    /// Deliver queued datagrams until the queue runs dry. Only one
    /// caller drains at a time; anything enqueued by a hook during
    /// delivery is picked up by the active drainer.
    fn drain<'a>(&'a self, mut inner: std::sync::MutexGuard<'a, HubInner>) {
        if inner.delivering {
            return;
        }
        inner.delivering = true;
        loop {
            let Some((from, datagram)) = inner.pending.pop_front() else {
                inner.delivering = false;
                return;
            };
            let members = inner.members.clone();
            drop(inner);
            for member in &members {
                let own = from.as_ref().is_some_and(|f| Arc::ptr_eq(member, f));
                if !own {
                    member.ingest(&datagram);
                }
            }
            inner = self.inner.lock().unwrap();
        }
    }
}

/// One node's view of the loopback segment.
pub struct LoopbackAgent {
    hub: LoopbackHub,
    shared: Arc<AgentShared>,
    max_message_size: usize,
}

impl NetworkAgent for LoopbackAgent {
    fn send(&self, message_type: MessageType, header: &[u8], payload: &[u8]) -> Result<()> {
        let datagram = crate::agent::assemble_datagram(message_type, header, payload);
        self.shared.record_sent(message_type);
        self.hub.broadcast(&self.shared, message_type, &datagram);
        Ok(())
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
