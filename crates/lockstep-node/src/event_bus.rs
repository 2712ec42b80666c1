//! Strongly-typed event propagation across the cluster (emitter to
//! repeaters), riding the per-frame custom-data section.
//!
//! Events of a registered type queue up on the emitter until the next
//! sync point, where the bus serializes them as a 64-byte type
//! identifier followed by the packed records. On the repeater side the
//! bus rejects sections whose identifier does not match (several buses
//! of different types share the same section tag) and otherwise decodes
//! the records and invokes listeners: per-record listeners in arrival
//! order first, then bulk listeners with the whole batch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use zerocopy::{AsBytes, FromBytes};

use crate::registry::{CustomDataRegistry, RegistrationGuard, CUSTOM_EVENTS_TAG};

/// Unflushed events kept per bus. Publishing past this bound fails.
pub const MAX_QUEUED_EVENTS: usize = 128;

/// Length of the serialized type identifier.
pub const EVENT_TYPE_ID_LENGTH: usize = 64;

/// Marker for types that can ride the event bus: fixed layout, plain
/// data, no padding surprises.
pub trait ClusterEvent: AsBytes + FromBytes + Copy + Send + Sync + 'static {}

impl<T: AsBytes + FromBytes + Copy + Send + Sync + 'static> ClusterEvent for T {}

/// The first 64 bytes of every serialized batch. Derived from the type
/// name; all nodes run the same executable, so the name is a stable
/// cluster-wide identifier.
fn event_type_id<T: 'static>() -> [u8; EVENT_TYPE_ID_LENGTH] {
    let name = std::any::type_name::<T>().as_bytes();
    let mut id = [0u8; EVENT_TYPE_ID_LENGTH];
    let len = name.len().min(EVENT_TYPE_ID_LENGTH);
    // keep the tail: the generic suffix differentiates instantiations
    // better than the shared crate prefix
    id[..len].copy_from_slice(&name[name.len() - len..]);
    id
}

type Listener<T> = Box<dyn FnMut(&T) + Send>;
type BulkListener<T> = Box<dyn FnMut(&[T]) + Send>;

/// Listener tables, locked separately from the queue so a listener may
/// publish from inside its callback.
struct Listeners<T> {
    single: Vec<(u64, Listener<T>)>,
    bulk: Vec<(u64, BulkListener<T>)>,
    next_id: u64,
}

struct BusState<T> {
    queue: Mutex<Vec<T>>,
    listeners: Mutex<Listeners<T>>,
}

/// Typed publish/subscribe bus multiplexed onto the frame channel.
pub struct EventBus<T: ClusterEvent> {
    state: Arc<BusState<T>>,
    type_id: [u8; EVENT_TYPE_ID_LENGTH],
    _provider: RegistrationGuard,
    _consumer: RegistrationGuard,
}

impl<T: ClusterEvent> EventBus<T> {
    /// Create a bus wired into the node's custom-data registry. The bus
    /// unregisters itself when dropped.
    pub fn new(registry: &Arc<CustomDataRegistry>) -> Self {
        let state = Arc::new(BusState {
            queue: Mutex::new(Vec::with_capacity(MAX_QUEUED_EVENTS)),
            listeners: Mutex::new(Listeners {
                single: Vec::new(),
                bulk: Vec::new(),
                next_id: 1,
            }),
        });
        let type_id = event_type_id::<T>();

        let provider_state = state.clone();
        let provider = registry.register_provider(
            CUSTOM_EVENTS_TAG,
            Box::new(move |out| {
                flush_for_transmission(&provider_state, &type_id, out);
            }),
        );

        let consumer_state = state.clone();
        let consumer = registry.register_consumer(
            CUSTOM_EVENTS_TAG,
            Box::new(move |payload| {
                receive_and_dispatch(&consumer_state, &type_id, payload);
            }),
        );

        Self {
            state,
            type_id,
            _provider: provider,
            _consumer: consumer,
        }
    }

    /// Enqueue an event for propagation at the next sync point.
    ///
    /// Returns false, dropping the event, when the queue is full; the
    /// caller sees the back-pressure and decides what to shed.
    pub fn publish(&self, event: T) -> bool {
        let mut queue = self.state.queue.lock().unwrap();
        if queue.len() >= MAX_QUEUED_EVENTS {
            return false;
        }
        queue.push(event);
        true
    }

    /// Events queued and not yet flushed.
    pub fn queued_len(&self) -> usize {
        self.state.queue.lock().unwrap().len()
    }

    /// Listen for single events. Dropping the returned subscription
    /// unsubscribes.
    pub fn subscribe(&self, listener: impl FnMut(&T) + Send + 'static) -> Subscription<T> {
        let mut listeners = self.state.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.single.push((id, Box::new(listener)));
        Subscription {
            state: Arc::downgrade(&self.state),
            id,
            bulk: false,
        }
    }

    /// Listen for whole batches. Efficient when the listener processes
    /// event data in bulk.
    pub fn subscribe_bulk(&self, listener: impl FnMut(&[T]) + Send + 'static) -> Subscription<T> {
        let mut listeners = self.state.listeners.lock().unwrap();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.bulk.push((id, Box::new(listener)));
        Subscription {
            state: Arc::downgrade(&self.state),
            id,
            bulk: true,
        }
    }

    /// Serialize queued events and clear the queue. Returns written
    /// size. Normally invoked through the registry by the frame
    /// producer; public for direct use in tests and tools.
    pub fn flush_for_transmission(&self, out: &mut Vec<u8>) -> usize {
        flush_for_transmission(&self.state, &self.type_id, out)
    }

    /// Decode a serialized batch and invoke listeners. Returns false
    /// without dispatching when the type identifier does not match
    /// (someone else's event stream, not an error).
    pub fn receive_and_dispatch(&self, raw: &[u8]) -> bool {
        receive_and_dispatch(&self.state, &self.type_id, raw)
    }
}

fn flush_for_transmission<T: ClusterEvent>(
    state: &BusState<T>,
    type_id: &[u8; EVENT_TYPE_ID_LENGTH],
    out: &mut Vec<u8>,
) -> usize {
    let mut queue = state.queue.lock().unwrap();
    let start = out.len();
    out.extend_from_slice(type_id);
    for event in queue.iter() {
        out.extend_from_slice(event.as_bytes());
    }
    queue.clear();
    out.len() - start
}

fn receive_and_dispatch<T: ClusterEvent>(
    state: &BusState<T>,
    type_id: &[u8; EVENT_TYPE_ID_LENGTH],
    raw: &[u8],
) -> bool {
    if raw.len() < EVENT_TYPE_ID_LENGTH || &raw[..EVENT_TYPE_ID_LENGTH] != type_id {
        return false;
    }

    let record_size = std::mem::size_of::<T>();
    let data = &raw[EVENT_TYPE_ID_LENGTH..];
    if record_size == 0 || data.len() % record_size != 0 {
        tracing::warn!(
            len = data.len(),
            record_size,
            "event payload is not a whole number of records, dropping"
        );
        return false;
    }

    let mut events = Vec::with_capacity(data.len() / record_size);
    for chunk in data.chunks_exact(record_size) {
        match T::read_from(chunk) {
            Some(event) => events.push(event),
            None => {
                tracing::warn!("event record failed to decode, dropping batch");
                return false;
            }
        }
    }

    let mut listeners = state.listeners.lock().unwrap();
    for event in &events {
        for (id, listener) in listeners.single.iter_mut() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                tracing::error!(listener = *id, panic = panic_text(&payload), "event listener panicked");
            }
        }
    }
    for (id, listener) in listeners.bulk.iter_mut() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(&events))) {
            tracing::error!(listener = *id, panic = panic_text(&payload), "bulk event listener panicked");
        }
    }
    true
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic>")
}

/// Scoped listener registration.
pub struct Subscription<T: ClusterEvent> {
    state: Weak<BusState<T>>,
    id: u64,
    bulk: bool,
}

impl<T: ClusterEvent> Drop for Subscription<T> {
    fn drop(&mut self) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut listeners = state.listeners.lock().unwrap();
        if self.bulk {
            listeners.bulk.retain(|(id, _)| *id != self.id);
        } else {
            listeners.single.retain(|(id, _)| *id != self.id);
        }
    }
}
