//! Custom frame-data registry.
//!
//! The per-frame state blob is a sequence of tagged sections. Providers
//! registered here write their section(s) when the emitter produces a
//! frame; consumers registered on the repeater side are invoked for
//! every section carrying their tag. Several providers may share a tag:
//! each writes its own section, and each consumer decides from the
//! section contents whether the data is addressed to it (the event bus
//! does exactly that with its type identifier).
//!
//! Registration returns a guard; dropping the guard unregisters. The
//! registry is owned by the node that uses it; there is no process-wide
//! table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use lockstep_net::FrameDataBuffer;

/// Section tag carrying event-bus traffic.
pub const CUSTOM_EVENTS_TAG: i32 = 64;

// Sync because the tables are shared between the frame-loop and
// receive threads; invocation itself is always exclusive (get_mut).
pub type ProviderFn = Box<dyn FnMut(&mut Vec<u8>) + Send + Sync>;
pub type ConsumerFn = Box<dyn FnMut(&[u8]) + Send + Sync>;

struct RegisteredProvider {
    id: u64,
    provider: ProviderFn,
}

struct RegisteredConsumer {
    id: u64,
    consumer: ConsumerFn,
}

#[derive(Default)]
pub struct CustomDataRegistry {
    providers: DashMap<i32, Vec<RegisteredProvider>>,
    consumers: DashMap<i32, Vec<RegisteredConsumer>>,
    next_id: AtomicU64,
}

impl CustomDataRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a section writer invoked once per produced frame.
    pub fn register_provider(
        self: &Arc<Self>,
        tag: i32,
        provider: ProviderFn,
    ) -> RegistrationGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.providers
            .entry(tag)
            .or_default()
            .push(RegisteredProvider { id, provider });
        RegistrationGuard {
            registry: Arc::downgrade(self),
            tag,
            id,
            kind: GuardKind::Provider,
        }
    }

    /// Register a section reader invoked for every received section
    /// with this tag.
    pub fn register_consumer(
        self: &Arc<Self>,
        tag: i32,
        consumer: ConsumerFn,
    ) -> RegistrationGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.consumers
            .entry(tag)
            .or_default()
            .push(RegisteredConsumer { id, consumer });
        RegistrationGuard {
            registry: Arc::downgrade(self),
            tag,
            id,
            kind: GuardKind::Consumer,
        }
    }

    /// Produce one frame blob: every provider writes its section, in
    /// ascending tag order (registration order within a tag).
    pub fn write_frame(&self, buffer: &mut FrameDataBuffer) {
        let mut tags: Vec<i32> = self.providers.iter().map(|entry| *entry.key()).collect();
        tags.sort_unstable();
        for tag in tags {
            if let Some(mut entry) = self.providers.get_mut(&tag) {
                for registered in entry.value_mut().iter_mut() {
                    buffer.store_with(tag, |out| (registered.provider)(out));
                }
            }
        }
    }

    /// Walk a received frame blob and hand each section to the
    /// consumers registered for its tag.
    pub fn dispatch_frame(&self, blob: &[u8]) {
        for (tag, payload) in FrameDataBuffer::sections(blob) {
            match self.consumers.get_mut(&tag) {
                Some(mut entry) => {
                    for registered in entry.value_mut().iter_mut() {
                        (registered.consumer)(payload);
                    }
                }
                None => {
                    tracing::trace!(tag, length = payload.len(), "no consumer for section");
                }
            }
        }
    }
}

enum GuardKind {
    Provider,
    Consumer,
}

/// Scoped registration; dropping it removes the hook.
pub struct RegistrationGuard {
    registry: Weak<CustomDataRegistry>,
    tag: i32,
    id: u64,
    kind: GuardKind,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match self.kind {
            GuardKind::Provider => {
                if let Some(mut entry) = registry.providers.get_mut(&self.tag) {
                    entry.value_mut().retain(|r| r.id != self.id);
                }
            }
            GuardKind::Consumer => {
                if let Some(mut entry) = registry.consumers.get_mut(&self.tag) {
                    entry.value_mut().retain(|r| r.id != self.id);
                }
            }
        }
    }
}
