//! Shared frame-loop plumbing for both node roles.
//!
//! A node is driven from outside: the owner calls `do_frame` and then
//! `conclude_frame` once per render tick. Waits inside `do_frame` are
//! cooperative poll loops bounded by the configured timeouts; nothing
//! in here spins without yielding.

use std::time::Duration;

/// Result of one `do_frame` tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStatus {
    /// Frame the node just processed.
    pub frame_index: u64,
    /// A PropagateQuit was observed. The owner should stop ticking the
    /// node after concluding this frame.
    pub quit_received: bool,
}

/// Granularity of the cooperative wait loops. Each slice the loop
/// re-checks its exit condition and the quit flag.
pub(crate) const POLL_SLICE: Duration = Duration::from_millis(2);

/// How often the emitter re-broadcasts its waiting-on mask while
/// blocked on repeaters. Repeaters use the broadcast to detect that
/// their readiness signal was lost.
pub(crate) const WAITING_BROADCAST_INTERVAL: Duration = Duration::from_millis(5);

/// Registration resends switch to this fraction of the configured
/// interval once frame data shows the emitter believes we are already
/// registered (our acceptance answer was lost).
pub(crate) const ACCELERATED_REGISTRATION_DIVISOR: u32 = 4;

/// A role state with enter/exit hooks. Hooks are pure functions of the
/// old and new state; every side effect of a transition happens in the
/// frame loop that requested it.
pub(crate) trait RoleState: Copy + std::fmt::Debug {
    fn enter_state(self, previous: Self);
    fn exit_state(self);
}

/// Perform a state transition: exit hook of the old state, enter hook
/// of the new one, then the assignment.
pub(crate) fn transition<S: RoleState>(role: &'static str, state: &mut S, next: S) {
    state.exit_state();
    next.enter_state(*state);
    tracing::debug!(role, from = ?*state, to = ?next, "state transition");
    *state = next;
}
