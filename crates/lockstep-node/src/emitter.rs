//! Emitter role: admits repeaters, then drives the per-frame
//! wait/emit cycle.
//!
//! Steady state alternates two stages. WaitOnRepeatersNextFrame blocks
//! (cooperative poll) until every repeater still using network sync has
//! signalled readiness for the frame; readiness signals are consumed by
//! a pre-processing hook on the receive task, which is why the
//! waiting-on mask lives behind a lock. EmitLastFrameData then pushes
//! the frame blob through the splitter. With delayed repeaters the blob
//! produced during frame N is transmitted while processing frame N+1,
//! and nothing is sent on the very first frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lockstep_core::config::{ClusterConfig, SurveyedRepeater, TimeoutConfig};
use lockstep_core::wire::{
    EmitterWaitingToStartFrame, Message, MessageType, PropagateQuit, RepeaterRegistered,
    SurveyRepeaters,
};
use lockstep_core::{ClusterTopology, Error, NodeId, NodeIdBitVec, Result};
use lockstep_net::agent::{pre_process_priority, try_receive, NetworkAgent, PreProcess};
use lockstep_net::{FrameDataSplitter, PreProcessorHandle};

use crate::node::{transition, FrameStatus, RoleState, POLL_SLICE, WAITING_BROADCAST_INTERVAL};
use crate::registry::CustomDataRegistry;

/// Emitter role states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    Idle,
    WaitingForAllClients,
    SteadyState,
    ProcessingQuit,
    Exited,
}

impl RoleState for EmitterState {
    fn enter_state(self, previous: EmitterState) {
        debug_assert!(
            previous.may_transition_to(self),
            "illegal emitter transition {previous:?} -> {self:?}"
        );
    }

    fn exit_state(self) {}
}

impl EmitterState {
    /// Explicit transition table.
    fn may_transition_to(self, next: EmitterState) -> bool {
        use EmitterState::*;
        matches!(
            (self, next),
            (Idle, WaitingForAllClients)
                | (Idle, SteadyState)
                | (WaitingForAllClients, SteadyState)
                | (Idle, ProcessingQuit)
                | (WaitingForAllClients, ProcessingQuit)
                | (SteadyState, ProcessingQuit)
                | (ProcessingQuit, Exited)
        )
    }
}

/// Waiting-on bookkeeping, shared with the receive-task hook.
struct WaitState {
    /// Frame the emitter currently waits on. Readiness signals for any
    /// other frame are dropped.
    frame_index: u64,
    /// Repeaters whose readiness signal is still outstanding.
    mask: NodeIdBitVec,
    /// Repeaters expected by the current topology.
    expected: NodeIdBitVec,
    /// Repeaters that switched to hardware sync; never waited on again.
    network_sync_off: NodeIdBitVec,
}

struct EmitterShared {
    wait: Mutex<WaitState>,
    quit_acks: Mutex<NodeIdBitVec>,
    quit_received: AtomicBool,
}

/// The emitter node. Owned and ticked by the application's frame loop.
pub struct EmitterNode {
    node_id: NodeId,
    agent: Arc<dyn NetworkAgent>,
    registry: Arc<CustomDataRegistry>,
    splitter: FrameDataSplitter,
    timeouts: TimeoutConfig,
    delayed_repeaters: bool,
    state: EmitterState,
    frame_index: u64,
    pending_delayed: Option<(u64, lockstep_net::FrameDataBuffer)>,
    /// Greeting-skip: the first transmission goes out without waiting
    /// for readiness signals.
    skip_next_wait: bool,
    shared: Arc<EmitterShared>,
    _control_hook: PreProcessorHandle,
}

impl EmitterNode {
    pub fn new(config: &ClusterConfig, agent: Arc<dyn NetworkAgent>) -> Result<Self> {
        let splitter = FrameDataSplitter::new(agent.clone(), config.sync.retransmit_history)?;
        let expected = config.topology.repeater_set();

        let shared = Arc::new(EmitterShared {
            wait: Mutex::new(WaitState {
                frame_index: config.sync.first_frame_index,
                mask: NodeIdBitVec::empty(),
                expected,
                network_sync_off: NodeIdBitVec::empty(),
            }),
            quit_acks: Mutex::new(NodeIdBitVec::empty()),
            quit_received: AtomicBool::new(false),
        });

        let hook_shared = shared.clone();
        let control_hook = agent.add_pre_processor(
            pre_process_priority::ACK_GATHERING,
            Box::new(move |message| match message {
                Message::RepeaterWaitingToStartFrame(h) => {
                    let mut wait = hook_shared.wait.lock().unwrap();
                    let frame_index = h.frame_index;
                    if frame_index == wait.frame_index && wait.expected.contains(h.node_id) {
                        wait.mask.clear(h.node_id);
                        if h.will_use_network_sync_on_next_frame == 0 {
                            wait.network_sync_off.set(h.node_id);
                            tracing::info!(
                                node_id = h.node_id,
                                "repeater switched to hardware sync"
                            );
                        }
                    } else {
                        tracing::trace!(
                            frame_index,
                            node_id = h.node_id,
                            waiting_for = wait.frame_index,
                            "dropping readiness signal for another frame"
                        );
                    }
                    PreProcess::Stop
                }
                Message::QuitReceived(h) => {
                    hook_shared.quit_acks.lock().unwrap().set(h.node_id);
                    PreProcess::Stop
                }
                Message::PropagateQuit(_) => {
                    hook_shared.quit_received.store(true, Ordering::Release);
                    PreProcess::Stop
                }
                other => PreProcess::Continue(other),
            }),
        );

        let mut node = Self {
            node_id: config.node_id,
            agent,
            registry: CustomDataRegistry::new(),
            splitter,
            timeouts: config.timeouts.clone(),
            delayed_repeaters: config.sync.repeaters_delayed,
            state: EmitterState::Idle,
            frame_index: config.sync.first_frame_index,
            pending_delayed: None,
            skip_next_wait: false,
            shared,
            _control_hook: control_hook,
        };

        if !config.sync.surveyed_repeaters.is_empty() {
            node.seed_from_survey(&config.sync.surveyed_repeaters);
        }
        Ok(node)
    }

    /// Registry the frame-state providers (event buses included) attach
    /// to.
    pub fn registry(&self) -> Arc<CustomDataRegistry> {
        self.registry.clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> EmitterState {
        self.state
    }

    pub fn quit_received(&self) -> bool {
        self.shared.quit_received.load(Ordering::Acquire)
    }

    /// Greeting-skip: survey answers already told us which repeaters
    /// exist and which still want network sync, so the handshake is
    /// unnecessary and the first frame goes out unconditionally.
    fn seed_from_survey(&mut self, surveyed: &[SurveyedRepeater]) {
        let mut wait = self.shared.wait.lock().unwrap();
        wait.expected = NodeIdBitVec::from_node_ids(surveyed.iter().map(|s| s.node_id));
        wait.network_sync_off = NodeIdBitVec::from_node_ids(
            surveyed
                .iter()
                .filter(|s| !s.still_use_network_sync)
                .map(|s| s.node_id),
        );
        drop(wait);
        self.skip_next_wait = true;
        transition("emitter", &mut self.state, EmitterState::SteadyState);
        tracing::info!(count = surveyed.len(), "greeting skipped from survey results");
    }

    /// Replace the expected cluster membership. Takes effect before the
    /// next frame is processed: the emitter stops waiting on departed
    /// nodes immediately.
    pub fn update_topology(&mut self, topology: &ClusterTopology) {
        let expected = topology.repeater_set();
        let mut wait = self.shared.wait.lock().unwrap();
        wait.expected = expected;
        wait.mask.intersect(&expected);
        tracing::info!(expected = %expected, "topology updated");
    }

    /// Process one frame. Blocks (cooperatively) until the frame's data
    /// is transmitted, or until a fatal timeout/protocol error.
    pub async fn do_frame(&mut self) -> Result<FrameStatus> {
        if self.quit_received()
            && !matches!(
                self.state,
                EmitterState::ProcessingQuit | EmitterState::Exited
            )
        {
            transition("emitter", &mut self.state, EmitterState::ProcessingQuit);
        }

        match self.state {
            EmitterState::Idle => {
                transition("emitter", &mut self.state, EmitterState::WaitingForAllClients);
                self.wait_for_all_clients().await?;
                transition("emitter", &mut self.state, EmitterState::SteadyState);
                self.steady_state_frame().await
            }
            EmitterState::WaitingForAllClients => {
                // only reachable if a previous tick failed mid-handshake
                self.wait_for_all_clients().await?;
                transition("emitter", &mut self.state, EmitterState::SteadyState);
                self.steady_state_frame().await
            }
            EmitterState::SteadyState => self.steady_state_frame().await,
            EmitterState::ProcessingQuit | EmitterState::Exited => Ok(FrameStatus {
                frame_index: self.frame_index,
                quit_received: true,
            }),
        }
    }

    /// Finish the tick. The next `do_frame` processes the following
    /// frame index.
    pub fn conclude_frame(&mut self) {
        self.frame_index += 1;
    }

    /// Ask the whole cluster to shut down: broadcast PropagateQuit and
    /// collect acknowledgements until every expected repeater answered
    /// or the communication window closed (missing acks are logged, not
    /// fatal; the cluster is going down either way).
    pub async fn signal_quit(&mut self) -> Result<()> {
        if self.state == EmitterState::Exited {
            return Ok(());
        }
        if self.state != EmitterState::ProcessingQuit {
            transition("emitter", &mut self.state, EmitterState::ProcessingQuit);
        }
        let expected = self.shared.wait.lock().unwrap().expected;
        let deadline = Instant::now() + self.timeouts.communication;
        let mut last_send = None::<Instant>;

        loop {
            let mut missing = expected;
            {
                let acks = self.shared.quit_acks.lock().unwrap();
                for node_id in acks.iter() {
                    missing.clear(node_id);
                }
            }
            if missing.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(missing = %missing, "quit acknowledgements missing at shutdown");
                break;
            }
            if last_send.map_or(true, |at| at.elapsed() >= WAITING_BROADCAST_INTERVAL) {
                self.agent.send(
                    MessageType::PropagateQuit,
                    zerocopy::AsBytes::as_bytes(&PropagateQuit { padding: 0 }),
                    &[],
                )?;
                last_send = Some(Instant::now());
            }
            let _ = try_receive(self.agent.as_ref(), POLL_SLICE).await;
        }
        transition("emitter", &mut self.state, EmitterState::Exited);
        Ok(())
    }

    /// Collect registrations until every expected repeater is admitted.
    async fn wait_for_all_clients(&mut self) -> Result<()> {
        let expected = self.shared.wait.lock().unwrap().expected;
        let mut registered = NodeIdBitVec::empty();
        let started = Instant::now();

        tracing::info!(expected = %expected, "waiting for repeaters to register");
        loop {
            let mut missing = expected;
            for node_id in registered.iter() {
                missing.clear(node_id);
            }
            if missing.is_empty() {
                tracing::info!(count = registered.len(), "all repeaters registered");
                return Ok(());
            }
            if self.agent.is_stopped() {
                return Err(Error::AgentStopped);
            }
            if started.elapsed() > self.timeouts.handshake {
                return Err(Error::Timeout {
                    waiting_for: "repeater registration",
                    elapsed: started.elapsed(),
                });
            }

            match try_receive(self.agent.as_ref(), POLL_SLICE).await {
                Some(Message::RegisteringWithEmitter(h)) => {
                    let accepted = expected.contains(h.node_id);
                    if !accepted {
                        tracing::warn!(node_id = h.node_id, "rejecting unexpected registration");
                    }
                    self.answer_registration(h.node_id, h.ip_address_bytes, accepted)?;
                    if accepted {
                        registered.set(h.node_id);
                    }
                }
                Some(other) => {
                    tracing::trace!(message_type = ?other.message_type(), "ignored during handshake");
                }
                None => {}
            }
        }
    }

    fn answer_registration(
        &self,
        node_id: NodeId,
        ip_address_bytes: [u8; 4],
        accepted: bool,
    ) -> Result<()> {
        let answer = RepeaterRegistered {
            node_id,
            ip_address_bytes,
            accepted: accepted as u8,
        };
        self.agent.send(
            MessageType::RepeaterRegistered,
            zerocopy::AsBytes::as_bytes(&answer),
            &[],
        )
    }

    /// One steady-state tick: wait for readiness, then emit.
    async fn steady_state_frame(&mut self) -> Result<FrameStatus> {
        if self.delayed_repeaters {
            if let Some((pending_index, buffer)) = self.pending_delayed.take() {
                self.wait_unless_skipped(pending_index).await?;
                self.splitter.send_frame_data(pending_index, buffer)?;
            }
            // capture this frame's state; it leaves during the next tick
            let mut buffer = self.splitter.get_new_frame_buffer();
            self.registry.write_frame(&mut buffer);
            self.pending_delayed = Some((self.frame_index, buffer));
        } else {
            self.wait_unless_skipped(self.frame_index).await?;
            // capture after the wait so everything published up to the
            // sync point rides this frame
            let mut buffer = self.splitter.get_new_frame_buffer();
            self.registry.write_frame(&mut buffer);
            self.splitter.send_frame_data(self.frame_index, buffer)?;
        }

        Ok(FrameStatus {
            frame_index: self.frame_index,
            quit_received: self.quit_received(),
        })
    }

    async fn wait_unless_skipped(&mut self, frame_index: u64) -> Result<()> {
        if self.skip_next_wait {
            self.skip_next_wait = false;
            Ok(())
        } else {
            self.wait_on_repeaters(frame_index).await
        }
    }

    /// Stage WaitOnRepeatersNextFrame: block until the waiting-on mask
    /// is fully cleared by incoming readiness signals, re-broadcasting
    /// the mask so repeaters can detect lost signals.
    async fn wait_on_repeaters(&mut self, frame_index: u64) -> Result<()> {
        {
            let mut wait = self.shared.wait.lock().unwrap();
            wait.frame_index = frame_index;
            let mut mask = wait.expected;
            for node_id in wait.network_sync_off.iter() {
                mask.clear(node_id);
            }
            wait.mask = mask;
        }

        let started = Instant::now();
        let mut last_broadcast = None::<Instant>;
        loop {
            if self.quit_received() {
                return Ok(());
            }
            let mask = {
                let wait = self.shared.wait.lock().unwrap();
                // the hook only ever clears bits; a topology update may
                // also shrink the mask under us, which is the point
                wait.mask
            };
            if mask.is_empty() {
                return Ok(());
            }
            if self.agent.is_stopped() {
                return Err(Error::AgentStopped);
            }
            if started.elapsed() > self.timeouts.communication {
                tracing::error!(
                    frame_index,
                    still_waiting_on = %mask,
                    "repeaters never signalled readiness"
                );
                return Err(Error::Timeout {
                    waiting_for: "repeater readiness",
                    elapsed: started.elapsed(),
                });
            }

            if last_broadcast.map_or(true, |at| at.elapsed() >= WAITING_BROADCAST_INTERVAL) {
                let header = EmitterWaitingToStartFrame {
                    frame_index,
                    waiting_on: mask.to_words(),
                };
                self.agent.send(
                    MessageType::EmitterWaitingToStartFrame,
                    zerocopy::AsBytes::as_bytes(&header),
                    &[],
                )?;
                last_broadcast = Some(Instant::now());
            }

            match try_receive(self.agent.as_ref(), POLL_SLICE).await {
                // a repeater still re-registering lost our acceptance
                // answer; repeat it so it can move on. Unknown nodes
                // get the rejection they would have gotten during the
                // handshake.
                Some(Message::RegisteringWithEmitter(h)) => {
                    let expected = self.shared.wait.lock().unwrap().expected;
                    let accepted = expected.contains(h.node_id);
                    if accepted {
                        tracing::debug!(node_id = h.node_id, "re-answering lost registration");
                    } else {
                        tracing::warn!(node_id = h.node_id, "rejecting unexpected registration");
                    }
                    self.answer_registration(h.node_id, h.ip_address_bytes, accepted)?;
                }
                Some(other) => {
                    tracing::trace!(message_type = ?other.message_type(), "ignored while waiting");
                }
                None => {}
            }
        }
    }
}

/// Out-of-band repeater survey: broadcast SurveyRepeaters and collect
/// answers. The result can be fed into `ClusterConfig` to enable the
/// greeting-skip fast path (an emitter taking over an already-running
/// cluster does exactly this).
pub async fn survey_repeaters(
    agent: &dyn NetworkAgent,
    expected_count: usize,
    timeout: Duration,
) -> Vec<SurveyedRepeater> {
    let deadline = Instant::now() + timeout;
    let mut answers: Vec<SurveyedRepeater> = Vec::new();
    let mut last_send = None::<Instant>;

    while answers.len() < expected_count && Instant::now() < deadline {
        if last_send.map_or(true, |at| at.elapsed() >= Duration::from_millis(50)) {
            let survey = SurveyRepeaters { padding: 0 };
            if let Err(e) = agent.send(
                MessageType::SurveyRepeaters,
                zerocopy::AsBytes::as_bytes(&survey),
                &[],
            ) {
                tracing::warn!(error = %e, "survey broadcast failed");
            }
            last_send = Some(Instant::now());
        }

        match try_receive(agent, POLL_SLICE).await {
            Some(Message::RepeatersSurveyAnswer(h)) => {
                if !answers.iter().any(|a| a.node_id == h.node_id) {
                    answers.push(SurveyedRepeater {
                        node_id: h.node_id,
                        ip_address_bytes: h.ip_address_bytes,
                        last_received_frame_index: h.last_received_frame_index,
                        still_use_network_sync: h.still_use_network_sync != 0,
                    });
                }
            }
            Some(other) => {
                tracing::trace!(message_type = ?other.message_type(), "ignored during survey");
            }
            None => {}
        }
    }
    answers
}
