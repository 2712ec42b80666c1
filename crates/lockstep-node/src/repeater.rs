//! Repeater role: registers with the emitter, then consumes one frame
//! blob per tick and acknowledges readiness for the next.
//!
//! Registration re-sends until the emitter answers. Once registered the
//! repeater attaches the assembler; from then on every tick sends a
//! readiness signal, waits for the frame's data, dispatches the blob
//! through the custom-data registry, and returns to the owner.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lockstep_core::config::{ClusterConfig, TimeoutConfig};
use lockstep_core::wire::{
    Message, MessageType, QuitReceived, RegisteringWithEmitter, RepeaterWaitingToStartFrame,
    RepeatersSurveyAnswer,
};
use lockstep_core::{ClusterTopology, Error, NodeId, NodeIdBitVec, Result};
use lockstep_net::agent::{pre_process_priority, try_receive, NetworkAgent, PreProcess};
use lockstep_net::{FrameDataAssembler, PreProcessorHandle};

use crate::node::{
    transition, FrameStatus, RoleState, ACCELERATED_REGISTRATION_DIVISOR, POLL_SLICE,
};
use crate::registry::CustomDataRegistry;

/// Repeater role states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeaterState {
    Idle,
    RegisteringWithEmitter,
    RepeatFrame,
    ProcessingQuit,
    Exited,
}

impl RoleState for RepeaterState {
    fn enter_state(self, previous: RepeaterState) {
        debug_assert!(
            previous.may_transition_to(self),
            "illegal repeater transition {previous:?} -> {self:?}"
        );
    }

    fn exit_state(self) {}
}

impl RepeaterState {
    /// Explicit transition table.
    fn may_transition_to(self, next: RepeaterState) -> bool {
        use RepeaterState::*;
        matches!(
            (self, next),
            (Idle, RegisteringWithEmitter)
                | (Idle, RepeatFrame)
                | (RegisteringWithEmitter, RepeatFrame)
                | (Idle, ProcessingQuit)
                | (RegisteringWithEmitter, ProcessingQuit)
                | (RepeatFrame, ProcessingQuit)
                | (ProcessingQuit, Exited)
        )
    }
}

/// Flags shared with the receive-task hook that answers surveys and
/// quit propagation.
struct RepeaterShared {
    quit_received: AtomicBool,
    /// Highest frame index fully received, for survey answers.
    /// u64::MAX until the first frame lands.
    last_received_frame: AtomicU64,
    use_network_sync: AtomicBool,
}

/// The repeater node. Owned and ticked by the application's frame loop.
pub struct RepeaterNode {
    node_id: NodeId,
    ip_address_bytes: [u8; 4],
    agent: Arc<dyn NetworkAgent>,
    registry: Arc<CustomDataRegistry>,
    timeouts: TimeoutConfig,
    first_frame_index: u64,
    state: RepeaterState,
    frame_index: u64,
    assembler: Option<FrameDataAssembler>,
    /// Set by `use_hardware_sync_from_next_frame`; the next readiness
    /// signal carries it to the emitter.
    switch_to_hardware_sync: AtomicBool,
    shared: Arc<RepeaterShared>,
    _control_hook: PreProcessorHandle,
}

impl RepeaterNode {
    pub fn new(config: &ClusterConfig, agent: Arc<dyn NetworkAgent>) -> Self {
        let node_id = config.node_id;
        let ip_address_bytes = config.network.adapter_address.octets();

        let shared = Arc::new(RepeaterShared {
            quit_received: AtomicBool::new(false),
            last_received_frame: AtomicU64::new(u64::MAX),
            use_network_sync: AtomicBool::new(true),
        });

        let hook_shared = shared.clone();
        let hook_agent = agent.clone();
        let control_hook = agent.add_pre_processor(
            pre_process_priority::ACK_GATHERING,
            Box::new(move |message| match message {
                Message::PropagateQuit(_) => {
                    hook_shared.quit_received.store(true, Ordering::Release);
                    let ack = QuitReceived { node_id };
                    if let Err(e) = hook_agent.send(
                        MessageType::QuitReceived,
                        zerocopy::AsBytes::as_bytes(&ack),
                        &[],
                    ) {
                        tracing::warn!(error = %e, "quit acknowledgement failed to send");
                    }
                    PreProcess::Stop
                }
                Message::SurveyRepeaters(_) => {
                    let answer = RepeatersSurveyAnswer {
                        node_id,
                        ip_address_bytes,
                        last_received_frame_index: hook_shared
                            .last_received_frame
                            .load(Ordering::Acquire),
                        still_use_network_sync: hook_shared.use_network_sync.load(Ordering::Acquire)
                            as u8,
                    };
                    if let Err(e) = hook_agent.send(
                        MessageType::RepeatersSurveyAnswer,
                        zerocopy::AsBytes::as_bytes(&answer),
                        &[],
                    ) {
                        tracing::warn!(error = %e, "survey answer failed to send");
                    }
                    PreProcess::Stop
                }
                other => PreProcess::Continue(other),
            }),
        );

        let mut node = Self {
            node_id,
            ip_address_bytes,
            agent,
            registry: CustomDataRegistry::new(),
            timeouts: config.timeouts.clone(),
            first_frame_index: config.sync.first_frame_index,
            state: RepeaterState::Idle,
            frame_index: config.sync.first_frame_index,
            assembler: None,
            switch_to_hardware_sync: AtomicBool::new(false),
            shared,
            _control_hook: control_hook,
        };

        // Greeting-skip: a survey already told the emitter about us, so
        // the registration exchange never happens.
        if config
            .sync
            .surveyed_repeaters
            .iter()
            .any(|s| s.node_id == node_id)
        {
            node.attach_assembler();
            transition("repeater", &mut node.state, RepeaterState::RepeatFrame);
            tracing::info!(node_id, "greeting skipped, repeating immediately");
        }

        node
    }

    /// Registry the frame-data consumers (event buses included) attach
    /// to.
    pub fn registry(&self) -> Arc<CustomDataRegistry> {
        self.registry.clone()
    }

    pub fn state(&self) -> RepeaterState {
        self.state
    }

    pub fn quit_received(&self) -> bool {
        self.shared.quit_received.load(Ordering::Acquire)
    }

    /// From the next frame on, rely on an external synchronization
    /// signal instead of the network wait. The emitter stops waiting on
    /// this node once the switch is announced.
    pub fn use_hardware_sync_from_next_frame(&self) {
        self.switch_to_hardware_sync.store(true, Ordering::Release);
    }

    /// Kept for interface parity with the emitter; a repeater derives
    /// everything it needs from the messages it receives.
    pub fn update_topology(&mut self, _topology: &ClusterTopology) {}

    /// Process one frame: register if needed, wait for the frame's
    /// data, dispatch it, signal readiness for the next.
    pub async fn do_frame(&mut self) -> Result<FrameStatus> {
        if self.quit_received()
            && !matches!(
                self.state,
                RepeaterState::ProcessingQuit | RepeaterState::Exited
            )
        {
            transition("repeater", &mut self.state, RepeaterState::ProcessingQuit);
        }

        match self.state {
            RepeaterState::Idle => {
                transition(
                    "repeater",
                    &mut self.state,
                    RepeaterState::RegisteringWithEmitter,
                );
                self.register_with_emitter().await?;
                self.attach_assembler();
                transition("repeater", &mut self.state, RepeaterState::RepeatFrame);
                self.repeat_frame().await
            }
            RepeaterState::RegisteringWithEmitter => {
                self.register_with_emitter().await?;
                self.attach_assembler();
                transition("repeater", &mut self.state, RepeaterState::RepeatFrame);
                self.repeat_frame().await
            }
            RepeaterState::RepeatFrame => self.repeat_frame().await,
            RepeaterState::ProcessingQuit | RepeaterState::Exited => Ok(FrameStatus {
                frame_index: self.frame_index,
                quit_received: true,
            }),
        }
    }

    /// Finish the tick. The next `do_frame` expects the following
    /// frame.
    pub fn conclude_frame(&mut self) {
        self.frame_index += 1;
    }

    fn attach_assembler(&mut self) {
        if self.assembler.is_none() {
            self.assembler = Some(FrameDataAssembler::new(
                self.agent.clone(),
                self.node_id,
                self.first_frame_index,
            ));
        }
    }

    /// Re-send RegisteringWithEmitter until the emitter answers.
    ///
    /// Frame data showing up here means trouble: for the first frame
    /// index the emitter simply never saw our registration answered
    /// (lost datagram) and we re-send faster; for any later frame we
    /// have already missed state and cannot recover consistently.
    async fn register_with_emitter(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut resend_interval = self.timeouts.registration_resend_interval;
        let mut last_send = None::<Instant>;

        loop {
            if self.quit_received() {
                return Ok(());
            }
            if self.agent.is_stopped() {
                return Err(Error::AgentStopped);
            }
            if started.elapsed() > self.timeouts.handshake {
                return Err(Error::Timeout {
                    waiting_for: "registration answer",
                    elapsed: started.elapsed(),
                });
            }

            if last_send.map_or(true, |at| at.elapsed() >= resend_interval) {
                let registration = RegisteringWithEmitter {
                    node_id: self.node_id,
                    ip_address_bytes: self.ip_address_bytes,
                };
                self.agent.send(
                    MessageType::RegisteringWithEmitter,
                    zerocopy::AsBytes::as_bytes(&registration),
                    &[],
                )?;
                last_send = Some(Instant::now());
            }

            match try_receive(self.agent.as_ref(), POLL_SLICE).await {
                Some(Message::RepeaterRegistered(h)) => {
                    if h.node_id != self.node_id || h.ip_address_bytes != self.ip_address_bytes {
                        tracing::trace!(
                            node_id = h.node_id,
                            "registration answer for another repeater, ignoring"
                        );
                        continue;
                    }
                    if h.accepted == 0 {
                        return Err(Error::RegistrationRejected {
                            node_id: self.node_id,
                        });
                    }
                    tracing::info!(node_id = self.node_id, "registered with emitter");
                    return Ok(());
                }
                Some(Message::FrameData(h, _)) => {
                    let received_frame_index = h.frame_index;
                    if received_frame_index == self.first_frame_index {
                        // our acceptance answer was lost; the emitter
                        // is already emitting, so press the handshake
                        let accelerated = self.timeouts.registration_resend_interval
                            / ACCELERATED_REGISTRATION_DIVISOR;
                        if resend_interval != accelerated {
                            resend_interval = accelerated;
                            tracing::warn!(
                                "frame data before registration completed, accelerating re-registration"
                            );
                        }
                    } else {
                        return Err(Error::MissedFrames {
                            received_frame_index,
                            expected_first_frame_index: self.first_frame_index,
                        });
                    }
                }
                Some(other) => {
                    tracing::trace!(message_type = ?other.message_type(), "ignored during registration");
                }
                None => {}
            }
        }
    }

    /// Steady state: announce readiness, await the frame blob, dispatch
    /// it.
    async fn repeat_frame(&mut self) -> Result<FrameStatus> {
        let use_network_sync = self.shared.use_network_sync.load(Ordering::Acquire);
        if use_network_sync {
            self.send_readiness_signal()?;
        }

        let assembler = self
            .assembler
            .as_ref()
            .expect("assembler attached on entering RepeatFrame");

        let started = Instant::now();
        loop {
            // a frame that already arrived is delivered even when quit
            // came in right behind it
            if let Some(frame) = assembler.next_frame(POLL_SLICE).await {
                self.shared
                    .last_received_frame
                    .store(frame.frame_index, Ordering::Release);
                self.registry.dispatch_frame(&frame.data);
                return Ok(FrameStatus {
                    frame_index: frame.frame_index,
                    quit_received: false,
                });
            }
            if self.quit_received() {
                transition("repeater", &mut self.state, RepeaterState::ProcessingQuit);
                return Ok(FrameStatus {
                    frame_index: self.frame_index,
                    quit_received: true,
                });
            }
            if self.agent.is_stopped() {
                return Err(Error::AgentStopped);
            }
            if started.elapsed() > self.timeouts.communication {
                return Err(Error::Timeout {
                    waiting_for: "frame data",
                    elapsed: started.elapsed(),
                });
            }
            assembler.nudge();
            self.drain_control_messages(use_network_sync)?;
        }
    }

    /// Readiness for the current frame, with the network-sync flag for
    /// the next one.
    fn send_readiness_signal(&self) -> Result<()> {
        let will_use_network_sync = !self.switch_to_hardware_sync.load(Ordering::Acquire);
        let signal = RepeaterWaitingToStartFrame {
            frame_index: self.frame_index,
            node_id: self.node_id,
            will_use_network_sync_on_next_frame: will_use_network_sync as u8,
        };
        self.agent.send(
            MessageType::RepeaterWaitingToStartFrame,
            zerocopy::AsBytes::as_bytes(&signal),
            &[],
        )?;
        if !will_use_network_sync {
            self.shared
                .use_network_sync
                .store(false, Ordering::Release);
            tracing::info!(node_id = self.node_id, "switching to hardware sync");
        }
        Ok(())
    }

    /// Handle control traffic that queued up while waiting on frame
    /// data. An emitter broadcast still showing our bit means our
    /// readiness signal was lost: send it again.
    fn drain_control_messages(&self, use_network_sync: bool) -> Result<()> {
        loop {
            let Some(message) = self.agent.shared().try_pop() else {
                return Ok(());
            };
            match message {
                Message::EmitterWaitingToStartFrame(h) => {
                    let frame_index = h.frame_index;
                    let waiting_on = NodeIdBitVec::from_words(h.waiting_on);
                    if use_network_sync
                        && frame_index == self.frame_index
                        && waiting_on.contains(self.node_id)
                    {
                        tracing::debug!(
                            frame_index,
                            "emitter still waiting on us, re-sending readiness"
                        );
                        self.send_readiness_signal()?;
                    }
                }
                other => {
                    tracing::trace!(message_type = ?other.message_type(), "ignored while repeating");
                }
            }
        }
    }
}
