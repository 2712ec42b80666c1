//! Failure semantics and quit propagation: rejected registrations,
//! handshake timeouts, missed-frame detection, and the PropagateQuit /
//! QuitReceived exchange.

use std::time::Duration;

use anyhow::Result;
use lockstep_core::wire::{FrameData, MessageType};
use lockstep_core::Error;
use lockstep_net::testing::LoopbackHub;
use lockstep_net::NetworkAgent;
use lockstep_node::{EmitterNode, RepeaterNode};
use zerocopy::AsBytes;

use crate::{init_tracing, provide_scene_state, test_config, MAX_MESSAGE_SIZE};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unexpected_repeater_is_rejected() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    // the emitter only expects node 1; node 2 must be turned away
    let emitter_agent = hub.attach();
    let mut emitter = EmitterNode::new(&test_config(0, &[1]), emitter_agent)?;
    let emitter_registry = emitter.registry();
    let _provider = provide_scene_state(&emitter_registry, 0);

    let accepted_agent = hub.attach();
    let mut accepted = RepeaterNode::new(&test_config(1, &[]), accepted_agent);
    let accepted_task = tokio::spawn(async move {
        let status = accepted.do_frame().await?;
        assert_eq!(status.frame_index, 0);
        anyhow::Ok(())
    });

    let rejected_agent = hub.attach();
    let mut rejected = RepeaterNode::new(&test_config(2, &[]), rejected_agent);
    let rejected_task = tokio::spawn(async move { rejected.do_frame().await });

    let status = emitter.do_frame().await?;
    assert_eq!(status.frame_index, 0);
    accepted_task.await??;

    match rejected_task.await? {
        Err(Error::RegistrationRejected { node_id: 2 }) => {}
        other => panic!("expected RegistrationRejected, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_timeout_is_fatal_and_distinct() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    let mut config = test_config(0, &[1]);
    config.timeouts.handshake = Duration::from_millis(150);
    let mut emitter = EmitterNode::new(&config, hub.attach())?;

    match emitter.do_frame().await {
        Err(Error::Timeout { waiting_for, .. }) => {
            assert_eq!(waiting_for, "repeater registration");
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frame_data_past_the_first_frame_raises_missed_frames() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    let repeater_agent = hub.attach();
    let mut repeater = RepeaterNode::new(&test_config(1, &[]), repeater_agent);
    let repeater_task = tokio::spawn(async move { repeater.do_frame().await });

    // no emitter exists; inject frame 3 data directly while the
    // repeater is still registering
    tokio::time::sleep(Duration::from_millis(50)).await;
    let header = FrameData {
        frame_index: 3,
        data_length: 4,
        datagram_index: 0,
        datagram_data_offset: 0,
    };
    hub.attach()
        .send(MessageType::FrameData, header.as_bytes(), b"data")?;

    match repeater_task.await? {
        Err(Error::MissedFrames {
            received_frame_index: 3,
            expected_first_frame_index: 0,
        }) => {}
        other => panic!("expected MissedFrames, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quit_propagates_and_is_acknowledged() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    let emitter_agent = hub.attach();
    let mut emitter = EmitterNode::new(&test_config(0, &[1, 2]), emitter_agent)?;
    let emitter_registry = emitter.registry();
    let _provider = provide_scene_state(&emitter_registry, 0);

    let mut repeater_tasks = Vec::new();
    for node_id in [1u8, 2] {
        let agent = hub.attach();
        let mut repeater = RepeaterNode::new(&test_config(node_id, &[]), agent);
        repeater_tasks.push(tokio::spawn(async move {
            // frame 0 completes normally; the next tick observes quit
            let status = repeater.do_frame().await?;
            assert!(!status.quit_received);
            repeater.conclude_frame();

            let status = repeater.do_frame().await?;
            assert!(status.quit_received);
            assert!(repeater.quit_received());
            anyhow::Ok(())
        }));
    }

    let status = emitter.do_frame().await?;
    assert!(!status.quit_received);
    emitter.conclude_frame();

    emitter.signal_quit().await?;
    for task in repeater_tasks {
        task.await??;
    }
    Ok(())
}
