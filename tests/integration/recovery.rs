//! Loss recovery: dropped frame datagrams are retransmitted from the
//! emitter's history ring, and a lost registration answer is healed by
//! the accelerated re-registration path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use lockstep_core::wire::MessageType;
use lockstep_net::testing::LoopbackHub;
use lockstep_node::{EmitterNode, RepeaterNode};

use crate::{
    init_tracing, provide_scene_state, record_scene_state, scene_state_bytes, test_config,
    MAX_MESSAGE_SIZE,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_datagrams_are_retransmitted() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    // lose the second and fifth FrameData datagram crossing the wire;
    // every frame spans several datagrams at this message size
    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = dropped.clone();
    hub.set_drop_filter(Some(Box::new(move |message_type, _| {
        if message_type != MessageType::FrameData {
            return false;
        }
        let seen = counter.fetch_add(1, Ordering::Relaxed);
        seen == 1 || seen == 4
    })));

    let emitter_agent = hub.attach();
    let mut emitter = EmitterNode::new(&test_config(0, &[1]), emitter_agent)?;
    let emitter_registry = emitter.registry();
    let _provider = provide_scene_state(&emitter_registry, 0);

    let repeater_agent = hub.attach();
    let mut repeater = RepeaterNode::new(&test_config(1, &[]), repeater_agent);
    let repeater_registry = repeater.registry();
    let (blobs, _blob_guard) = record_scene_state(&repeater_registry);

    let repeater_task = tokio::spawn(async move {
        for expected_frame in 0u64..=2 {
            let status = repeater.do_frame().await?;
            assert_eq!(status.frame_index, expected_frame);
            repeater.conclude_frame();
        }
        anyhow::Ok(())
    });

    for frame_index in 0u64..=2 {
        let status = emitter.do_frame().await?;
        assert_eq!(status.frame_index, frame_index);
        emitter.conclude_frame();
    }
    repeater_task.await??;

    assert!(dropped.load(Ordering::Relaxed) > 4, "filter never saw traffic");
    let blobs = blobs.lock().unwrap();
    assert_eq!(blobs.len(), 3);
    for (frame_index, blob) in blobs.iter().enumerate() {
        assert_eq!(blob, &scene_state_bytes(frame_index as u64), "frame {frame_index}");
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lost_registration_heals_through_accelerated_re_registration() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    // The emitter greeting-skips (it already surveyed the repeater),
    // so frame 0 goes out while the repeater is still registering. The
    // repeater observes first-frame data without being registered,
    // switches to the accelerated registration cadence, and the
    // emitter answers from its steady-state wait loop. Swallowing the
    // first registrations forces several rounds of that.
    let swallowed = Arc::new(AtomicUsize::new(0));
    let counter = swallowed.clone();
    hub.set_drop_filter(Some(Box::new(move |message_type, _| {
        message_type == MessageType::RegisteringWithEmitter
            && counter.fetch_add(1, Ordering::Relaxed) < 2
    })));

    let mut emitter_config = test_config(0, &[1]);
    emitter_config.sync.surveyed_repeaters = vec![lockstep_core::SurveyedRepeater {
        node_id: 1,
        ip_address_bytes: [0, 0, 0, 0],
        last_received_frame_index: u64::MAX,
        still_use_network_sync: true,
    }];
    let emitter_agent = hub.attach();
    let mut emitter = EmitterNode::new(&emitter_config, emitter_agent)?;
    let emitter_registry = emitter.registry();
    let _provider = provide_scene_state(&emitter_registry, 0);

    let repeater_agent = hub.attach();
    let mut repeater = RepeaterNode::new(&test_config(1, &[]), repeater_agent);
    let repeater_registry = repeater.registry();
    let (blobs, _blob_guard) = record_scene_state(&repeater_registry);

    let repeater_task = tokio::spawn(async move {
        for expected_frame in 0u64..=1 {
            let status = repeater.do_frame().await?;
            assert_eq!(status.frame_index, expected_frame);
            repeater.conclude_frame();
        }
        anyhow::Ok(())
    });

    for frame_index in 0u64..=1 {
        let status = emitter.do_frame().await?;
        assert_eq!(status.frame_index, frame_index);
        emitter.conclude_frame();
    }
    repeater_task.await??;

    assert!(swallowed.load(Ordering::Relaxed) >= 2);
    let blobs = blobs.lock().unwrap();
    assert_eq!(blobs.len(), 2);
    assert_eq!(blobs[0], scene_state_bytes(0));
    assert_eq!(blobs[1], scene_state_bytes(1));
    Ok(())
}
