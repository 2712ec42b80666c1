//! Delayed-repeaters mode: the emitter runs one frame ahead, so frame
//! K's state reaches repeaters while the emitter is processing K+1 and
//! nothing at all is transmitted on the emitter's very first frame.

use std::time::Duration;

use anyhow::Result;
use lockstep_net::testing::LoopbackHub;
use lockstep_node::{EmitterNode, RepeaterNode};

use crate::{
    init_tracing, provide_scene_state, record_scene_state, scene_state_bytes, test_config,
    MAX_MESSAGE_SIZE,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frame_data_lags_the_emitter_by_one_frame() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    let emitter_agent = hub.attach();
    let mut config = test_config(0, &[1]);
    config.sync.repeaters_delayed = true;
    let mut emitter = EmitterNode::new(&config, emitter_agent)?;
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

    // Frame 0: the emitter only captures state; nothing is transmitted.
    let status = emitter.do_frame().await?;
    assert_eq!(status.frame_index, 0);
    emitter.conclude_frame();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        blobs.lock().unwrap().is_empty(),
        "no frame data may be transmitted on the emitter's first frame"
    );

    // Frames 1..=3 each carry the previous frame's state.
    for frame_index in 1u64..=3 {
        let status = emitter.do_frame().await?;
        assert_eq!(status.frame_index, frame_index);
        emitter.conclude_frame();
    }

    repeater_task.await??;

    let blobs = blobs.lock().unwrap();
    assert_eq!(blobs.len(), 3);
    for (frame_index, blob) in blobs.iter().enumerate() {
        assert_eq!(blob, &scene_state_bytes(frame_index as u64), "frame {frame_index}");
    }
    Ok(())
}
