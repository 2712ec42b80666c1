//! Steady-state lockstep scenarios: registration, per-frame wait/emit,
//! the event overlay, topology changes, and the hardware-sync switch.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use lockstep_net::testing::LoopbackHub;
use lockstep_node::{EmitterNode, EventBus, RepeaterNode};
use tokio::task::JoinHandle;

use crate::{
    cluster_topology, init_tracing, provide_scene_state, record_scene_state, scene_state_bytes,
    test_config, SceneEvent, MAX_MESSAGE_SIZE,
};

/// Run a repeater for `frames` ticks, recording received scene-state
/// blobs and events.
fn spawn_repeater(
    hub: &LoopbackHub,
    node_id: u8,
    frames: u64,
    hardware_sync: bool,
) -> (
    JoinHandle<Result<()>>,
    Arc<Mutex<Vec<Vec<u8>>>>,
    Arc<Mutex<Vec<(u64, u32)>>>,
) {
    let agent = hub.attach();
    let mut repeater = RepeaterNode::new(&test_config(node_id, &[]), agent);
    let registry = repeater.registry();
    let (blobs, blob_guard) = record_scene_state(&registry);
    let bus = EventBus::<SceneEvent>::new(&registry);

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_hook = events.clone();
    let subscription = bus.subscribe(move |event| {
        events_hook
            .lock()
            .unwrap()
            .push((event.frame_index, event.channel));
    });

    if hardware_sync {
        repeater.use_hardware_sync_from_next_frame();
    }

    let task = tokio::spawn(async move {
        // keep the registrations alive for the whole run
        let _guards = (blob_guard, subscription, bus);
        for expected_frame in 0..frames {
            let status = repeater.do_frame().await?;
            assert_eq!(status.frame_index, expected_frame);
            assert!(!status.quit_received);
            repeater.conclude_frame();
        }
        anyhow::Ok(())
    });
    (task, blobs, events)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_repeaters_lockstep_with_events_and_topology_change() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    let emitter_agent = hub.attach();
    let mut emitter = EmitterNode::new(&test_config(0, &[1, 2]), emitter_agent)?;
    let emitter_registry = emitter.registry();
    let provider_guard = provide_scene_state(&emitter_registry, 0);
    let emitter_bus = EventBus::<SceneEvent>::new(&emitter_registry);

    // repeater 2 leaves the cluster after frame 2
    let (repeater2_done_tx, repeater2_done_rx) = tokio::sync::oneshot::channel::<()>();

    let (repeater1_task, repeater1_blobs, repeater1_events) = spawn_repeater(&hub, 1, 5, false);
    let (repeater2_task, repeater2_blobs, repeater2_events) = spawn_repeater(&hub, 2, 3, false);

    let departure_signal = tokio::spawn(async move {
        repeater2_task.await.unwrap().unwrap();
        let _ = repeater2_done_tx.send(());
    });

    let emitter_task = tokio::spawn(async move {
        let mut repeater2_done_rx = Some(repeater2_done_rx);
        for frame_index in 0u64..=4 {
            if frame_index == 3 {
                // node 2 is gone; stop expecting it before this frame
                if let Some(rx) = repeater2_done_rx.take() {
                    let _ = rx.await;
                }
                emitter.update_topology(&cluster_topology(&[1]));
            }
            emitter_bus.publish(SceneEvent::new(frame_index, 0));
            emitter_bus.publish(SceneEvent::new(frame_index, 1));
            let status = emitter.do_frame().await?;
            assert_eq!(status.frame_index, frame_index);
            assert!(!status.quit_received);
            emitter.conclude_frame();
        }
        anyhow::Ok(())
    });

    emitter_task.await??;
    repeater1_task.await??;
    departure_signal.await?;
    drop(provider_guard);

    // every repeater reassembled exactly the bytes the emitter produced
    let repeater1_blobs = repeater1_blobs.lock().unwrap();
    assert_eq!(repeater1_blobs.len(), 5);
    for (frame_index, blob) in repeater1_blobs.iter().enumerate() {
        assert_eq!(blob, &scene_state_bytes(frame_index as u64), "frame {frame_index}");
    }
    let repeater2_blobs = repeater2_blobs.lock().unwrap();
    assert_eq!(repeater2_blobs.len(), 3);
    for (frame_index, blob) in repeater2_blobs.iter().enumerate() {
        assert_eq!(blob, &repeater1_blobs[frame_index], "frame {frame_index}");
    }

    // two events per frame, in publish order, values derived from the
    // frame index
    let repeater1_events = repeater1_events.lock().unwrap();
    let expected: Vec<(u64, u32)> = (0u64..=4).flat_map(|f| [(f, 0), (f, 1)]).collect();
    assert_eq!(*repeater1_events, expected);
    let repeater2_events = repeater2_events.lock().unwrap();
    assert_eq!(
        *repeater2_events,
        (0u64..=2).flat_map(|f| [(f, 0), (f, 1)]).collect::<Vec<_>>()
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hardware_sync_repeater_keeps_receiving_without_readiness_signals() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    let emitter_agent = hub.attach();
    let mut emitter = EmitterNode::new(&test_config(0, &[1, 2]), emitter_agent)?;
    let emitter_registry = emitter.registry();
    let _provider = provide_scene_state(&emitter_registry, 0);

    // repeater 1 paces the cluster over the network; repeater 2
    // announces the hardware-sync switch with its first readiness
    // signal and goes quiet
    let (repeater1_task, repeater1_blobs, _) = spawn_repeater(&hub, 1, 4, false);
    let (repeater2_task, repeater2_blobs, _) = spawn_repeater(&hub, 2, 4, true);

    let emitter_task = tokio::spawn(async move {
        for frame_index in 0u64..=3 {
            let status = emitter.do_frame().await?;
            assert_eq!(status.frame_index, frame_index);
            emitter.conclude_frame();
        }
        anyhow::Ok(())
    });

    emitter_task.await??;
    repeater1_task.await??;
    repeater2_task.await??;

    for blobs in [repeater1_blobs, repeater2_blobs] {
        let blobs = blobs.lock().unwrap();
        assert_eq!(blobs.len(), 4);
        for (frame_index, blob) in blobs.iter().enumerate() {
            assert_eq!(blob, &scene_state_bytes(frame_index as u64), "frame {frame_index}");
        }
    }
    Ok(())
}
