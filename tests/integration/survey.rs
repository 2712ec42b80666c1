//! Repeater surveys and the greeting-skip fast path: an emitter taking
//! over a running cluster surveys it out of band, then starts emitting
//! without the registration handshake.

use std::time::Duration;

use anyhow::Result;
use lockstep_core::wire::MessageType;
use lockstep_net::testing::LoopbackHub;
use lockstep_net::NetworkAgent;
use lockstep_node::{survey_repeaters, EmitterNode, RepeaterNode};

use crate::{
    init_tracing, provide_scene_state, record_scene_state, scene_state_bytes, test_config,
    MAX_MESSAGE_SIZE,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn survey_collects_presence_and_sync_mode() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    // repeaters answer surveys from construction on, whatever state
    // their frame loop is in
    let _repeater1 = RepeaterNode::new(&test_config(1, &[]), hub.attach());
    let _repeater2 = RepeaterNode::new(&test_config(2, &[]), hub.attach());

    let surveyor = hub.attach();
    let mut answers = survey_repeaters(surveyor.as_ref(), 2, Duration::from_secs(2)).await;
    answers.sort_by_key(|a| a.node_id);

    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0].node_id, 1);
    assert_eq!(answers[1].node_id, 2);
    assert!(answers.iter().all(|a| a.still_use_network_sync));
    // nothing received yet
    assert!(answers.iter().all(|a| a.last_received_frame_index == u64::MAX));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn greeting_skip_cluster_exchanges_no_registrations() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    // both sides pre-seeded: the emitter knows the repeaters from a
    // survey, the repeaters know they were surveyed
    let surveyed = vec![
        lockstep_core::SurveyedRepeater {
            node_id: 1,
            ip_address_bytes: [0, 0, 0, 0],
            last_received_frame_index: u64::MAX,
            still_use_network_sync: true,
        },
        lockstep_core::SurveyedRepeater {
            node_id: 2,
            ip_address_bytes: [0, 0, 0, 0],
            last_received_frame_index: u64::MAX,
            still_use_network_sync: true,
        },
    ];

    let mut repeater_tasks = Vec::new();
    let mut blob_records = Vec::new();
    for node_id in [1u8, 2] {
        let mut config = test_config(node_id, &[]);
        config.sync.surveyed_repeaters = surveyed.clone();
        let mut repeater = RepeaterNode::new(&config, hub.attach());
        let registry = repeater.registry();
        let (blobs, guard) = record_scene_state(&registry);
        blob_records.push(blobs);
        repeater_tasks.push(tokio::spawn(async move {
            let _guard = guard;
            for expected_frame in 0u64..=2 {
                let status = repeater.do_frame().await?;
                assert_eq!(status.frame_index, expected_frame);
                repeater.conclude_frame();
            }
            anyhow::Ok(())
        }));
    }

    let mut emitter_config = test_config(0, &[1, 2]);
    emitter_config.sync.surveyed_repeaters = surveyed;
    let emitter_agent = hub.attach();
    let mut emitter = EmitterNode::new(&emitter_config, emitter_agent.clone())?;
    let emitter_registry = emitter.registry();
    let _provider = provide_scene_state(&emitter_registry, 0);

    for frame_index in 0u64..=2 {
        let status = emitter.do_frame().await?;
        assert_eq!(status.frame_index, frame_index);
        emitter.conclude_frame();
    }
    for task in repeater_tasks {
        task.await??;
    }

    // the handshake never happened
    let stats = emitter_agent.stats();
    assert_eq!(stats.received[MessageType::RegisteringWithEmitter.index()], 0);
    assert_eq!(stats.sent[MessageType::RepeaterRegistered.index()], 0);

    for blobs in blob_records {
        let blobs = blobs.lock().unwrap();
        assert_eq!(blobs.len(), 3);
        for (frame_index, blob) in blobs.iter().enumerate() {
            assert_eq!(blob, &scene_state_bytes(frame_index as u64), "frame {frame_index}");
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surveyed_emitter_takes_over_a_running_cluster() -> Result<()> {
    init_tracing();
    let hub = LoopbackHub::new(MAX_MESSAGE_SIZE);

    // repeater runs four frames across both emitters
    let repeater_agent = hub.attach();
    let mut repeater = RepeaterNode::new(&test_config(1, &[]), repeater_agent);
    let repeater_registry = repeater.registry();
    let (blobs, _blob_guard) = record_scene_state(&repeater_registry);
    let repeater_task = tokio::spawn(async move {
        for expected_frame in 0u64..=3 {
            let status = repeater.do_frame().await?;
            assert_eq!(status.frame_index, expected_frame);
            repeater.conclude_frame();
        }
        anyhow::Ok(())
    });

    // first emitter handles frames 0 and 1, then goes away
    {
        let mut emitter = EmitterNode::new(&test_config(0, &[1]), hub.attach())?;
        let registry = emitter.registry();
        let _provider = provide_scene_state(&registry, 0);
        for frame_index in 0u64..=1 {
            let status = emitter.do_frame().await?;
            assert_eq!(status.frame_index, frame_index);
            emitter.conclude_frame();
        }
    }

    // give the repeater's frame loop time to consume frame 1, so the
    // survey reports it
    tokio::time::sleep(Duration::from_millis(200)).await;

    // the successor surveys the cluster out of band, then greeting-
    // skips straight into frame 2
    let successor_agent = hub.attach();
    let answers = survey_repeaters(successor_agent.as_ref(), 1, Duration::from_secs(2)).await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].node_id, 1);
    assert_eq!(answers[0].last_received_frame_index, 1);

    let mut successor_config = test_config(0, &[1]);
    successor_config.sync.surveyed_repeaters = answers;
    successor_config.sync.first_frame_index = 2;
    let mut successor = EmitterNode::new(&successor_config, successor_agent)?;
    let registry = successor.registry();
    let _provider = provide_scene_state(&registry, 2);
    for frame_index in 2u64..=3 {
        let status = successor.do_frame().await?;
        assert_eq!(status.frame_index, frame_index);
        successor.conclude_frame();
    }

    repeater_task.await??;
    let blobs = blobs.lock().unwrap();
    assert_eq!(blobs.len(), 4);
    for (frame_index, blob) in blobs.iter().enumerate() {
        assert_eq!(blob, &scene_state_bytes(frame_index as u64), "frame {frame_index}");
    }
    Ok(())
}
