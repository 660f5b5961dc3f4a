use std::sync::Arc;
use std::time::Duration;
use tokio_synapse::{
    MemoryBackend, Packet, SerializationFormat, Synapse, SynapseBackend, SynapseError, SynapseOptions,
    WRITER_POINTER,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_options() -> SynapseOptions {
    SynapseOptions {
        idle_flush_interval: Duration::from_millis(50),
        receiver_poll_interval: Duration::from_millis(20),
        retry_delay: Duration::from_millis(5),
        ..Default::default()
    }
}

fn assert_strictly_increasing(history: &[u64]) {
    for pair in history.windows(2) {
        assert!(pair[0] < pair[1], "pointer went from {} to {}", pair[0], pair[1]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_get_gap_free_ids() -> anyhow::Result<()> {
    init_logger();
    let backend = Arc::new(MemoryBackend::new(4));
    let synapse = Synapse::with_options(backend.clone(), fast_options())?;

    let mut handles = Vec::new();
    for producer in 0..8 {
        let synapse = synapse.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for i in 0..25 {
                let id = synapse.send("gapless", Packet::new(format!("p{}-{}", producer, i))).await?;
                ids.push(id);
            }
            anyhow::Ok(ids)
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let producer_ids = handle.await??;
        // one producer's sends are sequential, so its ids ascend
        assert!(producer_ids.windows(2).all(|w| w[0] < w[1]));
        ids.extend(producer_ids);
    }
    ids.sort_unstable();
    assert_eq!(ids, (1..=200).collect::<Vec<_>>());

    assert_eq!(backend.get_ptr("gapless", WRITER_POINTER).await?, 200);
    assert_eq!(backend.stored_ids("gapless"), (1..=200).collect::<Vec<_>>());
    assert_strictly_increasing(&backend.pointer_history("gapless", WRITER_POINTER));
    Ok(())
}

#[tokio::test]
async fn send_pack_is_durable_when_it_returns() -> anyhow::Result<()> {
    init_logger();
    let backend = Arc::new(MemoryBackend::new(3));
    let synapse = Synapse::with_options(backend.clone(), fast_options())?;

    let packets: Vec<Packet> = (0..50).map(|i| Packet::new(format!("item-{}", i))).collect();
    synapse.send_pack("packs", packets).await?;

    assert_eq!(synapse.get_pointer("packs", WRITER_POINTER).await?, 50);
    let ids: Vec<u64> = (1..=50).collect();
    let stored = backend.read_batch("packs", &ids).await?;
    assert_eq!(stored.len(), 50);
    for (i, packet) in stored.iter().enumerate() {
        assert_eq!(packet.db_id, i as u64 + 1);
        assert_eq!(packet.data(), format!("item-{}", i).as_bytes());
    }
    Ok(())
}

#[tokio::test]
async fn empty_pack_completes_immediately() -> anyhow::Result<()> {
    let synapse = Synapse::with_options(Arc::new(MemoryBackend::new(1)), fast_options())?;
    synapse.send_pack("empty", Vec::new()).await?;
    assert_eq!(synapse.get_pointer("empty", WRITER_POINTER).await?, 0);
    Ok(())
}

#[tokio::test]
async fn async_send_yields_id_once_durable() -> anyhow::Result<()> {
    let backend = Arc::new(MemoryBackend::new(2));
    let synapse = Synapse::with_options(backend.clone(), fast_options())?;

    let first = synapse.async_send("async", Packet::new("a")).await?;
    let second = synapse.async_send("async", Packet::new("b")).await?;
    assert_eq!(first.recv().await?, 1);
    assert_eq!(second.recv().await?, 2);
    assert!(backend.get_ptr("async", WRITER_POINTER).await? >= 2);

    let done = synapse.async_send_pack("async", vec![Packet::new("c"), Packet::new("d")]).await?;
    done.await?;
    assert_eq!(backend.get_ptr("async", WRITER_POINTER).await?, 4);
    Ok(())
}

#[tokio::test]
async fn counter_recovers_after_restart() -> anyhow::Result<()> {
    init_logger();
    let backend = Arc::new(MemoryBackend::new(2));

    let first = Synapse::with_options(backend.clone(), fast_options())?;
    for i in 1..=3 {
        assert_eq!(first.send("restart", Packet::new(vec![i])).await?, i as u64);
    }
    first.shutdown();

    let second = Synapse::with_options(backend.clone(), fast_options())?;
    assert_eq!(second.send("restart", Packet::new("after")).await?, 4);
    assert_eq!(backend.stored_ids("restart"), vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn backend_failures_are_retried() -> anyhow::Result<()> {
    init_logger();
    let backend = Arc::new(MemoryBackend::new(2));
    backend.fail_next_ptr_reads(2);
    backend.fail_next_writes(3);
    backend.fail_next_ptr_writes(2);
    let synapse = Synapse::with_options(backend.clone(), fast_options())?;

    let id = synapse.send("flaky", Packet::new("survives")).await?;
    assert_eq!(id, 1);
    assert_eq!(backend.get_ptr("flaky", WRITER_POINTER).await?, 1);
    assert_eq!(backend.batches(), 1);
    assert_eq!(backend.pointer_history("flaky", WRITER_POINTER), vec![1]);
    Ok(())
}

#[tokio::test]
async fn typed_values_round_trip_through_queue() -> anyhow::Result<()> {
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq, Clone)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    let synapse = Synapse::with_options(Arc::new(MemoryBackend::new(2)), fast_options())?;
    let readings = vec![
        Reading { sensor: "a".to_string(), value: 1.5 },
        Reading { sensor: "b".to_string(), value: -2.0 },
    ];
    synapse.send_typed_pack("readings", &readings, SerializationFormat::MessagePack).await?;

    let receiver = synapse.get_buffered_receiver("readings", "dashboard", 8).await?;
    for expected in &readings {
        let packet = receiver.recv().await?;
        let decoded: Reading = packet.deserialize(SerializationFormat::MessagePack)?;
        assert_eq!(&decoded, expected);
    }
    Ok(())
}

#[tokio::test]
async fn shutdown_rejects_new_sends() -> anyhow::Result<()> {
    let synapse = Synapse::with_options(Arc::new(MemoryBackend::new(1)), fast_options())?;
    synapse.send("live", Packet::new("before")).await?;
    assert_eq!(synapse.list_queues().await, vec!["live".to_string()]);

    synapse.shutdown();
    let err = synapse.send("live", Packet::new("after")).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<SynapseError>(), Some(SynapseError::Terminated { .. })));
    Ok(())
}

#[tokio::test]
async fn invalid_queue_names_are_rejected() {
    let synapse = Synapse::new(Arc::new(MemoryBackend::new(1)));
    assert!(synapse.send("bad name", Packet::new("x")).await.is_err());
    assert!(synapse.get_receiver("q", "").await.is_err());
}
