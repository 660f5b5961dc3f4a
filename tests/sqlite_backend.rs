use std::sync::Arc;
use std::time::Duration;
use tokio_synapse::{Packet, QueueConfig, SqliteBackend, Synapse, SynapseBackend, SynapseOptions, WRITER_POINTER};

const QUEUE_CONFIG: &str = r#"{
    "name": "events",
    "hosts": {
        "localhost": {
            "dbname": "synapse_test",
            "table_parallelism": 3,
            "pointers_parallelism": 1,
            "max_rps_per_thread": 1000
        }
    }
}"#;

fn fast_options() -> SynapseOptions {
    SynapseOptions {
        idle_flush_interval: Duration::from_millis(50),
        receiver_poll_interval: Duration::from_millis(20),
        retry_delay: Duration::from_millis(5),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_survives_process_restart() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir()?;
    let config = QueueConfig::from_json_str(QUEUE_CONFIG)?;

    {
        let backend = Arc::new(SqliteBackend::for_queue(&config, "localhost", dir.path())?);
        assert_eq!(backend.default_queue_parallelism("events"), 3);
        let synapse = Synapse::with_options(backend.clone(), fast_options())?;

        let packets: Vec<Packet> = (0..20).map(|i| Packet::new(format!("event-{}", i))).collect();
        synapse.send_pack(&config.name, packets).await?;
        assert_eq!(backend.packets(), 20);

        let receiver = synapse.get_buffered_receiver(&config.name, "audit", 32).await?;
        for expected in 1..=8u64 {
            let packet = receiver.recv().await?;
            assert_eq!(packet.db_id, expected);
            receiver.ack(&packet).await?;
        }
        for _ in 0..500 {
            if backend.get_ptr(&config.name, "audit").await? == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.get_ptr(&config.name, "audit").await?, 8);
        synapse.shutdown();
    }

    let backend = Arc::new(SqliteBackend::for_queue(&config, "localhost", dir.path())?);
    assert_eq!(backend.get_ptr(&config.name, WRITER_POINTER).await?, 20);
    let synapse = Synapse::with_options(backend.clone(), fast_options())?;
    assert_eq!(synapse.send(&config.name, Packet::new("after-restart")).await?, 21);

    let receiver = synapse.get_buffered_receiver(&config.name, "audit", 32).await?;
    let first = receiver.recv().await?;
    assert_eq!(first.db_id, 9);
    assert_eq!(first.data(), b"event-8");
    Ok(())
}

#[test]
fn unknown_host_fails_at_startup() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = QueueConfig::from_json_str(QUEUE_CONFIG)?;
    assert!(SqliteBackend::for_queue(&config, "elsewhere", dir.path()).is_err());
    Ok(())
}
