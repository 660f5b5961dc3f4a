use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio_synapse::{QueueConfig, SerializationFormat, SqliteBackend, Synapse, SynapseBackend};

#[derive(Serialize, Deserialize, Debug)]
struct Task {
    id: u32,
    name: String,
}

const QUEUE_CONFIG: &str = r#"{
    "name": "tasks",
    "hosts": {
        "localhost": {
            "dbname": "synapse_demo",
            "table_parallelism": 4,
            "pointers_parallelism": 1,
            "max_rps_per_thread": 200
        }
    }
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = QueueConfig::from_json_str(QUEUE_CONFIG)?;
    let data_dir = std::env::temp_dir().join("tokio-synapse-demo");
    let backend = Arc::new(SqliteBackend::for_queue(&config, "localhost", &data_dir)?);
    println!("Database: {}", backend.config().path.display());

    let synapse = Synapse::new(backend.clone());
    let queue = config.name.as_str();

    let tasks: Vec<Task> = (0..10).map(|i| Task { id: i, name: format!("Task {}", i) }).collect();
    synapse.send_typed_pack(queue, &tasks, SerializationFormat::Json).await?;
    println!("Writer pointer: {}", synapse.get_pointer(queue, "").await?);

    // Two independent consumers: each keeps its own pointer
    let fast = synapse.get_buffered_receiver(queue, "fast", 16).await?;
    let slow = synapse.get_buffered_receiver(queue, "slow", 16).await?;
    println!("fast resumes after {}, slow resumes after {}", fast.last_acked_id(), slow.last_acked_id());

    let t1 = tokio::spawn(async move {
        while let Some(packet) = fast.recv_timeout(Duration::from_millis(500)).await? {
            let task: Task = packet.deserialize(SerializationFormat::Json)?;
            println!("fast consumer: {:?}", task);
            fast.ack(&packet).await?;
        }
        anyhow::Ok(())
    });

    let t2 = tokio::spawn(async move {
        for _ in 0..3 {
            if let Some(packet) = slow.recv_timeout(Duration::from_millis(500)).await? {
                let task: Task = packet.deserialize(SerializationFormat::Json)?;
                println!("slow consumer: {:?}", task);
                slow.ack(&packet).await?;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        anyhow::Ok(())
    });

    t1.await??;
    t2.await??;
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("fast pointer: {}", backend.get_ptr(queue, "fast").await?);
    println!("slow pointer: {}", backend.get_ptr(queue, "slow").await?);
    println!("Run again: both consumers resume where they left off.");
    synapse.shutdown();
    Ok(())
}
