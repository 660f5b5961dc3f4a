use std::sync::Arc;
use tokio_synapse::{MemoryBackend, Packet, Synapse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let backend = Arc::new(MemoryBackend::new(2));
    let synapse = Synapse::new(backend.clone());
    let queue = "basic_queue";

    // Producer: each send resolves once the packet is durable and ordered
    let producer = {
        let synapse = synapse.clone();
        tokio::spawn(async move {
            for i in 0..5 {
                let msg = format!("Message {}", i);
                let id = synapse.send(queue, Packet::new(msg.clone())).await?;
                println!("Sent: {} (id {})", msg, id);
            }
            anyhow::Ok(())
        })
    };

    println!("Creating receiver for queue: {}", queue);
    let receiver = synapse.get_receiver(queue, "printer").await?;

    println!("Waiting for packets...");
    for _ in 0..5 {
        let packet = receiver.recv().await?;
        println!("Received: {} (id {})", packet.display_payload(64), packet.db_id);
        receiver.ack(&packet).await?;
    }
    producer.await??;

    println!("Backend batches: {}, packets: {}", backend.batches(), backend.packets());
    synapse.shutdown();
    Ok(())
}
