//! Tokio Synapse - 基于可插拔存储后端的持久、有序、至少一次投递消息队列
//!
//! Tokio Synapse - durable, ordered, at-least-once message queue over a
//! pluggable storage backend, powered by Tokio.
//!
//! Producers append packets to a named queue; `send` resolves once the packet
//! and every lower-numbered packet of the queue are durable. Each consumer
//! reads the queue at its own pace and acknowledges packets in any order; its
//! pointer only advances over a contiguous run of acknowledgments.
//!
//! # Examples
//!
//! Send and receive:
//! ```rust
//! use std::sync::Arc;
//! use tokio_synapse::{MemoryBackend, Packet, Synapse};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let synapse = Synapse::new(Arc::new(MemoryBackend::new(2)));
//!
//!     let id = synapse.send("demo", Packet::new("Hello")).await?;
//!     assert_eq!(id, 1);
//!
//!     let receiver = synapse.get_receiver("demo", "reader").await?;
//!     let packet = receiver.recv().await?;
//!     assert_eq!(packet.data(), b"Hello");
//!     receiver.ack(&packet).await?;
//!     Ok(())
//! }
//! ```
//!
//! Typed payloads:
//! ```rust
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use tokio_synapse::{MemoryBackend, SerializationFormat, Synapse};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Order { id: u32, item: String }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let synapse = Synapse::new(Arc::new(MemoryBackend::new(1)));
//!     let order = Order { id: 7, item: "book".to_string() };
//!     synapse.send_typed("orders", &order, SerializationFormat::Json).await?;
//!
//!     let receiver = synapse.get_receiver("orders", "billing").await?;
//!     let packet = receiver.recv().await?;
//!     let decoded: Order = packet.deserialize(SerializationFormat::Json)?;
//!     assert_eq!(decoded, order);
//!     Ok(())
//! }
//! ```
pub mod mq;
pub mod backend;

pub use mq::{Synapse, Receiver, Packet, QueueElementIndex, QueueName, ConsumerId, ControlCommand, WRITER_POINTER};
pub use mq::{BackendConfig, QueueConfig, SynapseOptions, validate_queue_name};
pub use mq::{ConfigError, SynapseError};
pub use mq::traits::SynapseBackend;
pub use mq::serializer::{SerializationFormat, SerializationHelper, SerializationError};
pub use mq::registry::ChannelRegistry;
pub use backend::{BatchRecord, MemoryBackend, SqliteBackend, SqliteBackendConfig, RpsGate};
