use std::path::PathBuf;

use crate::mq::packet::{ConsumerId, QueueName};
use crate::mq::serializer::SerializationError;

/// 配置与拓扑错误：启动时致命
///
/// Configuration and topology errors. These are fatal at startup and are the
/// only errors surfaced by constructors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid queue config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid queue name {0:?}: expected non-empty [A-Za-z0-9_-]")]
    InvalidQueueName(String),

    #[error("invalid consumer id {0:?}: the empty id is reserved for the writer pointer")]
    InvalidConsumerId(String),

    #[error("no host {host} defined for queue {queue}")]
    UnknownHost { host: String, queue: QueueName },

    #[error("queue {0} has no hosts configured")]
    NoHosts(QueueName),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SynapseError {
    #[error("workers for queue {queue} are terminated")]
    Terminated { queue: QueueName },

    #[error("receiver {consumer} on queue {queue} is closed")]
    ReceiverClosed { queue: QueueName, consumer: ConsumerId },

    #[error("consumer {consumer} on queue {queue} already has an open receiver")]
    ReceiverBusy { queue: QueueName, consumer: ConsumerId },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),
}
