//! 存储后端实现
//!
//! Storage backends implementing [`SynapseBackend`](crate::mq::SynapseBackend).

pub mod gate;
pub mod memory;
pub mod sqlite;

pub use gate::RpsGate;
pub use memory::{BatchRecord, MemoryBackend};
pub use sqlite::{SqliteBackend, SqliteBackendConfig};

/// 指针表中的键：`"<queue>:<consumer>"`，写指针的消费者为空
///
/// Key of a pointer row: `"<queue>:<consumer>"`; the writer pointer has an
/// empty consumer.
pub fn pointer_key(queue: &str, consumer: &str) -> String {
    format!("{}:{}", queue, consumer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::WRITER_POINTER;

    #[test]
    fn writer_pointer_key_has_empty_consumer() {
        assert_eq!(pointer_key("orders", WRITER_POINTER), "orders:");
        assert_eq!(pointer_key("orders", "billing"), "orders:billing");
    }
}
