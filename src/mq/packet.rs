use std::sync::Arc;
use async_channel::Sender;
use log::{debug, warn};

use super::serializer::{SerializationFormat, SerializationHelper, SerializationError};

/// 队列元素序号：每个队列内唯一且严格递增，从 1 开始
///
/// Queue element sequence number: unique per queue, strictly increasing, starting at 1.
/// A pointer value of `0` means "nothing yet".
pub type QueueElementIndex = u64;

/// 队列名称
///
/// Queue name.
pub type QueueName = String;

/// 消费者标识
///
/// Consumer identifier.
pub type ConsumerId = String;

/// 写指针保留的消费者名（空字符串）
///
/// Consumer id reserved for the writer pointer (a queue's persisted tail).
pub const WRITER_POINTER: &str = "";

/// 工作任务控制命令
///
/// Control command broadcast to worker tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlCommand {
    pub terminate: bool,
}

impl ControlCommand {
    pub fn terminate() -> Self {
        ControlCommand { terminate: true }
    }
}

/// 数据包：负载字节、分配的序号以及一次性的持久化确认通道
///
/// A packet: payload bytes, the assigned sequence number and a one-shot
/// confirmation channel signalled once the packet is durable and ordered.
#[derive(Clone)]
pub struct Packet {
    pub data: Arc<Vec<u8>>,
    /// 持久化前为 0 / Zero until the queue runner assigns it.
    pub db_id: QueueElementIndex,
    confirmation: Option<Sender<QueueElementIndex>>,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("db_id", &self.db_id)
            .field("len", &self.data.len())
            .field("awaiting_confirmation", &self.awaits_confirmation())
            .finish()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.db_id == other.db_id && self.data == other.data
    }
}

impl Packet {
    /// 使用字节负载创建新包
    ///
    /// Create a new packet from raw bytes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Packet::from_shared(Arc::new(data.into()))
    }

    /// 从共享字节创建新包（零拷贝）
    ///
    /// Create a packet from shared bytes (zero-copy).
    pub fn from_shared(data: Arc<Vec<u8>>) -> Self {
        Packet { data, db_id: 0, confirmation: None }
    }

    /// 后端读取时使用：带序号的已存储包
    ///
    /// A stored packet with its sequence number, as returned by a backend read.
    pub fn stored(db_id: QueueElementIndex, data: Arc<Vec<u8>>) -> Self {
        Packet { data, db_id, confirmation: None }
    }

    /// 序列化任意 serde 数据为包负载
    ///
    /// Serialize any `serde::Serialize` value into a packet payload.
    pub fn typed<T: serde::Serialize>(value: &T, format: SerializationFormat) -> Result<Self, SerializationError> {
        let bytes = SerializationHelper::serialize(value, format)?;
        debug!("类型化包创建成功，格式: {:?}, 大小: {} 字节 / Typed packet created, format: {:?}, size: {} bytes",
               format, bytes.len(), format, bytes.len());
        Ok(Packet::new(bytes))
    }

    /// 按指定格式反序列化负载
    ///
    /// Deserialize the payload using the given format.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self, format: SerializationFormat) -> Result<T, SerializationError> {
        SerializationHelper::deserialize(&self.data, format)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn db_id(&self) -> QueueElementIndex {
        self.db_id
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 负载的可读预览（用于日志）
    ///
    /// Lossy UTF-8 preview of the payload, truncated to `max_len` bytes.
    pub fn display_payload(&self, max_len: usize) -> String {
        let end = self.data.len().min(max_len);
        let mut preview = String::from_utf8_lossy(&self.data[..end]).into_owned();
        if self.data.len() > max_len {
            preview.push_str("...");
        }
        preview
    }

    pub(crate) fn set_confirmation(&mut self, confirmation: Sender<QueueElementIndex>) {
        self.confirmation = Some(confirmation);
    }

    pub(crate) fn awaits_confirmation(&self) -> bool {
        self.confirmation.is_some()
    }

    /// 通知生产者该包已持久化且有序；每个包最多通知一次
    ///
    /// Release the producer waiting on this packet. Consumes the channel, so a
    /// packet is confirmed at most once.
    pub(crate) fn confirm(&mut self) {
        if let Some(confirmation) = self.confirmation.take() {
            if let Err(e) = confirmation.try_send(self.db_id) {
                if !e.is_closed() {
                    warn!("确认通道已满，包: {} / Confirmation channel full, packet: {}", self.db_id, self.db_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_releases_once() {
        let (tx, rx) = async_channel::bounded(2);
        let mut packet = Packet::new("payload");
        packet.db_id = 7;
        packet.set_confirmation(tx);

        packet.confirm();
        packet.confirm();

        assert_eq!(rx.try_recv().ok(), Some(7));
        assert!(rx.try_recv().is_err());
        assert!(!packet.awaits_confirmation());
    }

    #[test]
    fn display_payload_truncates() {
        let packet = Packet::new("hello world");
        assert_eq!(packet.display_payload(5), "hello...");
        assert_eq!(packet.display_payload(64), "hello world");
    }
}
