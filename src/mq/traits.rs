use crate::mq::packet::{Packet, QueueElementIndex};

/// 持久化后端 trait - 定义队列数据与指针的存储接口 / Storage backend trait for queue data and pointers
///
/// 后端只被当作持久的键值/追加日志使用；所有写操作都可能被调用方原样重试，
/// 因此必须幂等（按序号 upsert）。
/// The backend is used only as a durable key-value / append log. Every write
/// may be retried verbatim by the caller, so writes must be idempotent
/// upserts keyed by sequence number.
#[async_trait::async_trait]
pub trait SynapseBackend: Send + Sync {
    /// 持久化一批包 / Persist a batch of packets.
    async fn write_batch(&self, queue: &str, data: &[Packet]) -> anyhow::Result<()>;

    /// 读取指定序号的包负载，结果按序号升序 / Fetch payloads for the given ids, ascending by id.
    ///
    /// Missing ids are omitted from the result rather than reported as errors.
    async fn read_batch(&self, queue: &str, ids: &[QueueElementIndex]) -> anyhow::Result<Vec<Packet>>;

    /// 写入命名指针；消费者为空字符串表示写指针 / Upsert a named pointer; the empty consumer is the writer pointer.
    async fn write_ptr(&self, queue: &str, consumer: &str, ptr: QueueElementIndex) -> anyhow::Result<()>;

    /// 读取命名指针，不存在时返回 0 / Read a named pointer; an absent key reads as `0`.
    async fn get_ptr(&self, queue: &str, consumer: &str) -> anyhow::Result<QueueElementIndex>;

    /// 队列写入分片数 / Shard count used by the queue writers of `queue`.
    fn default_queue_parallelism(&self, queue: &str) -> usize;

    /// 后端所在主机名（用于日志） / Host name of the backend, attached to log lines.
    fn host_name(&self) -> &str;

    /// 开关逐条跟踪日志 / Toggle verbose trace logging.
    fn set_trace(&self, _trace: bool) {}
}
