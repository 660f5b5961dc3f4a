use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use async_trait::async_trait;
use tokio::time::Instant;
use log::{debug, info};

use crate::backend::gate::RpsGate;
use crate::backend::pointer_key;
use crate::mq::config::BackendConfig;
use crate::mq::packet::{Packet, QueueElementIndex, WRITER_POINTER};
use crate::mq::traits::SynapseBackend;

type Shard = BTreeMap<QueueElementIndex, Arc<Vec<u8>>>;

/// 一次分片写入的记录
///
/// One shard write: the shard, how many packets it carried and when the rate
/// gate let it start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRecord {
    pub shard: usize,
    pub size: usize,
    pub started: Instant,
}

/// 进程内后端：分片存储 + 指针表，带计数器和故障注入
///
/// Process-local backend. Packets live in `parallelism` shards selected by
/// `id mod parallelism`; pointers are keyed `"<queue>:<consumer>"`. Besides
/// counters it records every pointer write and every page read, and can be
/// told to fail the next few calls of a kind, which is how the retry paths
/// are exercised in tests.
#[derive(Debug)]
pub struct MemoryBackend {
    host: String,
    parallelism: usize,
    tables: RwLock<HashMap<String, Vec<Shard>>>,
    pointers: RwLock<HashMap<String, QueueElementIndex>>,
    pointer_history: Mutex<HashMap<String, Vec<QueueElementIndex>>>,
    read_requests: Mutex<HashMap<String, Vec<(QueueElementIndex, QueueElementIndex)>>>,
    batch_log: Mutex<HashMap<String, Vec<BatchRecord>>>,
    write_gate: RpsGate,
    writer_ptr_gate: RpsGate,
    batches: AtomicU64,
    packets: AtomicU64,
    fail_writes: AtomicUsize,
    fail_ptr_writes: AtomicUsize,
    fail_reads: AtomicUsize,
    fail_ptr_reads: AtomicUsize,
    trace: AtomicBool,
}

impl MemoryBackend {
    pub fn new(parallelism: usize) -> Self {
        MemoryBackend {
            host: "memory".to_string(),
            parallelism: parallelism.max(1),
            tables: RwLock::new(HashMap::new()),
            pointers: RwLock::new(HashMap::new()),
            pointer_history: Mutex::new(HashMap::new()),
            read_requests: Mutex::new(HashMap::new()),
            batch_log: Mutex::new(HashMap::new()),
            write_gate: RpsGate::unlimited(),
            writer_ptr_gate: RpsGate::unlimited(),
            batches: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            fail_writes: AtomicUsize::new(0),
            fail_ptr_writes: AtomicUsize::new(0),
            fail_reads: AtomicUsize::new(0),
            fail_ptr_reads: AtomicUsize::new(0),
            trace: AtomicBool::new(false),
        }
    }

    /// 按队列配置中的主机参数创建
    ///
    /// Build from the backend parameters of one host of a queue config.
    pub fn from_config(host: &str, config: &BackendConfig) -> Self {
        Self::new(config.table_parallelism)
            .with_host_name(host)
            .with_max_rps(config.max_rps_per_thread)
    }

    pub fn with_host_name(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// 限制每分片写入速率以及写指针写入速率
    ///
    /// Gate data writes per shard and writer-pointer writes at `max_rps`.
    pub fn with_max_rps(mut self, max_rps: u32) -> Self {
        self.write_gate = RpsGate::new(max_rps);
        self.writer_ptr_gate = RpsGate::new(max_rps);
        self
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// 指针的全部写入记录（按写入顺序）
    ///
    /// Every value written to the pointer, in write order.
    pub fn pointer_history(&self, queue: &str, consumer: &str) -> Vec<QueueElementIndex> {
        let history = self.pointer_history.lock().unwrap_or_else(PoisonError::into_inner);
        history.get(&pointer_key(queue, consumer)).cloned().unwrap_or_default()
    }

    /// 每次 `read_batch` 请求的 (首个, 最后) 序号
    ///
    /// `(first, last)` requested id of every `read_batch` call on `queue`.
    pub fn read_requests(&self, queue: &str) -> Vec<(QueueElementIndex, QueueElementIndex)> {
        let reads = self.read_requests.lock().unwrap_or_else(PoisonError::into_inner);
        reads.get(queue).cloned().unwrap_or_default()
    }

    /// `queue` 的每次分片写入（按开始顺序）
    ///
    /// Every shard write on `queue`, in the order they started.
    pub fn batch_log(&self, queue: &str) -> Vec<BatchRecord> {
        let log = self.batch_log.lock().unwrap_or_else(PoisonError::into_inner);
        log.get(queue).cloned().unwrap_or_default()
    }

    pub fn stored_ids(&self, queue: &str) -> Vec<QueueElementIndex> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<QueueElementIndex> = tables
            .get(queue)
            .map(|shards| shards.iter().flat_map(|shard| shard.keys().copied()).collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_ptr_writes(&self, n: usize) {
        self.fail_ptr_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_ptr_reads(&self, n: usize) {
        self.fail_ptr_reads.store(n, Ordering::SeqCst);
    }

    fn tracing(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    fn shard_of(&self, id: QueueElementIndex) -> usize {
        (id % self.parallelism as QueueElementIndex) as usize
    }
}

fn injected_failure(counter: &AtomicUsize, what: &str) -> anyhow::Result<()> {
    let failing = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        anyhow::bail!("injected {} failure", what);
    }
    Ok(())
}

#[async_trait]
impl SynapseBackend for MemoryBackend {
    async fn write_batch(&self, queue: &str, data: &[Packet]) -> anyhow::Result<()> {
        injected_failure(&self.fail_writes, "write")?;

        let mut split: BTreeMap<usize, Vec<&Packet>> = BTreeMap::new();
        for packet in data {
            split.entry(self.shard_of(packet.db_id)).or_default().push(packet);
        }
        for (shard, packets) in split {
            let started = self.write_gate.wait(shard as u64).await;
            self.batch_log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(queue.to_string())
                .or_default()
                .push(BatchRecord { shard, size: packets.len(), started });
            let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
            let shards = tables
                .entry(queue.to_string())
                .or_insert_with(|| vec![Shard::new(); self.parallelism]);
            for packet in packets {
                shards[shard].insert(packet.db_id, Arc::clone(&packet.data));
            }
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.packets.fetch_add(data.len() as u64, Ordering::Relaxed);
        if self.tracing() {
            debug!("批次已保存，队列: {}, 大小: {} / Batch saved, queue: {}, size: {}", queue, data.len(), queue, data.len());
        }
        Ok(())
    }

    async fn read_batch(&self, queue: &str, ids: &[QueueElementIndex]) -> anyhow::Result<Vec<Packet>> {
        injected_failure(&self.fail_reads, "read")?;
        if let (Some(&first), Some(&last)) = (ids.first(), ids.last()) {
            let mut reads = self.read_requests.lock().unwrap_or_else(PoisonError::into_inner);
            reads.entry(queue.to_string()).or_default().push((first, last));
        }

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let Some(shards) = tables.get(queue) else {
            return Ok(Vec::new());
        };
        let mut result: Vec<Packet> = ids
            .iter()
            .filter_map(|&id| {
                shards[self.shard_of(id)]
                    .get(&id)
                    .map(|data| Packet::stored(id, Arc::clone(data)))
            })
            .collect();
        result.sort_by_key(|p| p.db_id);
        Ok(result)
    }

    async fn write_ptr(&self, queue: &str, consumer: &str, ptr: QueueElementIndex) -> anyhow::Result<()> {
        if consumer == WRITER_POINTER {
            self.writer_ptr_gate.wait(0).await;
        }
        injected_failure(&self.fail_ptr_writes, "pointer write")?;

        let key = pointer_key(queue, consumer);
        self.pointers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), ptr);
        self.pointer_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .push(ptr);
        if self.tracing() {
            info!("指针已保存，队列: {}, 消费者: {:?}, 指针: {} / Pointer saved, queue: {}, consumer: {:?}, ptr: {}",
                  queue, consumer, ptr, queue, consumer, ptr);
        }
        Ok(())
    }

    async fn get_ptr(&self, queue: &str, consumer: &str) -> anyhow::Result<QueueElementIndex> {
        injected_failure(&self.fail_ptr_reads, "pointer read")?;
        let pointers = self.pointers.read().unwrap_or_else(PoisonError::into_inner);
        Ok(pointers.get(&pointer_key(queue, consumer)).copied().unwrap_or(0))
    }

    fn default_queue_parallelism(&self, _queue: &str) -> usize {
        self.parallelism
    }

    fn host_name(&self) -> &str {
        &self.host
    }

    fn set_trace(&self, trace: bool) {
        self.trace.store(trace, Ordering::Relaxed);
    }
}
