use std::sync::Arc;
use async_channel::{bounded, Receiver};
use tokio::sync::{watch, Mutex};
use log::{debug, info, warn};

use crate::mq::Core;
use crate::mq::channels::abandon_inbound;
use crate::mq::packet::{ControlCommand, Packet, QueueName, QueueElementIndex, WRITER_POINTER};

impl Core {
    /// 写入分片：累积包并批量持久化
    ///
    /// Queue writer for one shard. Packets accumulate in a buffer which is
    /// flushed when the inbound channel drains (or the buffer passes the flush
    /// threshold), when the idle timer fires, or when a finished flush
    /// re-triggers. At most one flush per shard is in flight; a full buffer
    /// stops intake until the next flush takes it.
    pub(crate) async fn queue_writer(
        self: Arc<Self>,
        shard: usize,
        queue: QueueName,
        last_saved_id: QueueElementIndex,
        rx: Receiver<Packet>,
        mut control: watch::Receiver<ControlCommand>,
    ) {
        let (trigger_tx, trigger_rx) = bounded::<()>(2);
        let write_lock = Arc::new(Mutex::new(()));
        let mut buffer: Vec<Packet> = Vec::new();

        loop {
            let accepting = buffer.len() < self.options.io_batch_size;
            tokio::select! {
                biased;
                changed = control.changed() => {
                    if changed.is_err() || control.borrow().terminate {
                        debug!("写入分片退出，队列: {}, 分片: {}, 丢弃缓冲: {} / Writer shard terminated, queue: {}, shard: {}, abandoned: {}",
                               queue, shard, buffer.len(), queue, shard, buffer.len());
                        break;
                    }
                }
                Ok(()) = trigger_rx.recv() => {
                    if buffer.is_empty() {
                        continue;
                    }
                    let Ok(guard) = Arc::clone(&write_lock).try_lock_owned() else {
                        if self.tracing() {
                            info!("写入进行中，缓冲等待下一轮: {} 条 / Write already running, {} packets wait for next cycle",
                                  buffer.len(), buffer.len());
                        }
                        continue;
                    };
                    let batch = std::mem::take(&mut buffer);
                    let core = Arc::clone(&self);
                    let queue = queue.clone();
                    let trigger = trigger_tx.clone();
                    tokio::spawn(async move {
                        core.write_buffer(shard, &queue, last_saved_id, batch).await;
                        drop(guard);
                        if trigger.is_empty() {
                            let _ = trigger.try_send(());
                        }
                    });
                }
                packet = rx.recv(), if accepting => {
                    let Ok(packet) = packet else {
                        break;
                    };
                    buffer.push(packet);
                    if trigger_tx.is_empty() && (rx.is_empty() || buffer.len() > self.options.flush_threshold) {
                        let _ = trigger_tx.try_send(());
                    }
                }
                _ = tokio::time::sleep(self.options.idle_flush_interval) => {
                    if !buffer.is_empty() && trigger_tx.is_empty() {
                        let _ = trigger_tx.try_send(());
                    }
                }
            }
        }
        abandon_inbound("写入分片 / writer shard", &queue, &rx);
    }

    /// 持久化一批包（失败时原样无限重试），成功后逐个交给确认管理器
    ///
    /// Persist one batch, retrying the same batch until the backend accepts
    /// it, then hand every packet to the queue's ack manager.
    pub(crate) async fn write_buffer(
        self: &Arc<Self>,
        shard: usize,
        queue: &str,
        last_saved_id: QueueElementIndex,
        batch: Vec<Packet>,
    ) {
        if self.tracing() {
            info!("保存批次，队列: {}, 分片: {}, 大小: {} / Saving batch, queue: {}, shard: {}, size: {}",
                  queue, shard, batch.len(), queue, shard, batch.len());
        }
        let mut attempt: u64 = 0;
        while let Err(e) = self.backend.write_batch(queue, &batch).await {
            attempt += 1;
            if !self.retry_pause("批量写入 / batch write", queue, attempt, &e).await {
                warn!("终止时放弃未写入的批次，队列: {}, 大小: {} / Abandoning unwritten batch on terminate, queue: {}, size: {}",
                      queue, batch.len(), queue, batch.len());
                return;
            }
        }
        if self.tracing() {
            info!("批次已保存，队列: {}, 分片: {} / Batch saved, queue: {}, shard: {}", queue, shard, queue, shard);
        }

        let ack = self.queue_ack_man_channel(queue, last_saved_id).await;
        for packet in batch {
            if ack.send(packet).await.is_err() {
                warn!("确认管理器已关闭，队列: {} / Ack manager closed, queue: {}", queue, queue);
                return;
            }
        }
    }

    /// 持久化写指针，失败时重试直到成功；返回 false 表示因终止而放弃
    ///
    /// Persist the writer pointer, retrying until it succeeds. Returns `false`
    /// if the attempt was abandoned because the workers are terminating.
    pub(crate) async fn save_queue_writer_ptr(&self, queue: &str, ptr: QueueElementIndex) -> bool {
        if self.tracing() {
            debug!("写指针，队列: {}, 指针: {} / write-ptr, queue: {}, ptr: {}", queue, ptr, queue, ptr);
        }
        let mut attempt: u64 = 0;
        while let Err(e) = self.backend.write_ptr(queue, WRITER_POINTER, ptr).await {
            attempt += 1;
            if !self.retry_pause("保存队列指针 / saving queue pointer", queue, attempt, &e).await {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use async_trait::async_trait;
    use crate::backend::MemoryBackend;
    use crate::mq::{Synapse, SynapseBackend, SynapseOptions};

    /// Memory backend whose batch writes take `delay`; records overlap and sizes.
    struct SlowBackend {
        inner: MemoryBackend,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl SlowBackend {
        fn new(delay: Duration) -> Self {
            SlowBackend {
                inner: MemoryBackend::new(1),
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SynapseBackend for SlowBackend {
        async fn write_batch(&self, queue: &str, data: &[Packet]) -> anyhow::Result<()> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let result = self.inner.write_batch(queue, data).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn read_batch(&self, queue: &str, ids: &[QueueElementIndex]) -> anyhow::Result<Vec<Packet>> {
            self.inner.read_batch(queue, ids).await
        }

        async fn write_ptr(&self, queue: &str, consumer: &str, ptr: QueueElementIndex) -> anyhow::Result<()> {
            self.inner.write_ptr(queue, consumer, ptr).await
        }

        async fn get_ptr(&self, queue: &str, consumer: &str) -> anyhow::Result<QueueElementIndex> {
            self.inner.get_ptr(queue, consumer).await
        }

        fn default_queue_parallelism(&self, queue: &str) -> usize {
            self.inner.default_queue_parallelism(queue)
        }

        fn host_name(&self) -> &str {
            self.inner.host_name()
        }
    }

    fn batching_options(io_batch_size: usize, flush_threshold: usize) -> SynapseOptions {
        SynapseOptions {
            io_batch_size,
            flush_threshold,
            // flushes under test must not come from the idle timer
            idle_flush_interval: Duration::from_secs(60),
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_flush_in_flight_and_batches_capped() -> anyhow::Result<()> {
        let backend = Arc::new(SlowBackend::new(Duration::from_millis(30)));
        let synapse = Synapse::with_options(backend.clone(), batching_options(8, 4))?;

        let mut handles = Vec::new();
        for i in 0..50 {
            let synapse = synapse.clone();
            handles.push(tokio::spawn(async move {
                synapse.send("capped", Packet::new(format!("m{}", i))).await
            }));
        }
        let done = tokio::time::timeout(Duration::from_secs(10), async {
            for handle in handles {
                handle.await??;
            }
            anyhow::Ok(())
        });
        done.await.map_err(|_| anyhow::anyhow!("sends waited for the idle timer"))??;

        let log = backend.inner.batch_log("capped");
        let sizes: Vec<usize> = log.iter().map(|record| record.size).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 50);
        assert!(sizes.iter().all(|&size| size <= 8), "batch over io_batch_size: {:?}", sizes);
        assert!(sizes.len() >= 7, "expected at least 7 batches: {:?}", sizes);
        assert!(sizes.iter().any(|&size| size > 1), "packets were never batched: {:?}", sizes);
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn flush_does_not_wait_for_idle_timer() -> anyhow::Result<()> {
        let backend = Arc::new(MemoryBackend::new(1));
        let synapse = Synapse::with_options(backend.clone(), batching_options(1024, 4))?;

        let packets = (0..10).map(|i| Packet::new(format!("m{}", i))).collect();
        tokio::time::timeout(Duration::from_secs(5), synapse.send_pack("eager", packets))
            .await
            .map_err(|_| anyhow::anyhow!("pack waited for the idle timer"))??;
        assert_eq!(backend.packets(), 10);
        assert_eq!(backend.stored_ids("eager"), (1..=10).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shard_writes_respect_rate_ceiling() -> anyhow::Result<()> {
        let backend = Arc::new(MemoryBackend::new(2).with_max_rps(20));
        let synapse = Synapse::with_options(backend.clone(), batching_options(5, 2))?;

        let packets = (0..30).map(|i| Packet::new(format!("m{}", i))).collect();
        synapse.send_pack("throttled", packets).await?;

        let mut starts: BTreeMap<usize, Vec<tokio::time::Instant>> = BTreeMap::new();
        for record in backend.batch_log("throttled") {
            assert!(record.size <= 5);
            starts.entry(record.shard).or_default().push(record.started);
        }
        assert_eq!(starts.len(), 2);
        for (shard, times) in starts {
            assert!(times.len() >= 3, "shard {} wrote {} batches", shard, times.len());
            for pair in times.windows(2) {
                let gap = pair[1] - pair[0];
                assert!(gap >= Duration::from_millis(50), "shard {} batches {:?} apart", shard, gap);
            }
        }
        Ok(())
    }
}
