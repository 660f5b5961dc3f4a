use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use async_channel::{bounded, Sender};
use async_stream::try_stream;
use tokio::sync::watch;
use tokio_stream::Stream;
use log::{debug, error, info, warn};

use crate::mq::Core;
use crate::mq::error::SynapseError;
use crate::mq::packet::{ConsumerId, ControlCommand, Packet, QueueName, QueueElementIndex, WRITER_POINTER};

/// 接收者工作任务的停止信号：实例终止或接收者关闭
///
/// Stop signal of a receiver's workers: fires when the whole `Synapse` is
/// terminated or when this receiver is closed.
pub(crate) struct StopSignal {
    core: watch::Receiver<ControlCommand>,
    own: watch::Receiver<ControlCommand>,
}

impl StopSignal {
    pub(crate) fn is_set(&self) -> bool {
        self.core.borrow().terminate || self.own.borrow().terminate
    }

    /// 等待直到停止（取消安全）
    ///
    /// Resolves once stopped. Cancel safe.
    pub(crate) async fn stopped(&mut self) {
        loop {
            if self.is_set() {
                return;
            }
            tokio::select! {
                changed = self.core.changed() => if changed.is_err() { return },
                changed = self.own.changed() => if changed.is_err() { return },
            }
        }
    }
}

/// 单个 (队列, 消费者) 的共享状态
///
/// State shared by the receiver body, the reader ack manager and the handle.
pub(crate) struct ReaderContext {
    pub(crate) core: Arc<Core>,
    pub(crate) queue: QueueName,
    pub(crate) consumer: ConsumerId,
    pub(crate) last_acked_id: AtomicU64,
    pub(crate) last_read_id: AtomicU64,
    pub(crate) buffered_acks: AtomicUsize,
    control: watch::Sender<ControlCommand>,
    workers: watch::Sender<usize>,
}

impl ReaderContext {
    pub(crate) fn stop_signal(&self) -> StopSignal {
        StopSignal {
            core: self.core.control_channel(),
            own: self.control.subscribe(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.core.is_terminated() || self.control.borrow().terminate
    }

    fn close(&self) {
        if !self.control.borrow().terminate {
            debug!("关闭接收者，队列: {}, 消费者: {} / Closing receiver, queue: {}, consumer: {}",
                   self.queue, self.consumer, self.queue, self.consumer);
            self.control.send_replace(ControlCommand::terminate());
        }
    }

    pub(crate) fn enter_worker(self: &Arc<Self>) -> WorkerGuard {
        self.workers.send_modify(|running| *running += 1);
        WorkerGuard(Arc::clone(self))
    }

    async fn workers_stopped(&self) {
        let mut running = self.workers.subscribe();
        let _ = running.wait_for(|&n| n == 0).await;
    }
}

/// 接收者工作任务（主体、确认管理器、指针写入）的计数守卫
///
/// Held by every running worker of a receiver: the body, the reader ack
/// manager and each pointer write. The last one to exit releases the
/// consumer's registry entry.
pub(crate) struct WorkerGuard(Arc<ReaderContext>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut idle = false;
        self.0.workers.send_modify(|running| {
            *running = running.saturating_sub(1);
            idle = *running == 0;
        });
        if idle {
            self.0.core.readers.release(&self.0);
        }
    }
}

/// 活跃接收者登记表：每个 (队列, 消费者) 至多一个
///
/// Live receivers keyed by `(queue, consumer)`. An entry is held from the
/// moment a receiver is requested until it is closed and all of its workers
/// have exited, so a consumer pointer never has two writers.
#[derive(Default)]
pub(crate) struct ReaderRegistry {
    entries: Mutex<HashMap<(QueueName, ConsumerId), Weak<ReaderContext>>>,
}

impl ReaderRegistry {
    /// 登记 `ctx`；若该消费者已有打开的接收者则失败
    ///
    /// Register `ctx`. Fails while another receiver of the same consumer is
    /// open; otherwise returns the closed predecessor, if its workers may
    /// still be running.
    fn claim(&self, ctx: &Arc<ReaderContext>) -> Result<Option<Arc<ReaderContext>>, SynapseError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (ctx.queue.clone(), ctx.consumer.clone());
        let previous = entries.get(&key).and_then(Weak::upgrade);
        if previous.as_ref().is_some_and(|prev| !prev.is_closed()) {
            return Err(SynapseError::ReceiverBusy {
                queue: ctx.queue.clone(),
                consumer: ctx.consumer.clone(),
            });
        }
        entries.insert(key, Arc::downgrade(ctx));
        Ok(previous)
    }

    fn release(&self, ctx: &ReaderContext) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (ctx.queue.clone(), ctx.consumer.clone());
        if entries.get(&key).is_some_and(|entry| std::ptr::eq(entry.as_ptr(), ctx)) {
            entries.remove(&key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

enum PageOutcome {
    Delivered(QueueElementIndex),
    Empty,
    Stopped,
}

/// 消费者句柄：从数据通道取包，通过 `ack` 确认
///
/// Consumer handle. Packets arrive in ascending sequence order on the data
/// channel; acknowledge each processed packet with [`Receiver::ack`] (in any
/// order). The consumer's pointer only advances over a contiguous run of acks,
/// so after a restart delivery resumes right after the last such run.
///
/// A consumer has at most one open receiver per `Synapse`; asking for a
/// second one fails with [`SynapseError::ReceiverBusy`].
///
/// Dropping the handle closes it. Closing does not drain: acks not yet
/// persisted are abandoned and their packets are delivered again next time.
pub struct Receiver {
    ctx: Arc<ReaderContext>,
    data_rx: async_channel::Receiver<Packet>,
    ack_tx: Sender<QueueElementIndex>,
}

impl Receiver {
    pub(crate) async fn spawn(core: Arc<Core>, queue: &str, consumer: &str, buffer_size: usize) -> anyhow::Result<Receiver> {
        let (control, _) = watch::channel(ControlCommand::default());
        let (workers, _) = watch::channel(0);
        let ctx = Arc::new(ReaderContext {
            core,
            queue: queue.to_string(),
            consumer: consumer.to_string(),
            last_acked_id: AtomicU64::new(0),
            last_read_id: AtomicU64::new(0),
            buffered_acks: AtomicUsize::new(0),
            control,
            workers,
        });

        if let Some(previous) = ctx.core.readers.claim(&ctx)? {
            debug!("等待上一个接收者退出，队列: {}, 消费者: {} / Waiting for previous receiver to exit, queue: {}, consumer: {}",
                   queue, consumer, queue, consumer);
            previous.workers_stopped().await;
        }
        let reader_ptr = match load_reader_ptr(&ctx.core, queue, consumer).await {
            Ok(ptr) => ptr,
            Err(e) => {
                ctx.close();
                ctx.core.readers.release(&ctx);
                return Err(e);
            }
        };
        ctx.last_acked_id.store(reader_ptr, Ordering::SeqCst);
        ctx.last_read_id.store(reader_ptr, Ordering::SeqCst);

        let (data_tx, data_rx) = bounded(buffer_size.max(1));
        let (ack_tx, ack_rx) = bounded(ctx.core.options.receiver_ack_chan_len);

        tokio::spawn(Arc::clone(&ctx).reader_ack_manager(ack_rx, ctx.stop_signal(), ctx.enter_worker()));
        tokio::spawn(Arc::clone(&ctx).receiver_body(data_tx, ctx.stop_signal(), ctx.enter_worker()));

        info!("接收者已启动，队列: {}, 消费者: {}, 指针: {} / Receiver started, queue: {}, consumer: {}, pointer: {}",
              queue, consumer, reader_ptr, queue, consumer, reader_ptr);
        Ok(Receiver { ctx, data_rx, ack_tx })
    }

    pub fn queue_name(&self) -> &str {
        &self.ctx.queue
    }

    pub fn consumer_id(&self) -> &str {
        &self.ctx.consumer
    }

    /// 数据通道（可克隆，用于 select 等场景）
    ///
    /// The inbound packet channel, for callers that want to select on it directly.
    pub fn data_channel(&self) -> &async_channel::Receiver<Packet> {
        &self.data_rx
    }

    /// 接收下一个包；接收者关闭且通道为空时返回错误
    ///
    /// Receive the next packet. Fails once the receiver is closed and the
    /// channel is drained.
    pub async fn recv(&self) -> anyhow::Result<Packet> {
        self.data_rx.recv().await.map_err(|_| self.closed_error().into())
    }

    pub fn try_recv(&self) -> Option<Packet> {
        self.data_rx.try_recv().ok()
    }

    /// 带超时接收；超时返回 `Ok(None)`
    ///
    /// Receive with a timeout; `Ok(None)` when nothing arrived in time.
    pub async fn recv_timeout(&self, duration: Duration) -> anyhow::Result<Option<Packet>> {
        match tokio::time::timeout(duration, self.recv()).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// 等待至少一个包，然后取出已就绪的包，最多 `n` 个
    ///
    /// Wait for at least one packet, then take whatever else is ready, up to `n`.
    pub async fn recv_batch(&self, n: usize) -> anyhow::Result<Vec<Packet>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut batch = Vec::with_capacity(n.min(1024));
        batch.push(self.recv().await?);
        while batch.len() < n {
            match self.data_rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    /// 包流；接收者关闭后以错误结束
    ///
    /// Stream of packets; ends with an error once the receiver is closed.
    pub fn stream(&self) -> impl Stream<Item = anyhow::Result<Packet>> + '_ {
        try_stream! {
            loop {
                let packet = self.recv().await?;
                yield packet;
            }
        }
    }

    /// 确认已处理的包（顺序任意）
    ///
    /// Acknowledge a processed packet. Acks may arrive in any order.
    pub async fn ack(&self, packet: &Packet) -> anyhow::Result<()> {
        self.ack_id(packet.db_id).await
    }

    pub async fn ack_id(&self, id: QueueElementIndex) -> anyhow::Result<()> {
        if self.ctx.is_closed() {
            return Err(self.closed_error().into());
        }
        if self.ctx.core.tracing() {
            info!("确认，队列: {}, 消费者: {}, id: {} / ack, queue: {}, consumer: {}, id: {}",
                  self.ctx.queue, self.ctx.consumer, id, self.ctx.queue, self.ctx.consumer, id);
        }
        self.ack_tx.send(id).await.map_err(|_| self.closed_error())?;
        Ok(())
    }

    /// 已持久化的消费指针
    ///
    /// The consumer pointer as last persisted.
    pub fn last_acked_id(&self) -> QueueElementIndex {
        self.ctx.last_acked_id.load(Ordering::SeqCst)
    }

    /// 最后一次推入数据通道的页的最大序号
    ///
    /// Highest id of the last page pushed onto the data channel.
    pub fn last_read_id(&self) -> QueueElementIndex {
        self.ctx.last_read_id.load(Ordering::SeqCst)
    }

    /// 等待形成连续段的确认数
    ///
    /// Acks waiting for a gap before them to be filled.
    pub fn buffered_acks(&self) -> usize {
        self.ctx.buffered_acks.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    /// 停止读取与确认任务（不排空）
    ///
    /// Stop the reading and ack workers. Does not drain.
    pub fn close(&self) {
        self.ctx.close();
    }

    fn closed_error(&self) -> SynapseError {
        SynapseError::ReceiverClosed {
            queue: self.ctx.queue.clone(),
            consumer: self.ctx.consumer.clone(),
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.ctx.close();
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("queue", &self.ctx.queue)
            .field("consumer", &self.ctx.consumer)
            .field("last_acked_id", &self.last_acked_id())
            .field("last_read_id", &self.last_read_id())
            .finish()
    }
}

async fn load_reader_ptr(core: &Core, queue: &str, consumer: &str) -> anyhow::Result<QueueElementIndex> {
    let mut attempt: u64 = 0;
    loop {
        match core.backend.get_ptr(queue, consumer).await {
            Ok(ptr) => return Ok(ptr),
            Err(e) => {
                attempt += 1;
                if !core.retry_pause("读取消费指针 / reading consumer pointer", queue, attempt, &e).await {
                    return Err(SynapseError::Terminated { queue: queue.to_string() }.into());
                }
            }
        }
    }
}

impl ReaderContext {
    /// 接收者主体：追赶写指针，按页读取并按序推入数据通道
    ///
    /// Receiver body. Compares the consumer's read position with the queue's
    /// writer pointer; while behind, fetches pages of at most
    /// `reader_page_limit` ids and pushes them in ascending order. When caught
    /// up, after an empty page or after an error it sleeps one poll interval.
    async fn receiver_body(self: Arc<Self>, data_tx: Sender<Packet>, mut stop: StopSignal, _worker: WorkerGuard) {
        let poll_interval = self.core.options.receiver_poll_interval;
        let limit = self.core.options.reader_page_limit;
        let mut err_counter: u64 = 0;

        loop {
            if stop.is_set() {
                break;
            }
            let reader_ptr = self.last_read_id.load(Ordering::SeqCst);
            match self.core.backend.get_ptr(&self.queue, WRITER_POINTER).await {
                Ok(writer_ptr) if writer_ptr > reader_ptr => {
                    match self.read_data_from_backend(reader_ptr, writer_ptr, limit, &data_tx, &mut stop).await {
                        Ok(PageOutcome::Delivered(max_id)) => {
                            if self.core.tracing() {
                                info!("设置 last_read_id 为 {} / set last_read_id to {}", max_id, max_id);
                            }
                            self.last_read_id.store(max_id, Ordering::SeqCst);
                            continue;
                        }
                        Ok(PageOutcome::Empty) => {}
                        Ok(PageOutcome::Stopped) => break,
                        Err(e) => {
                            err_counter += 1;
                            error!("读取数据页失败，队列: {}, 消费者: {}, 错误次数: {}, 错误: {:#} / Error reading page, queue: {}, consumer: {}, err-counter: {}, error: {:#}",
                                   self.queue, self.consumer, err_counter, e, self.queue, self.consumer, err_counter, e);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    err_counter += 1;
                    error!("读取写指针失败，队列: {}, 错误次数: {}, 错误: {:#} / Error reading writer pointer, queue: {}, err-counter: {}, error: {:#}",
                           self.queue, err_counter, e, self.queue, err_counter, e);
                }
            }

            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        debug!("接收者主体退出，队列: {}, 消费者: {} / Receiver body terminated, queue: {}, consumer: {}",
               self.queue, self.consumer, self.queue, self.consumer);
    }

    /// 读取 `(reader_ptr, min(writer_ptr, reader_ptr + limit)]` 并按序推送
    ///
    /// Fetch ids `reader_ptr + 1 ..= min(writer_ptr, reader_ptr + limit)` and
    /// push them in ascending order. Only the gap-free prefix of the page is
    /// pushed; whatever follows a missing id is read again on the next poll.
    async fn read_data_from_backend(
        &self,
        reader_ptr: QueueElementIndex,
        writer_ptr: QueueElementIndex,
        limit: QueueElementIndex,
        data_tx: &Sender<Packet>,
        stop: &mut StopSignal,
    ) -> anyhow::Result<PageOutcome> {
        let max_id = writer_ptr.min(reader_ptr.saturating_add(limit));
        let ids: Vec<QueueElementIndex> = (reader_ptr + 1..=max_id).collect();

        let mut page = self.core.backend.read_batch(&self.queue, &ids).await?;
        if page.is_empty() {
            warn!("后端返回空页，队列: {}, 消费者: {}, 范围: {}..={} / Got empty result from backend, queue: {}, consumer: {}, range: {}..={}",
                  self.queue, self.consumer, reader_ptr + 1, max_id, self.queue, self.consumer, reader_ptr + 1, max_id);
            return Ok(PageOutcome::Empty);
        }
        page.sort_by_key(|p| p.db_id);
        page.dedup_by_key(|p| p.db_id);

        let contiguous = page.iter().zip(reader_ptr + 1..).take_while(|(p, id)| p.db_id == *id).count();
        if contiguous < ids.len() {
            warn!("数据页不完整，队列: {}, 消费者: {}, 请求: {}, 返回: {}, 连续: {} / Short page from backend, queue: {}, consumer: {}, requested: {}, got: {}, contiguous: {}",
                  self.queue, self.consumer, ids.len(), page.len(), contiguous, self.queue, self.consumer, ids.len(), page.len(), contiguous);
            if contiguous == 0 {
                return Ok(PageOutcome::Empty);
            }
            page.truncate(contiguous);
        }

        let (min_id, received_max) = (page[0].db_id, page[page.len() - 1].db_id);
        for packet in page {
            tokio::select! {
                biased;
                _ = stop.stopped() => return Ok(PageOutcome::Stopped),
                sent = data_tx.send(packet) => if sent.is_err() {
                    return Ok(PageOutcome::Stopped);
                },
            }
        }
        if self.core.tracing() {
            info!("页已推送，最小: {}, 最大: {} / Page pushed, min: {}, max: {}", min_id, received_max, min_id, received_max);
        }
        Ok(PageOutcome::Delivered(received_max))
    }
}
