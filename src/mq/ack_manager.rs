use std::collections::BTreeMap;
use std::sync::Arc;
use async_channel::{bounded, Receiver, Sender};
use tokio::sync::watch;
use log::{debug, info};

use crate::mq::Core;
use crate::mq::channels::abandon_inbound;
use crate::mq::packet::{ControlCommand, Packet, QueueName, QueueElementIndex};

/// 已写入但尚未推进写指针的包，按序号排序
///
/// Packets the backend accepted but the writer pointer does not yet cover,
/// ordered by sequence number.
#[derive(Debug)]
pub(crate) struct PendingConfirmations {
    last_saved_id: QueueElementIndex,
    blocks: BTreeMap<QueueElementIndex, Packet>,
}

impl PendingConfirmations {
    pub(crate) fn new(last_saved_id: QueueElementIndex) -> Self {
        PendingConfirmations { last_saved_id, blocks: BTreeMap::new() }
    }

    pub(crate) fn last_saved_id(&self) -> QueueElementIndex {
        self.last_saved_id
    }

    pub(crate) fn len(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn min_id(&self) -> Option<QueueElementIndex> {
        self.blocks.keys().next().copied()
    }

    /// 合并新确认；同序号后到者覆盖，已推进过的序号被忽略。返回被忽略的数量
    ///
    /// Merge a batch of confirmations. A repeated id replaces the pending entry;
    /// ids the pointer already covers are dropped. Returns how many were dropped.
    pub(crate) fn merge(&mut self, batch: Vec<Packet>) -> usize {
        let mut stale = 0;
        for packet in batch {
            if packet.db_id <= self.last_saved_id {
                stale += 1;
                continue;
            }
            self.blocks.insert(packet.db_id, packet);
        }
        stale
    }

    /// 从 `last_saved_id + 1` 开始无间隙连续段的末尾；无法推进时为 None
    ///
    /// End of the gap-free run starting at `last_saved_id + 1`, if there is one.
    pub(crate) fn contiguous_end(&self) -> Option<QueueElementIndex> {
        let mut end = self.last_saved_id;
        for &id in self.blocks.keys() {
            if id != end + 1 {
                break;
            }
            end = id;
        }
        (end > self.last_saved_id).then_some(end)
    }

    /// 取出直到 `end`（含）的包；指针持久化后再调用 `commit`
    ///
    /// Detach the packets up to and including `end`. Call `commit` once the
    /// pointer is durable.
    pub(crate) fn take_through(&mut self, end: QueueElementIndex) -> Vec<Packet> {
        let rest = self.blocks.split_off(&(end + 1));
        std::mem::replace(&mut self.blocks, rest).into_values().collect()
    }

    pub(crate) fn commit(&mut self, end: QueueElementIndex) {
        debug_assert!(end >= self.last_saved_id);
        self.last_saved_id = end;
    }
}

impl Core {
    /// 确认管理器收集阶段：同步阶段空闲时把整个缓冲交给它
    ///
    /// Collector stage of the ack manager. Confirmations keep arriving while the
    /// sync stage persists; whenever the sync stage is idle the whole buffer is
    /// handed over through a single-slot channel.
    pub(crate) async fn queue_ack_man(
        self: Arc<Self>,
        queue: QueueName,
        last_saved_id: QueueElementIndex,
        rx: Receiver<Packet>,
        mut control: watch::Receiver<ControlCommand>,
    ) {
        let (block_tx, block_rx) = bounded::<Vec<Packet>>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        tokio::spawn(Arc::clone(&self).queue_ack_man_sync_section(
            queue.clone(),
            last_saved_id,
            block_rx,
            done_tx,
            self.control_channel(),
        ));

        let mut confirmations: Vec<Packet> = Vec::new();
        let mut now_writing = false;
        loop {
            tokio::select! {
                biased;
                changed = control.changed() => {
                    if changed.is_err() || control.borrow().terminate {
                        debug!("确认管理器退出: {}, 丢弃: {} / Ack manager terminated: {}, abandoned: {}",
                               queue, confirmations.len(), queue, confirmations.len());
                        break;
                    }
                }
                Ok(()) = done_rx.recv() => {
                    if confirmations.is_empty() {
                        now_writing = false;
                    } else if block_tx.send(std::mem::take(&mut confirmations)).await.is_err() {
                        break;
                    }
                }
                packet = rx.recv() => {
                    let Ok(packet) = packet else {
                        break;
                    };
                    confirmations.push(packet);
                    if !now_writing {
                        if block_tx.send(std::mem::take(&mut confirmations)).await.is_err() {
                            break;
                        }
                        now_writing = true;
                    } else if self.tracing() {
                        info!("同步进行中，缓冲确认: {} 条 / Sync already running, buffered confirmations: {}",
                              confirmations.len(), confirmations.len());
                    }
                }
            }
        }
        abandon_inbound("确认管理器 / ack manager", &queue, &rx);
    }

    /// 确认管理器同步阶段：拥有 `last_saved_id`，只在连续前缀上推进写指针
    ///
    /// Sync stage of the ack manager. It owns `last_saved_id` and advances the
    /// writer pointer only over the contiguous run after it: the run is
    /// detached, the pointer persisted (retrying until it succeeds), and only
    /// then are the producers of the run released.
    async fn queue_ack_man_sync_section(
        self: Arc<Self>,
        queue: QueueName,
        last_saved_id: QueueElementIndex,
        block_rx: Receiver<Vec<Packet>>,
        done_tx: Sender<()>,
        mut control: watch::Receiver<ControlCommand>,
    ) {
        let mut pending = PendingConfirmations::new(last_saved_id);
        loop {
            let blocks = tokio::select! {
                biased;
                changed = control.changed() => {
                    if changed.is_err() || control.borrow().terminate {
                        return;
                    }
                    continue;
                }
                blocks = block_rx.recv() => match blocks {
                    Ok(blocks) => blocks,
                    Err(_) => return,
                },
            };

            let stale = pending.merge(blocks);
            if stale > 0 {
                debug!("忽略已确认的重复确认，队列: {}, 数量: {} / Ignored confirmations at or below the pointer, queue: {}, count: {}",
                       queue, stale, queue, stale);
            }

            match pending.contiguous_end() {
                None => {
                    if self.tracing() {
                        info!("暂不保存指针，队列: {}, 最小序号: {:?}, 已保存: {} / Not saving pointer, queue: {}, min id: {:?}, last saved: {}",
                              queue, pending.min_id(), pending.last_saved_id(), queue, pending.min_id(), pending.last_saved_id());
                    }
                }
                Some(end) => {
                    let mut confirmed = pending.take_through(end);
                    if self.tracing() {
                        info!("推进写指针，队列: {}, {} -> {}, 剩余: {} / Advancing writer pointer, queue: {}, {} -> {}, pending: {}",
                              queue, pending.last_saved_id(), end, pending.len(), queue, pending.last_saved_id(), end, pending.len());
                    }
                    if !self.save_queue_writer_ptr(&queue, end).await {
                        return;
                    }
                    pending.commit(end);
                    for packet in confirmed.iter_mut() {
                        packet.confirm();
                    }
                }
            }

            if done_tx.send(()).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::backend::MemoryBackend;
    use crate::mq::{Synapse, SynapseOptions, SynapseBackend, WRITER_POINTER};

    fn packet(id: QueueElementIndex) -> Packet {
        Packet::stored(id, Arc::new(format!("p{}", id).into_bytes()))
    }

    fn advance(pending: &mut PendingConfirmations) -> QueueElementIndex {
        if let Some(end) = pending.contiguous_end() {
            pending.take_through(end);
            pending.commit(end);
        }
        pending.last_saved_id()
    }

    #[test]
    fn out_of_order_shard_completion_trace() {
        let mut pending = PendingConfirmations::new(0);
        let mut trace = Vec::new();
        for id in [3, 1, 2, 5, 4] {
            pending.merge(vec![packet(id)]);
            trace.push(advance(&mut pending));
        }
        assert_eq!(trace, vec![0, 1, 2, 2, 5]);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn duplicates_do_not_advance_twice() {
        let mut pending = PendingConfirmations::new(0);
        pending.merge(vec![packet(2), packet(2)]);
        assert_eq!(pending.len(), 1);
        assert_eq!(advance(&mut pending), 0);

        pending.merge(vec![packet(1)]);
        assert_eq!(advance(&mut pending), 2);

        assert_eq!(pending.merge(vec![packet(1), packet(2)]), 2);
        assert_eq!(pending.contiguous_end(), None);
        assert_eq!(pending.last_saved_id(), 2);
    }

    #[test]
    fn take_through_keeps_the_gap_tail() {
        let mut pending = PendingConfirmations::new(10);
        pending.merge((11..=14).chain(16..=17).map(packet).collect());
        assert_eq!(pending.contiguous_end(), Some(14));
        let run: Vec<QueueElementIndex> = pending.take_through(14).iter().map(|p| p.db_id).collect();
        assert_eq!(run, vec![11, 12, 13, 14]);
        pending.commit(14);
        assert_eq!(pending.min_id(), Some(16));
        assert_eq!(pending.contiguous_end(), None);
    }

    async fn wait_for_writer_ptr(backend: &MemoryBackend, queue: &str, expected: QueueElementIndex) -> anyhow::Result<()> {
        for _ in 0..500 {
            if backend.get_ptr(queue, WRITER_POINTER).await? == expected {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("writer pointer never reached {}", expected)
    }

    #[tokio::test]
    async fn confirmations_release_only_contiguous_prefix() -> anyhow::Result<()> {
        let backend = Arc::new(MemoryBackend::new(2));
        let synapse = Synapse::with_options(backend.clone(), SynapseOptions::default())?;
        let core = Arc::clone(synapse.core());
        let ack = core.queue_ack_man_channel("acks", 0).await;

        let mut confirmations = std::collections::HashMap::new();
        let mut confirmable = |id: QueueElementIndex| -> Packet {
            let (tx, rx) = async_channel::bounded(1);
            let mut p = packet(id);
            p.set_confirmation(tx);
            confirmations.insert(id, rx);
            p
        };
        let (p1, p2, p3, p4, p5) = (confirmable(1), confirmable(2), confirmable(3), confirmable(4), confirmable(5));

        ack.send(p3).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.get_ptr("acks", WRITER_POINTER).await?, 0);

        ack.send(p1).await?;
        wait_for_writer_ptr(&backend, "acks", 1).await?;
        ack.send(p2).await?;
        wait_for_writer_ptr(&backend, "acks", 3).await?;

        ack.send(p5).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.get_ptr("acks", WRITER_POINTER).await?, 3);
        assert!(confirmations[&5].try_recv().is_err());

        ack.send(p4).await?;
        wait_for_writer_ptr(&backend, "acks", 5).await?;

        for id in 1..=5 {
            assert_eq!(confirmations[&id].recv().await?, id);
        }
        assert_eq!(backend.pointer_history("acks", WRITER_POINTER), vec![1, 3, 5]);
        Ok(())
    }
}
