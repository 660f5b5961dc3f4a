use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use async_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};

use crate::mq::packet::QueueElementIndex;
use crate::mq::receiver::{ReaderContext, StopSignal, WorkerGuard};

/// 乱序到达、尚未持久化的消费确认（有序集合，自动去重）
///
/// Consumer acks that arrived out of order and are not yet covered by the
/// persisted pointer. Kept ordered and de-duplicated.
#[derive(Debug, Default)]
pub(crate) struct AckBuffer {
    ids: BTreeSet<QueueElementIndex>,
}

impl AckBuffer {
    /// Returns `false` if `id` was already buffered.
    pub(crate) fn push(&mut self, id: QueueElementIndex) -> bool {
        self.ids.insert(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn min(&self) -> Option<QueueElementIndex> {
        self.ids.first().copied()
    }

    /// 丢弃不大于 `last_acked` 的确认，取出紧接其后的连续段，返回新指针
    ///
    /// Drop ids at or below `last_acked`, then remove the run of consecutive
    /// ids starting at `last_acked + 1`. Returns the new pointer, or `None` if
    /// the run is empty.
    pub(crate) fn drain_contiguous(&mut self, last_acked: QueueElementIndex) -> Option<QueueElementIndex> {
        let pending = self.ids.split_off(&(last_acked + 1));
        let mut ptr = last_acked;
        for &id in &pending {
            if id != ptr + 1 {
                break;
            }
            ptr = id;
        }
        self.ids = pending;
        if ptr == last_acked {
            return None;
        }
        self.ids = self.ids.split_off(&(ptr + 1));
        Some(ptr)
    }
}

impl ReaderContext {
    /// 消费确认管理器：缓冲确认，同一时间至多一个指针写入
    ///
    /// Reader ack manager. Buffers acks and, whenever no pointer write is in
    /// flight, launches one for the contiguous run after the current pointer.
    /// A finished write re-checks the buffer so the tail of a burst is not
    /// left waiting for another ack.
    pub(crate) async fn reader_ack_manager(self: Arc<Self>, ack_rx: Receiver<QueueElementIndex>, mut stop: StopSignal, _worker: WorkerGuard) {
        let (done_tx, done_rx) = bounded::<QueueElementIndex>(1);
        let warn_len = self.core.options.ack_buffer_warn_len.max(1);
        let mut buffer = AckBuffer::default();
        // highest id covered by the persisted pointer or the write in flight
        let mut claimed = self.last_acked_id.load(Ordering::SeqCst);
        let mut writing = false;

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                Ok(ptr) = done_rx.recv() => {
                    writing = false;
                    if self.core.tracing() {
                        info!("消费指针已保存，队列: {}, 消费者: {}, 指针: {} / Reader pointer saved, queue: {}, consumer: {}, ptr: {}",
                              self.queue, self.consumer, ptr, self.queue, self.consumer, ptr);
                    }
                }
                ack = ack_rx.recv() => {
                    let Ok(id) = ack else {
                        break;
                    };
                    if id <= claimed {
                        warn!("重复或过期的确认被忽略，队列: {}, 消费者: {}, id: {}, 指针: {} / Duplicate or late ack ignored, queue: {}, consumer: {}, id: {}, pointer: {}",
                              self.queue, self.consumer, id, claimed, self.queue, self.consumer, id, claimed);
                        continue;
                    }
                    if buffer.push(id) && buffer.len() % warn_len == 0 {
                        warn!("确认缓冲过大，消费者可能卡住，队列: {}, 消费者: {}, 缓冲: {}, 指针: {}, 最小: {:?} / Ack buffer growing, consumer may be stuck, queue: {}, consumer: {}, buffered: {}, pointer: {}, min: {:?}",
                              self.queue, self.consumer, buffer.len(), claimed, buffer.min(), self.queue, self.consumer, buffer.len(), claimed, buffer.min());
                    }
                }
            }

            if !writing && buffer.min() == Some(claimed + 1) {
                if let Some(ptr) = buffer.drain_contiguous(claimed) {
                    if self.core.tracing() {
                        info!("开始写消费指针，队列: {}, {} -> {}, 剩余: {} / Starting reader pointer write, queue: {}, {} -> {}, buffered: {}",
                              self.queue, claimed, ptr, buffer.len(), self.queue, claimed, ptr, buffer.len());
                    }
                    claimed = ptr;
                    writing = true;
                    tokio::spawn(Arc::clone(&self).flush_acks(ptr, done_tx.clone(), self.enter_worker()));
                }
            }
            self.buffered_acks.store(buffer.len(), Ordering::SeqCst);
        }
        debug!("消费确认管理器退出，队列: {}, 消费者: {}, 丢弃缓冲: {} / Reader ack manager terminated, queue: {}, consumer: {}, abandoned: {}",
               self.queue, self.consumer, buffer.len(), self.queue, self.consumer, buffer.len());
    }

    /// 持久化消费指针（失败重试），成功后发布新的 `last_acked_id`
    ///
    /// Persist the consumer pointer, retrying until it succeeds, then publish it.
    async fn flush_acks(self: Arc<Self>, ptr: QueueElementIndex, done_tx: Sender<QueueElementIndex>, _worker: WorkerGuard) {
        let mut attempt: u64 = 0;
        while let Err(e) = self.core.backend.write_ptr(&self.queue, &self.consumer, ptr).await {
            attempt += 1;
            if !self.core.retry_pause("移动消费指针 / moving reader pointer", &self.queue, attempt, &e).await || self.is_closed() {
                return;
            }
        }
        self.last_acked_id.store(ptr, Ordering::SeqCst);
        let _ = done_tx.send(ptr).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(start: QueueElementIndex, acks: &[QueueElementIndex]) -> Vec<QueueElementIndex> {
        let mut buffer = AckBuffer::default();
        let mut ptr = start;
        acks.iter()
            .map(|&id| {
                if id > ptr {
                    buffer.push(id);
                }
                if let Some(next) = buffer.drain_contiguous(ptr) {
                    ptr = next;
                }
                ptr
            })
            .collect()
    }

    #[test]
    fn consumer_ack_reordering_trace() {
        assert_eq!(trace(0, &[2, 1, 4, 3]), vec![0, 2, 2, 4]);
    }

    #[test]
    fn late_ack_leaves_pointer() {
        assert_eq!(trace(5, &[3, 6]), vec![5, 6]);
    }

    #[test]
    fn drain_deduplicates_and_keeps_the_gap_tail() {
        let mut buffer = AckBuffer::default();
        for id in [4, 2, 2, 3, 7, 1] {
            buffer.push(id);
        }
        assert_eq!(buffer.drain_contiguous(1), Some(4));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.min(), Some(7));
        assert_eq!(buffer.drain_contiguous(4), None);
    }

    #[test]
    fn min_tracks_pushes_and_drains() {
        let mut buffer = AckBuffer::default();
        assert_eq!(buffer.min(), None);
        assert!(buffer.push(9));
        assert!(buffer.push(3));
        assert!(!buffer.push(3));
        assert_eq!(buffer.min(), Some(3));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.drain_contiguous(2), Some(3));
        assert_eq!(buffer.min(), Some(9));
        assert_eq!(buffer.drain_contiguous(5), None);
        assert_eq!(buffer.min(), Some(9));
        assert_eq!(buffer.drain_contiguous(8), Some(9));
        assert_eq!(buffer.min(), None);
    }
}
