use std::sync::Arc;
use async_channel::{bounded, Receiver, Sender};
use log::debug;

use crate::mq::Core;
use crate::mq::packet::{Packet, QueueElementIndex};

impl Core {
    /// 获取队列运行器入口通道；首次使用时创建运行器
    ///
    /// Inbound channel of the queue runner; the runner is spawned on first use.
    pub(crate) async fn queue_runner_channel(self: &Arc<Self>, queue: &str) -> Sender<Packet> {
        self.runners.get_or_create(queue, || {
            debug!("启动队列运行器: {} / Spawning queue runner: {}", queue, queue);
            let (tx, rx) = bounded(self.options.channel_depth);
            tokio::spawn(Arc::clone(self).queue_runner(queue.to_string(), rx, self.control_channel()));
            tx
        }).await
    }

    /// 获取负责 `db_id` 的写入分片通道（`db_id mod 分片数`）
    ///
    /// Inbound channel of the writer shard owning `db_id` (`db_id mod shards`).
    /// All shards of a queue are spawned together on first use.
    pub(crate) async fn queue_writer_channel(self: &Arc<Self>, queue: &str, db_id: QueueElementIndex, last_saved_id: QueueElementIndex) -> Sender<Packet> {
        let shards = self.writers.get_or_create(queue, || {
            let io_threads = self.queue_writer_io_threads(queue);
            debug!("启动 {} 个写入分片，队列: {} / Spawning {} writer shards, queue: {}", io_threads, queue, io_threads, queue);
            let channels: Vec<Sender<Packet>> = (0..io_threads)
                .map(|shard| {
                    let (tx, rx) = bounded(self.options.channel_depth);
                    tokio::spawn(Arc::clone(self).queue_writer(shard, queue.to_string(), last_saved_id, rx, self.control_channel()));
                    tx
                })
                .collect();
            Arc::new(channels)
        }).await;

        let shard = (db_id % shards.len() as QueueElementIndex) as usize;
        shards[shard].clone()
    }

    /// 获取确认管理器入口通道；首次使用时创建
    ///
    /// Inbound channel of the queue's ack manager; spawned on first use.
    pub(crate) async fn queue_ack_man_channel(self: &Arc<Self>, queue: &str, last_saved_id: QueueElementIndex) -> Sender<Packet> {
        self.ack_managers.get_or_create(queue, || {
            debug!("启动确认管理器，队列: {}, 已保存: {} / Spawning ack manager, queue: {}, last saved: {}",
                   queue, last_saved_id, queue, last_saved_id);
            let (tx, rx) = bounded(self.options.channel_depth);
            tokio::spawn(Arc::clone(self).queue_ack_man(queue.to_string(), last_saved_id, rx, self.control_channel()));
            tx
        }).await
    }

    fn queue_writer_io_threads(&self, queue: &str) -> usize {
        self.backend.default_queue_parallelism(queue).max(1)
    }
}

/// 关闭入口通道并丢弃剩余的包，等待这些包的生产者随即收到错误
///
/// Close a worker's inbound channel and drop whatever is still queued, so the
/// producers waiting on those packets fail instead of hanging.
pub(crate) fn abandon_inbound(worker: &str, queue: &str, rx: &Receiver<Packet>) {
    rx.close();
    let mut abandoned = 0usize;
    while rx.try_recv().is_ok() {
        abandoned += 1;
    }
    if abandoned > 0 {
        debug!("{} 退出时丢弃 {} 个包，队列: {} / {} abandoned {} packets on exit, queue: {}",
               worker, abandoned, queue, worker, abandoned, queue);
    }
}
