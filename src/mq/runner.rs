use std::sync::Arc;
use async_channel::Receiver;
use tokio::sync::watch;
use log::{debug, error, info, warn};

use crate::mq::Core;
use crate::mq::channels::abandon_inbound;
use crate::mq::packet::{ControlCommand, Packet, QueueName, QueueElementIndex, WRITER_POINTER};

impl Core {
    /// 队列运行器：唯一的序号分配者
    ///
    /// The queue runner is the only task that increments the queue counter, so
    /// sequence assignment is gap-free without coordination. It recovers the
    /// counter from the writer pointer (retrying until the backend answers),
    /// then stamps each inbound packet with `counter + 1` and routes it to the
    /// writer shard `id mod shards`.
    pub(crate) async fn queue_runner(
        self: Arc<Self>,
        queue: QueueName,
        rx: Receiver<Packet>,
        mut control: watch::Receiver<ControlCommand>,
    ) {
        let Some(mut queue_counter) = self.recover_queue_counter(&queue, &mut control).await else {
            abandon_inbound("队列运行器 / queue runner", &queue, &rx);
            return;
        };
        let last_saved_id = queue_counter;
        info!("队列运行器已启动，队列: {}, 计数器: {}, 主机: {} / Queue runner started, queue: {}, counter: {}, host: {}",
              queue, queue_counter, self.host(), queue, queue_counter, self.host());

        loop {
            tokio::select! {
                biased;
                changed = control.changed() => {
                    if changed.is_err() || control.borrow().terminate {
                        debug!("队列运行器退出: {} / Queue runner terminated: {}", queue, queue);
                        break;
                    }
                }
                packet = rx.recv() => {
                    let Ok(mut packet) = packet else {
                        break;
                    };
                    queue_counter += 1;
                    packet.db_id = queue_counter;
                    if self.tracing() {
                        info!("分配序号，队列: {}, 包: {:?} / Assigned id, queue: {}, packet: {:?}", queue, packet, queue, packet);
                    }
                    let writer = self.queue_writer_channel(&queue, packet.db_id, last_saved_id).await;
                    if writer.send(packet).await.is_err() {
                        warn!("写入分片已关闭，运行器退出: {} / Writer shard closed, runner exiting: {}", queue, queue);
                        break;
                    }
                }
            }
        }
        abandon_inbound("队列运行器 / queue runner", &queue, &rx);
    }

    async fn recover_queue_counter(
        &self,
        queue: &str,
        control: &mut watch::Receiver<ControlCommand>,
    ) -> Option<QueueElementIndex> {
        if control.borrow().terminate {
            return None;
        }
        loop {
            match self.backend.get_ptr(queue, WRITER_POINTER).await {
                Ok(counter) => return Some(counter),
                Err(e) => {
                    error!("读取队列计数器失败，队列: {}, 错误: {:#} / Error reading queue counter, queue: {}, error: {:#}",
                           queue, e, queue, e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.options.retry_delay) => {}
                changed = control.changed() => {
                    if changed.is_err() || control.borrow().terminate {
                        return None;
                    }
                }
            }
        }
    }
}
