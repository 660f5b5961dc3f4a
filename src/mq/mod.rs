use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use async_channel::Sender;
use tokio::sync::{oneshot, watch};
use log::{debug, info, error};

pub mod packet;
pub mod config;
pub mod error;
pub mod traits;
pub mod serializer;
pub mod registry;
pub mod receiver;
mod channels;
mod runner;
mod writer;
mod ack_manager;
mod reader_ack;

pub use packet::{Packet, QueueElementIndex, QueueName, ConsumerId, ControlCommand, WRITER_POINTER};
pub use config::{BackendConfig, QueueConfig, SynapseOptions, validate_queue_name};
pub use error::{ConfigError, SynapseError};
pub use traits::SynapseBackend;
pub use serializer::{SerializationFormat, SerializationHelper, SerializationError};
pub use registry::ChannelRegistry;
pub use receiver::Receiver;

use config::validate_consumer_id;
use receiver::ReaderRegistry;

/// 所有工作任务共享的上下文
///
/// Context shared by every worker task of one `Synapse`.
pub(crate) struct Core {
    pub(crate) backend: Arc<dyn SynapseBackend>,
    pub(crate) options: SynapseOptions,
    trace: AtomicBool,
    control: watch::Sender<ControlCommand>,
    pub(crate) runners: ChannelRegistry<QueueName, Sender<Packet>>,
    pub(crate) writers: ChannelRegistry<QueueName, Arc<Vec<Sender<Packet>>>>,
    pub(crate) ack_managers: ChannelRegistry<QueueName, Sender<Packet>>,
    pub(crate) readers: ReaderRegistry,
}

impl Core {
    pub(crate) fn tracing(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    pub(crate) fn host(&self) -> &str {
        self.backend.host_name()
    }

    /// 每个工作任务各自持有一个控制通道接收端
    ///
    /// Control channel handed to a newly spawned worker.
    pub(crate) fn control_channel(&self) -> watch::Receiver<ControlCommand> {
        self.control.subscribe()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.control.borrow().terminate
    }
}

/// 持久、有序、至少一次投递的消息队列
///
/// Durable, ordered, at-least-once message queue over a pluggable backend.
///
/// One `Synapse` owns the channel registries and workers of every queue it
/// touches. A queue must have a single active `Synapse` writing to it: sequence
/// numbers are recovered from the backend when the queue runner starts and are
/// not coordinated across processes.
#[derive(Clone)]
pub struct Synapse {
    core: Arc<Core>,
}

impl Synapse {
    /// 使用默认选项创建实例
    ///
    /// Create an instance with default options.
    pub fn new(backend: Arc<dyn SynapseBackend>) -> Self {
        Self::build(backend, SynapseOptions::default())
    }

    /// 使用自定义选项创建实例（选项非法时返回错误）
    ///
    /// Create an instance with custom options; invalid options are rejected.
    pub fn with_options(backend: Arc<dyn SynapseBackend>, options: SynapseOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self::build(backend, options))
    }

    fn build(backend: Arc<dyn SynapseBackend>, options: SynapseOptions) -> Self {
        let (control, _) = watch::channel(ControlCommand::default());
        backend.set_trace(options.trace);
        info!("创建 Synapse 实例，主机: {} / Creating Synapse instance, host: {}", backend.host_name(), backend.host_name());
        let core = Core {
            trace: AtomicBool::new(options.trace),
            backend,
            options,
            control,
            runners: ChannelRegistry::new(),
            writers: ChannelRegistry::new(),
            ack_managers: ChannelRegistry::new(),
            readers: ReaderRegistry::default(),
        };
        Synapse { core: Arc::new(core) }
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// 开关逐包跟踪日志（同时转发给后端）
    ///
    /// Toggle verbose per-packet logging; forwarded to the backend.
    pub fn set_trace(&self, trace: bool) {
        self.core.trace.store(trace, Ordering::Relaxed);
        self.core.backend.set_trace(trace);
    }

    pub fn backend(&self) -> &Arc<dyn SynapseBackend> {
        &self.core.backend
    }

    pub fn options(&self) -> &SynapseOptions {
        &self.core.options
    }

    /// 发送单个包，阻塞直到它及其之前的所有包都已持久化
    ///
    /// Send one packet. Resolves with the assigned sequence number once the
    /// packet and every lower-numbered packet of the queue are durable.
    pub async fn send(&self, queue: &str, packet: Packet) -> anyhow::Result<QueueElementIndex> {
        let confirmations = self.async_send(queue, packet).await?;
        let id = confirmations.recv().await.map_err(|_| SynapseError::Terminated { queue: queue.to_string() })?;
        Ok(id)
    }

    /// 批量发送，阻塞直到全部持久化
    ///
    /// Send a pack of packets; resolves once all of them are durable and ordered.
    pub async fn send_pack(&self, queue: &str, packets: Vec<Packet>) -> anyhow::Result<()> {
        let done = self.async_send_pack(queue, packets).await?;
        done.await.map_err(|_| SynapseError::Terminated { queue: queue.to_string() })?;
        Ok(())
    }

    /// 序列化并发送
    ///
    /// Serialize `value` with `format` and send it.
    pub async fn send_typed<T: serde::Serialize>(&self, queue: &str, value: &T, format: SerializationFormat) -> anyhow::Result<QueueElementIndex> {
        let packet = Packet::typed(value, format).map_err(SynapseError::from)?;
        self.send(queue, packet).await
    }

    /// 序列化并批量发送
    ///
    /// Serialize every value with `format` and send them as one pack.
    pub async fn send_typed_pack<T: serde::Serialize>(&self, queue: &str, values: &[T], format: SerializationFormat) -> anyhow::Result<()> {
        let mut packets = Vec::with_capacity(values.len());
        for value in values {
            packets.push(Packet::typed(value, format).map_err(SynapseError::from)?);
        }
        self.send_pack(queue, packets).await
    }

    /// 异步发送：返回在包持久化后收到其序号的通道
    ///
    /// Enqueue one packet without waiting; the returned channel yields its
    /// sequence number once durable.
    pub async fn async_send(&self, queue: &str, mut packet: Packet) -> anyhow::Result<async_channel::Receiver<QueueElementIndex>> {
        validate_queue_name(queue)?;
        self.ensure_running(queue)?;
        let (tx, rx) = async_channel::bounded(1);
        packet.set_confirmation(tx);
        let runner = self.core.queue_runner_channel(queue).await;
        runner.send(packet).await.map_err(|_| SynapseError::Terminated { queue: queue.to_string() })?;
        Ok(rx)
    }

    /// 异步批量发送：返回全部持久化后完成的 oneshot
    ///
    /// Enqueue a pack without waiting; the returned oneshot completes when every
    /// packet is durable.
    pub async fn async_send_pack(&self, queue: &str, packets: Vec<Packet>) -> anyhow::Result<oneshot::Receiver<()>> {
        validate_queue_name(queue)?;
        self.ensure_running(queue)?;
        let (done_tx, done_rx) = oneshot::channel();
        let expected = packets.len();
        if expected == 0 {
            let _ = done_tx.send(());
            return Ok(done_rx);
        }

        let (tx, rx) = async_channel::bounded(expected);
        let runner = self.core.queue_runner_channel(queue).await;
        for mut packet in packets {
            packet.set_confirmation(tx.clone());
            runner.send(packet).await.map_err(|_| SynapseError::Terminated { queue: queue.to_string() })?;
        }
        drop(tx);

        let queue = queue.to_string();
        tokio::spawn(async move {
            let mut confirmed = 0;
            while confirmed < expected {
                if rx.recv().await.is_err() {
                    debug!("批量发送在确认前被放弃，队列: {}, 已确认: {}/{} / Pack abandoned before confirmation, queue: {}, confirmed: {}/{}",
                           queue, confirmed, expected, queue, confirmed, expected);
                    return;
                }
                confirmed += 1;
            }
            let _ = done_tx.send(());
        });
        Ok(done_rx)
    }

    fn ensure_running(&self, queue: &str) -> Result<(), SynapseError> {
        if self.core.is_terminated() {
            return Err(SynapseError::Terminated { queue: queue.to_string() });
        }
        Ok(())
    }

    /// 获取消费者接收者（输出通道容量为 1）
    ///
    /// Get a receiver for `consumer` on `queue` with a single-slot output channel.
    pub async fn get_receiver(&self, queue: &str, consumer: &str) -> anyhow::Result<Receiver> {
        self.get_buffered_receiver(queue, consumer, 1).await
    }

    /// 获取带缓冲的消费者接收者
    ///
    /// Get a receiver whose output channel buffers up to `buffer_size` packets.
    /// Fails with [`SynapseError::ReceiverBusy`] while another receiver of the
    /// same consumer is open; after that one is closed, waits for its workers
    /// to exit before reading the consumer pointer.
    pub async fn get_buffered_receiver(&self, queue: &str, consumer: &str, buffer_size: usize) -> anyhow::Result<Receiver> {
        validate_queue_name(queue)?;
        validate_consumer_id(consumer)?;
        self.ensure_running(queue)?;
        info!("创建接收者，队列: {}, 消费者: {} / Creating receiver, queue: {}, consumer: {}", queue, consumer, queue, consumer);
        Receiver::spawn(Arc::clone(&self.core), queue, consumer, buffer_size).await
    }

    /// 读取后端中的命名指针
    ///
    /// Read a named pointer from the backend.
    pub async fn get_pointer(&self, queue: &str, consumer: &str) -> anyhow::Result<QueueElementIndex> {
        self.core.backend.get_ptr(queue, consumer).await
    }

    /// 列出已启动运行器的队列
    ///
    /// List queues that have a queue runner.
    pub async fn list_queues(&self) -> Vec<QueueName> {
        let mut queues = self.core.runners.keys().await;
        queues.sort();
        queues
    }

    /// 终止所有工作任务（不排空，未确认的包被放弃）
    ///
    /// Terminate every worker. Termination does not drain: buffered,
    /// unconfirmed packets are abandoned and their producers get an error.
    pub fn shutdown(&self) {
        if self.core.is_terminated() {
            return;
        }
        info!("终止所有队列工作任务，主机: {} / Terminating all queue workers, host: {}", self.core.host(), self.core.host());
        self.core.control.send_replace(ControlCommand::terminate());
    }
}

impl Core {
    /// 后端失败时的重试等待；若已终止则返回 false
    ///
    /// Sleep before retrying a backend call. Returns `false` once terminated.
    pub(crate) async fn retry_pause(&self, what: &str, queue: &str, attempt: u64, err: &anyhow::Error) -> bool {
        error!("{} 失败，队列: {}, 第 {} 次, 错误: {:#} / {} failed, queue: {}, attempt: {}, error: {:#}",
               what, queue, attempt, err, what, queue, attempt, err);
        if self.is_terminated() {
            return false;
        }
        tokio::time::sleep(self.options.retry_delay).await;
        !self.is_terminated()
    }
}
