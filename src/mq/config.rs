use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::debug;

use crate::mq::error::ConfigError;
use crate::mq::packet::{QueueElementIndex, QueueName, WRITER_POINTER};

/// 单个主机上的后端参数
///
/// Backend parameters for one host of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// 数据库名称
    ///
    /// Database name.
    #[serde(rename = "dbname")]
    pub db_name: String,
    #[serde(default)]
    pub port: u16,
    /// 数据表分片数（也是写入分片数）
    ///
    /// Number of data table shards; also the number of queue writer shards.
    pub table_parallelism: usize,
    /// 指针表分片数
    ///
    /// Number of pointer table shards.
    pub pointers_parallelism: usize,
    /// 每个分片每秒最多批量写入次数
    ///
    /// Maximum batch writes per second per shard.
    pub max_rps_per_thread: u32,
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_name.is_empty() {
            return Err(ConfigError::InvalidValue { field: "dbname", reason: "must not be empty".to_string() });
        }
        if self.table_parallelism == 0 {
            return Err(ConfigError::InvalidValue { field: "table_parallelism", reason: "must be at least 1".to_string() });
        }
        if self.pointers_parallelism == 0 {
            return Err(ConfigError::InvalidValue { field: "pointers_parallelism", reason: "must be at least 1".to_string() });
        }
        if self.max_rps_per_thread == 0 {
            return Err(ConfigError::InvalidValue { field: "max_rps_per_thread", reason: "must be at least 1".to_string() });
        }
        Ok(())
    }
}

/// 队列配置：队列名与主机到后端参数的映射
///
/// Queue configuration: the queue name and a map of host to backend parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: QueueName,
    #[serde(default)]
    pub hosts: HashMap<String, BackendConfig>,
}

impl QueueConfig {
    pub fn new(name: impl Into<QueueName>) -> Self {
        QueueConfig { name: name.into(), hosts: HashMap::new() }
    }

    pub fn with_host(mut self, host: impl Into<String>, backend: BackendConfig) -> Self {
        self.hosts.insert(host.into(), backend);
        self
    }

    /// 从 JSON 字符串解析并校验
    ///
    /// Parse from a JSON string and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: QueueConfig = serde_json::from_str(json)?;
        config.validate()?;
        debug!("加载队列配置: {}, 主机数: {} / Loaded queue config: {}, hosts: {}",
               config.name, config.hosts.len(), config.name, config.hosts.len());
        Ok(config)
    }

    /// 从 JSON 文件加载并校验
    ///
    /// Load from a JSON file and validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_queue_name(&self.name)?;
        if self.hosts.is_empty() {
            return Err(ConfigError::NoHosts(self.name.clone()));
        }
        for backend in self.hosts.values() {
            backend.validate()?;
        }
        Ok(())
    }

    /// 查找指定主机的后端参数
    ///
    /// Look up the backend parameters for `host`.
    pub fn backend_for_host(&self, host: &str) -> Result<&BackendConfig, ConfigError> {
        self.hosts.get(host).ok_or_else(|| ConfigError::UnknownHost {
            host: host.to_string(),
            queue: self.name.clone(),
        })
    }
}

/// 队列名只允许字母、数字、下划线和连字符（会出现在表名中）
///
/// Queue names end up in table names: non-empty, ASCII alphanumerics, `_` and `-` only.
pub fn validate_queue_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidQueueName(name.to_string()))
    }
}

pub fn validate_consumer_id(consumer: &str) -> Result<(), ConfigError> {
    if consumer == WRITER_POINTER {
        Err(ConfigError::InvalidConsumerId(consumer.to_string()))
    } else {
        Ok(())
    }
}

const PER_CHANNEL_MEMORY: usize = 1024 * 16;

/// 运行时可调参数
///
/// Runtime tunables shared by every worker of a `Synapse`.
#[derive(Debug, Clone)]
pub struct SynapseOptions {
    /// 所有内部通道的缓冲深度
    ///
    /// Buffer depth applied to every internal channel.
    pub channel_depth: usize,
    /// 写入分片缓冲达到该大小后停止接收，直到刷写
    ///
    /// A writer shard stops accepting packets once its buffer holds this many.
    pub io_batch_size: usize,
    /// 缓冲超过该值时即使入口通道非空也触发刷写
    ///
    /// Buffer length above which a flush is triggered even if the inbound channel is busy.
    pub flush_threshold: usize,
    /// 空闲刷写间隔
    ///
    /// Idle interval after which a non-empty buffer is flushed.
    pub idle_flush_interval: Duration,
    /// 接收者单页读取上限
    ///
    /// Maximum packets fetched by a receiver in one page.
    pub reader_page_limit: QueueElementIndex,
    /// 接收者确认通道长度
    ///
    /// Length of a receiver's ack channel.
    pub receiver_ack_chan_len: usize,
    /// 接收者追上写指针后的轮询间隔
    ///
    /// Poll interval of a receiver that has caught up with the writer pointer.
    pub receiver_poll_interval: Duration,
    /// 后端操作失败后的重试间隔
    ///
    /// Pause between retries of a failed backend call.
    pub retry_delay: Duration,
    /// 确认缓冲每增长这么多条就告警一次（消费者可能卡住）
    ///
    /// Warn about a possibly stuck consumer each time its ack buffer grows by this many ids.
    pub ack_buffer_warn_len: usize,
    /// 逐包跟踪日志
    ///
    /// Verbose per-packet trace logging.
    pub trace: bool,
}

impl Default for SynapseOptions {
    fn default() -> Self {
        SynapseOptions {
            channel_depth: PER_CHANNEL_MEMORY,
            io_batch_size: PER_CHANNEL_MEMORY,
            flush_threshold: 100,
            idle_flush_interval: Duration::from_secs(1),
            reader_page_limit: 50_000,
            receiver_ack_chan_len: 10_000,
            receiver_poll_interval: Duration::from_millis(500),
            retry_delay: Duration::from_millis(100),
            ack_buffer_warn_len: 100_000,
            trace: false,
        }
    }
}

impl SynapseOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("channel_depth", self.channel_depth),
            ("io_batch_size", self.io_batch_size),
            ("receiver_ack_chan_len", self.receiver_ack_chan_len),
            ("ack_buffer_warn_len", self.ack_buffer_warn_len),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue { field, reason: "must be at least 1".to_string() });
            }
        }
        if self.reader_page_limit == 0 {
            return Err(ConfigError::InvalidValue { field: "reader_page_limit", reason: "must be at least 1".to_string() });
        }
        Ok(())
    }
}
