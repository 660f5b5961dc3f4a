use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, PoisonError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use log::{debug, error, info, warn};

use crate::backend::gate::RpsGate;
use crate::backend::pointer_key;
use crate::mq::config::{validate_queue_name, BackendConfig, QueueConfig};
use crate::mq::packet::{Packet, QueueElementIndex, WRITER_POINTER};
use crate::mq::traits::SynapseBackend;

const SLOW_INSERT: Duration = Duration::from_secs(1);

/// SQLite 后端参数
///
/// Parameters of a [`SqliteBackend`].
#[derive(Debug, Clone)]
pub struct SqliteBackendConfig {
    pub host: String,
    pub path: PathBuf,
    pub table_parallelism: usize,
    pub pointers_parallelism: usize,
    pub max_rps_per_thread: u32,
}

impl SqliteBackendConfig {
    /// 由队列配置的主机参数生成；数据库文件为 `<data_dir>/<dbname>.sqlite`
    ///
    /// Derive from one host entry of a queue config. The database file is
    /// `<data_dir>/<dbname>.sqlite`.
    pub fn from_backend_config(host: &str, config: &BackendConfig, data_dir: &Path) -> Self {
        SqliteBackendConfig {
            host: host.to_string(),
            path: data_dir.join(format!("{}.sqlite", config.db_name)),
            table_parallelism: config.table_parallelism.max(1),
            pointers_parallelism: config.pointers_parallelism.max(1),
            max_rps_per_thread: config.max_rps_per_thread,
        }
    }
}

/// 以 SQLite 作为持久化 KV / 追加日志的后端
///
/// Durable backend on SQLite. Each queue gets `table_parallelism` data tables
/// `queue_<name>_<parallelism:03>_<shard:04>`, a row landing in table
/// `id mod table_parallelism`, and pointer tables `..._pointers` keyed by
/// `"<queue>:<consumer>"`. Writes are upserts, so retrying a batch is safe.
pub struct SqliteBackend {
    config: SqliteBackendConfig,
    conn: Arc<Mutex<Connection>>,
    table_cache: RwLock<HashSet<String>>,
    write_gate: RpsGate,
    writer_ptr_gate: RpsGate,
    batches: AtomicU64,
    packets: AtomicU64,
    trace: AtomicBool,
}

impl SqliteBackend {
    pub fn open(config: SqliteBackendConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )?;
        let tables: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )?;
        info!("打开 SQLite 后端，主机: {}, 文件: {}, 表数: {} / Opened SQLite backend, host: {}, file: {}, tables: {}",
              config.host, config.path.display(), tables, config.host, config.path.display(), tables);

        Ok(SqliteBackend {
            write_gate: RpsGate::new(config.max_rps_per_thread),
            writer_ptr_gate: RpsGate::new(config.max_rps_per_thread),
            config,
            conn: Arc::new(Mutex::new(conn)),
            table_cache: RwLock::new(HashSet::new()),
            batches: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            trace: AtomicBool::new(false),
        })
    }

    /// 为队列的指定主机打开后端；主机不在配置中时报错
    ///
    /// Open the backend for `host` of a queue. Fails when the queue config has
    /// no such host.
    pub fn for_queue(queue: &QueueConfig, host: &str, data_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let backend = queue.backend_for_host(host)?;
        backend.validate()?;
        Self::open(SqliteBackendConfig::from_backend_config(host, backend, data_dir.as_ref()))
    }

    pub fn config(&self) -> &SqliteBackendConfig {
        &self.config
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn data_table_names(&self, queue: &str) -> Vec<String> {
        let n = self.config.table_parallelism;
        (0..n).map(|i| format!("queue_{}_{:03}_{:04}", queue, n, i)).collect()
    }

    pub fn pointer_table_names(&self, queue: &str) -> Vec<String> {
        let n = self.config.pointers_parallelism;
        (0..n).map(|i| format!("queue_{}_{:03}_{:04}_pointers", queue, n, i)).collect()
    }

    fn tracing(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await?
    }

    async fn ensure_tables_exist(&self, queue: &str) -> anyhow::Result<()> {
        validate_queue_name(queue)?;
        let data_tables = self.data_table_names(queue);
        let pointer_tables = self.pointer_table_names(queue);
        let missing: Vec<(String, bool)> = {
            let cache = self.table_cache.read().unwrap_or_else(PoisonError::into_inner);
            data_tables.into_iter().map(|t| (t, true))
                .chain(pointer_tables.into_iter().map(|t| (t, false)))
                .filter(|(t, _)| !cache.contains(t))
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let queue_name = queue.to_string();
        let created = self.with_conn(move |conn| {
            let mut created = Vec::with_capacity(missing.len());
            for (table, is_data) in missing {
                let ddl = if is_data {
                    format!("CREATE TABLE IF NOT EXISTS \"{}\" (id INTEGER PRIMARY KEY, data BLOB NOT NULL)", table)
                } else {
                    format!("CREATE TABLE IF NOT EXISTS \"{}\" (id TEXT PRIMARY KEY, ptr INTEGER NOT NULL)", table)
                };
                if let Err(e) = conn.execute(&ddl, []) {
                    error!("创建队列表失败，队列: {}, 表: {}, 错误: {} / Error creating queue table, queue: {}, table: {}, error: {}",
                           queue_name, table, e, queue_name, table, e);
                    return Err(e.into());
                }
                created.push(table);
            }
            Ok(created)
        }).await?;

        debug!("队列表已就绪，队列: {}, 表数: {} / Queue tables ready, queue: {}, tables: {}", queue, created.len(), queue, created.len());
        let mut cache = self.table_cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.extend(created);
        Ok(())
    }
}

#[async_trait]
impl SynapseBackend for SqliteBackend {
    async fn write_batch(&self, queue: &str, data: &[Packet]) -> anyhow::Result<()> {
        self.ensure_tables_exist(queue).await?;
        let tables = self.data_table_names(queue);
        let parallelism = self.config.table_parallelism as QueueElementIndex;

        let mut split: BTreeMap<usize, Vec<(QueueElementIndex, Arc<Vec<u8>>)>> = BTreeMap::new();
        for packet in data {
            split.entry((packet.db_id % parallelism) as usize)
                .or_default()
                .push((packet.db_id, Arc::clone(&packet.data)));
        }
        if split.len() > 1 {
            warn!("批次跨越多个分片表（写入分片与表分片不一致），队列: {}, 分片数: {} / Batch spans several shard tables (writer shards and table shards disagree), queue: {}, shards: {}",
                  queue, split.len(), queue, split.len());
        }
        if self.tracing() {
            info!("写入 SQLite，队列: {}, 大小: {} / Sending to SQLite, queue: {}, size: {}", queue, data.len(), queue, data.len());
        }

        for (shard, rows) in split {
            self.write_gate.wait(shard as u64).await;
            let table = tables[shard].clone();
            let entries = rows.len();
            let bytes: usize = rows.iter().map(|(_, data)| data.len()).sum();
            let started = Instant::now();
            self.with_conn(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare_cached(&format!(
                        "INSERT INTO \"{}\" (id, data) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                        table
                    ))?;
                    for (id, data) in &rows {
                        stmt.execute(params![*id as i64, data.as_slice()])?;
                    }
                }
                tx.commit()?;
                Ok(())
            }).await?;

            let elapsed = started.elapsed();
            if elapsed > SLOW_INSERT {
                warn!("SQLite 写入缓慢，队列: {}, 分片: {}, 耗时: {:?}, 条数: {}, 字节: {}, 平均: {:.1} / Slow SQLite insert, queue: {}, shard: {}, took: {:?}, entries: {}, bytes: {}, avg-entry: {:.1}",
                      queue, shard, elapsed, entries, bytes, bytes as f64 / entries as f64,
                      queue, shard, elapsed, entries, bytes, bytes as f64 / entries as f64);
            }
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.packets.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn read_batch(&self, queue: &str, ids: &[QueueElementIndex]) -> anyhow::Result<Vec<Packet>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_tables_exist(queue).await?;
        let tables = self.data_table_names(queue);
        let parallelism = self.config.table_parallelism as QueueElementIndex;

        let mut split: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for &id in ids {
            split.entry((id % parallelism) as usize).or_default().push(id.to_string());
        }
        let queries: Vec<String> = split
            .into_iter()
            .map(|(shard, ids)| format!("SELECT id, data FROM \"{}\" WHERE id IN ({})", tables[shard], ids.join(",")))
            .collect();

        let mut result = self.with_conn(move |conn| {
            let mut result = Vec::new();
            for query in queries {
                let mut stmt = conn.prepare(&query)?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?;
                for row in rows {
                    let (id, data) = row?;
                    result.push(Packet::stored(id as QueueElementIndex, Arc::new(data)));
                }
            }
            Ok(result)
        }).await?;

        result.sort_by_key(|p| p.db_id);
        Ok(result)
    }

    async fn write_ptr(&self, queue: &str, consumer: &str, ptr: QueueElementIndex) -> anyhow::Result<()> {
        if consumer == WRITER_POINTER {
            self.writer_ptr_gate.wait(0).await;
        }
        self.ensure_tables_exist(queue).await?;
        let table = self.pointer_table_names(queue).swap_remove(0);
        let key = pointer_key(queue, consumer);
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO \"{}\" (id, ptr) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET ptr = excluded.ptr", table),
                params![key, ptr as i64],
            )?;
            Ok(())
        }).await
    }

    async fn get_ptr(&self, queue: &str, consumer: &str) -> anyhow::Result<QueueElementIndex> {
        self.ensure_tables_exist(queue).await?;
        let table = self.pointer_table_names(queue).swap_remove(0);
        let key = pointer_key(queue, consumer);
        let ptr = self.with_conn(move |conn| {
            let ptr = conn
                .query_row(&format!("SELECT ptr FROM \"{}\" WHERE id = ?1", table), [key], |row| row.get::<_, i64>(0))
                .optional()?;
            Ok(ptr)
        }).await?;
        Ok(ptr.map(|p| p as QueueElementIndex).unwrap_or(0))
    }

    fn default_queue_parallelism(&self, _queue: &str) -> usize {
        self.config.table_parallelism
    }

    fn host_name(&self) -> &str {
        &self.config.host
    }

    fn set_trace(&self, trace: bool) {
        self.trace.store(trace, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, parallelism: usize) -> SqliteBackendConfig {
        SqliteBackendConfig {
            host: "local".to_string(),
            path: dir.join("synapse.sqlite"),
            table_parallelism: parallelism,
            pointers_parallelism: 1,
            max_rps_per_thread: 0,
        }
    }

    #[test]
    fn table_names_carry_parallelism_and_shard() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = SqliteBackend::open(config(dir.path(), 4))?;
        assert_eq!(
            backend.data_table_names("orders"),
            vec!["queue_orders_004_0000", "queue_orders_004_0001", "queue_orders_004_0002", "queue_orders_004_0003"]
        );
        assert_eq!(backend.pointer_table_names("orders"), vec!["queue_orders_001_0000_pointers"]);
        Ok(())
    }

    #[tokio::test]
    async fn batches_are_upserted_across_shards() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = SqliteBackend::open(config(dir.path(), 2))?;
        let batch: Vec<Packet> = (1..=4).map(|id| Packet::stored(id, Arc::new(vec![id as u8]))).collect();
        backend.write_batch("q", &batch).await?;
        backend.write_batch("q", &[Packet::stored(3, Arc::new(b"retry".to_vec()))]).await?;

        let read = backend.read_batch("q", &[1, 2, 3, 4, 5]).await?;
        let ids: Vec<QueueElementIndex> = read.iter().map(|p| p.db_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(read[2].data(), b"retry");
        assert_eq!(backend.batches(), 2);
        assert_eq!(backend.packets(), 5);
        Ok(())
    }

    #[tokio::test]
    async fn pointers_survive_reopen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let backend = SqliteBackend::open(config(dir.path(), 1))?;
            assert_eq!(backend.get_ptr("q", WRITER_POINTER).await?, 0);
            backend.write_ptr("q", WRITER_POINTER, 10).await?;
            backend.write_ptr("q", "reader", 4).await?;
            backend.write_ptr("q", "reader", 6).await?;
        }
        let backend = SqliteBackend::open(config(dir.path(), 1))?;
        assert_eq!(backend.get_ptr("q", WRITER_POINTER).await?, 10);
        assert_eq!(backend.get_ptr("q", "reader").await?, 6);
        assert_eq!(backend.get_ptr("q", "other").await?, 0);
        Ok(())
    }

    #[test]
    fn unknown_host_is_a_config_error() {
        let queue = QueueConfig::new("orders").with_host("db-1", BackendConfig {
            db_name: "nerve".to_string(),
            port: 0,
            table_parallelism: 2,
            pointers_parallelism: 1,
            max_rps_per_thread: 100,
        });
        let err = SqliteBackend::for_queue(&queue, "db-2", std::env::temp_dir()).err();
        let message = err.map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("no host db-2"), "{}", message);
    }
}
