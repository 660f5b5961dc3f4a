use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::RwLock;

/// 通道注册表：按键惰性创建并缓存通道（及其所属工作任务）
///
/// Registry of lazily created, memoized channels keyed by queue. Lookups take
/// the read lock; the write lock is taken only to create a missing entry, and
/// the entry is checked again under it so the factory runs once per key.
pub struct ChannelRegistry<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> ChannelRegistry<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        ChannelRegistry { entries: RwLock::new(HashMap::new()) }
    }

    pub async fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.read().await.get(key).cloned()
    }

    /// 获取或创建条目；`factory` 在写锁内至多执行一次
    ///
    /// Get the entry for `key`, creating it with `factory` if missing.
    pub async fn get_or_create<Q, F>(&self, key: &Q, factory: F) -> V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> V,
    {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                return entry.clone();
            }
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            return entry.clone();
        }
        let entry = factory();
        entries.insert(key.to_owned(), entry.clone());
        entry
    }

    pub async fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl<K, V> Default for ChannelRegistry<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
