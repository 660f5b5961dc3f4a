use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use log::trace;

/// 每分片的最小调用间隔（`1s / max_rps`）
///
/// Per-shard request-rate ceiling: a call for a shard never starts sooner than
/// `1s / max_rps` after the previous call for the same shard started.
/// `max_rps == 0` disables the gate.
#[derive(Debug)]
pub struct RpsGate {
    interval: Option<Duration>,
    timers: Mutex<HashMap<u64, Instant>>,
}

impl RpsGate {
    pub fn new(max_rps: u32) -> Self {
        let interval = (max_rps > 0).then(|| Duration::from_secs(1) / max_rps);
        RpsGate { interval, timers: Mutex::new(HashMap::new()) }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// 等待直到分片 `shard` 允许下一次调用
    ///
    /// Wait until `shard` may start its next call and return the reserved
    /// start. The slot is reserved before sleeping, so concurrent callers of
    /// one shard are spaced out as well.
    pub async fn wait(&self, shard: u64) -> Instant {
        let Some(interval) = self.interval else {
            return Instant::now();
        };
        let start = {
            let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let start = match timers.get(&shard) {
                Some(&last) if last + interval > now => last + interval,
                _ => now,
            };
            timers.insert(shard, start);
            start
        };
        if start > Instant::now() {
            trace!("限速等待，分片: {}, {:?} / Rate gate sleeping, shard: {}, {:?}",
                   shard, start - Instant::now(), shard, start - Instant::now());
            tokio::time::sleep_until(start).await;
        }
        start
    }
}

impl Default for RpsGate {
    fn default() -> Self {
        Self::unlimited()
    }
}
