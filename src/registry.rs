//! Application registry entries: runtime handles, pool sharding, counters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value;

use crate::runtime::AppHandle;
use crate::sph::SphFlags;

/// Pool-sharded workers are addressed by name, so an early idle eviction
/// would orphan referents; multiple-start profiles must keep workers for at
/// least 30 days.
pub const IDLE_TIMEOUT_FLOOR_SECS: i64 = 60 * 60 * 24 * 30;

/// Per-event dispatch counters. Monotonic, never decremented.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventCounters {
    pub blocked: u64,
    pub nonblocked: u64,
    pub reply: u64,
}

/// Pool parameters read from a multiple-start profile document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolProfile {
    pub idle_timeout: i64,
    pub pool_limit: i64,
}

impl PoolProfile {
    pub fn from_value(profile: &Value) -> Self {
        Self {
            idle_timeout: profile
                .get("idle-timeout")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            pool_limit: profile
                .get("pool-limit")
                .and_then(Value::as_i64)
                .unwrap_or(0),
        }
    }

    pub fn idle_acceptable(&self) -> bool {
        self.idle_timeout == 0 || self.idle_timeout >= IDLE_TIMEOUT_FLOOR_SECS
    }
}

/// A started application and its dispatch bookkeeping.
///
/// While the entry is registered its handle is started; dropping the entry
/// stops it.
pub struct AppEntry {
    name: String,
    handle: Arc<dyn AppHandle>,
    pool_size: i64,
    task_id: String,
    next_shard: AtomicI64,
    counters: Mutex<BTreeMap<String, EventCounters>>,
}

impl AppEntry {
    pub fn new(name: impl Into<String>, handle: Arc<dyn AppHandle>) -> Self {
        Self {
            name: name.into(),
            handle,
            pool_size: -1,
            task_id: "default".to_string(),
            next_shard: AtomicI64::new(1),
            counters: Mutex::new(BTreeMap::new()),
        }
    }

    /// Enable pool-sharded routing. A non-positive `pool_size` keeps the app
    /// unsharded.
    pub fn with_pool(mut self, pool_size: i64, task_id: Option<String>) -> Self {
        self.pool_size = if pool_size > 0 { pool_size } else { -1 };
        if let Some(task_id) = task_id
            && !task_id.is_empty()
        {
            self.task_id = task_id;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &Arc<dyn AppHandle> {
        &self.handle
    }

    /// Bump exactly one counter for `method`, chosen from the header flags.
    pub fn update(&self, method: &str, flags: SphFlags) {
        let Ok(mut counters) = self.counters.lock() else {
            return;
        };
        let entry = counters.entry(method.to_string()).or_default();
        if flags.is_reply_or_finish() {
            entry.reply += 1;
        } else if flags.src_block() {
            entry.blocked += 1;
        } else {
            entry.nonblocked += 1;
        }
    }

    pub fn counters(&self) -> BTreeMap<String, EventCounters> {
        self.counters
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default()
    }

    /// Counters as a JSON document for the `info` reply.
    pub fn counters_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (method, counters) in self.counters() {
            map.insert(
                method,
                serde_json::json!({
                    "blocked": counters.blocked,
                    "nonblocked": counters.nonblocked,
                    "reply": counters.reply,
                }),
            );
        }
        Value::Object(map)
    }

    /// Shard slot for this request, or -1 when the app is unsharded.
    ///
    /// `src_key == -1` rotates through the pool; any other key pins affinity
    /// to `src_key mod pool_size`.
    pub fn shard_index(&self, src_key: i32) -> i64 {
        if self.pool_size == -1 {
            return -1;
        }
        if src_key == -1 {
            return self.next_shard.fetch_add(1, Ordering::Relaxed) % self.pool_size;
        }
        i64::from(src_key).rem_euclid(self.pool_size)
    }

    /// Worker queue name for a shard slot.
    pub fn queue_name(&self, index: i64) -> String {
        format!("{}-{}-{}", self.task_id, self.name, index)
    }
}

impl Drop for AppEntry {
    fn drop(&mut self) {
        self.handle.stop();
    }
}
