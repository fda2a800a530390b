//! 已使用 nonce 的 TTL 缓存。
//!
//! 基于分片并发哈希表。`insert_if_absent` 在同一分片写锁内完成 "检查 + 插入"，
//! 因此同一 nonce 的并发插入只有一个能成功。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct NonceCache {
    /// nonce -> 最后保留的一秒 (Unix 秒，含)
    entries: DashMap<String, i64>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个 nonce，保留到 `keep_until` 这一秒 (含)。已存在且仍在保留期内时返回 `false`。
    pub fn insert_if_absent(&self, nonce: &str, keep_until: i64, now: i64) -> bool {
        match self.entries.entry(nonce.to_string()) {
            Entry::Occupied(mut e) => {
                if *e.get() < now {
                    e.insert(keep_until);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(v) => {
                v.insert(keep_until);
                true
            }
        }
    }

    pub fn contains(&self, nonce: &str, now: i64) -> bool {
        self.entries.get(nonce).is_some_and(|e| *e.value() >= now)
    }

    /// 清除保留期已过的条目，返回清除数量。
    pub fn purge_expired(&self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, keep_until| *keep_until >= now);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
