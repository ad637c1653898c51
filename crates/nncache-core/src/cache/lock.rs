//! エントリロック
//!
//! キャッシュエントリへの参照カウント付きハンドル。保持している間は
//! エントリが追い出されないことが保証される。Drop で参照カウントを戻す。

use super::table::HashKeyedCache;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// キャッシュエントリのロック
///
/// キャッシュ本体を借用するだけで、エントリの所有権は持たない。
/// `Lookup::Reserved` で得たロックだけが予約の所有者で、
/// `HashKeyedCache::insert_result` で値を書き込める。
pub struct CacheLock<'a, V> {
    pub(super) cache: &'a HashKeyedCache<V>,
    pub(super) shard: usize,
    pub(super) slot: u32,
    pub(super) key: u64,
    pub(super) owner: bool,
    /// ready になった値（一度観測したら以降はシャードをロックしない）
    pub(super) value: OnceLock<Arc<V>>,
}

impl<'a, V> CacheLock<'a, V> {
    pub(super) fn new(
        cache: &'a HashKeyedCache<V>,
        shard: usize,
        slot: u32,
        key: u64,
        owner: bool,
        value: Option<Arc<V>>,
    ) -> Self {
        let cell = OnceLock::new();
        if let Some(value) = value {
            let _ = cell.set(value);
        }
        Self {
            cache,
            shard,
            slot,
            key,
            owner,
            value: cell,
        }
    }

    /// エントリのキー
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// このロックが予約の所有者か
    #[inline]
    pub fn is_reservation(&self) -> bool {
        self.owner
    }

    /// ready ならその値を返す。pending の間は `None`。
    pub fn value(&self) -> Option<Arc<V>> {
        if let Some(value) = self.value.get() {
            return Some(Arc::clone(value));
        }
        let value = self.cache.ready_value(self.shard, self.slot)?;
        let _ = self.value.set(Arc::clone(&value));
        Some(value)
    }

    /// ready か
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.value().is_some()
    }
}

impl<V> Drop for CacheLock<'_, V> {
    fn drop(&mut self) {
        self.cache.release(self.shard, self.slot, self.owner);
    }
}

impl<V> fmt::Debug for CacheLock<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheLock")
            .field("key", &format_args!("{:#018x}", self.key))
            .field("shard", &self.shard)
            .field("slot", &self.slot)
            .field("owner", &self.owner)
            .field("ready", &self.value.get().is_some())
            .finish()
    }
}
