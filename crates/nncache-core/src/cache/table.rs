//! HashKeyedCache本体
//!
//! - Shard: スロットのアリーナ + キー索引 + LRU リスト
//! - HashKeyedCache: シャードの配列
//! - lookup_or_reserve / peek_ready / insert_result
//!
//! ロックはシャード単位の `parking_lot::Mutex` のみ。同時に2つ以上の
//! シャードをロックすることはない（他シャードからの追い出しや clear /
//! set_capacity は、ロックを1つずつ取り直して行う）。
//!
//! 容量はテーブル全体のエントリ数 `entries` で制限する。シャードごとの上限は無い。

use super::lock::CacheLock;
use super::stats::{CacheCounters, CacheStats};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// LRU リストの終端
const NIL: u32 = u32::MAX;

/// 1シャードあたりの最小エントリ数（シャード数の上限を決める）
pub const MIN_SHARD_ENTRIES: usize = 64;

/// 他シャードから追い出して空きを作る試行の上限
const MAX_BORROW_ATTEMPTS: usize = 4;

/// キーは既にハッシュ値なので、ビットを撹拌するだけのハッシャ
///
/// シャード選択にキーの上位ビットを使うため、そのままだと同じシャード内で
/// 上位ビットが揃ってしまう。奇数定数の乗算で全ビットを上位に混ぜる。
#[derive(Default)]
struct KeyHasher(u64);

impl Hasher for KeyHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0.rotate_left(8) ^ b as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        }
    }

    #[inline]
    fn write_u64(&mut self, n: u64) {
        self.0 = n.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    }
}

type KeyIndex = HashMap<u64, u32, BuildHasherDefault<KeyHasher>>;

enum SlotState<V> {
    /// 計算中。`owned == false` は予約者がロックを手放した（放棄された）状態
    Pending { owned: bool },
    /// 確定済み（以後不変）
    Ready(Arc<V>),
}

struct Slot<V> {
    key: u64,
    state: SlotState<V>,
    ref_count: u32,
    /// LRU リスト（head 側が新しい）
    prev: u32,
    next: u32,
}

/// シャード
///
/// 空きスロットは `free` に積まれ、索引からは外れている。
struct Shard<V> {
    slots: Vec<Slot<V>>,
    index: KeyIndex,
    free: Vec<u32>,
    head: u32,
    tail: u32,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            index: KeyIndex::default(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.index.len()
    }

    fn unlink(&mut self, i: u32) {
        let (prev, next) = {
            let slot = &self.slots[i as usize];
            (slot.prev, slot.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }
    }

    fn push_front(&mut self, i: u32) {
        let old_head = self.head;
        {
            let slot = &mut self.slots[i as usize];
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head == NIL {
            self.tail = i;
        } else {
            self.slots[old_head as usize].prev = i;
        }
        self.head = i;
    }

    /// 最近使ったものとして先頭に移動
    #[inline]
    fn touch(&mut self, i: u32) {
        if self.head != i {
            self.unlink(i);
            self.push_front(i);
        }
    }

    /// 新しいエントリを確保して先頭に置く（参照カウント1）
    fn alloc(&mut self, key: u64) -> u32 {
        let state = SlotState::Pending { owned: true };
        let i = match self.free.pop() {
            Some(i) => {
                let slot = &mut self.slots[i as usize];
                slot.key = key;
                slot.state = state;
                slot.ref_count = 1;
                i
            }
            None => {
                let i = self.slots.len() as u32;
                self.slots.push(Slot {
                    key,
                    state,
                    ref_count: 1,
                    prev: NIL,
                    next: NIL,
                });
                i
            }
        };
        self.index.insert(key, i);
        self.push_front(i);
        i
    }

    /// エントリを破棄して空きリストへ戻す
    fn remove(&mut self, i: u32) {
        self.unlink(i);
        let slot = &mut self.slots[i as usize];
        debug_assert_eq!(slot.ref_count, 0, "removing a pinned entry");
        // 値の Arc を手放す
        slot.state = SlotState::Pending { owned: false };
        let key = slot.key;
        self.index.remove(&key);
        self.free.push(i);
    }

    /// LRU 末尾から、ピン留めされていない最初のエントリを追い出す
    fn evict_one(&mut self) -> bool {
        let mut cur = self.tail;
        while cur != NIL {
            let slot = &self.slots[cur as usize];
            if slot.ref_count == 0 {
                #[cfg(feature = "diagnostics")]
                log::trace!("NNCache evict: key={:#018x}", slot.key);
                self.remove(cur);
                return true;
            }
            cur = slot.prev;
        }
        false
    }

    /// `limit` 件を超えていれば1件追い出す
    fn evict_above(&mut self, limit: usize) -> bool {
        self.len() > limit && self.evict_one()
    }

    /// ピン留めされていない全エントリを破棄する
    fn clear_unpinned(&mut self) -> usize {
        let mut removed = 0;
        let mut cur = self.tail;
        while cur != NIL {
            let prev = self.slots[cur as usize].prev;
            if self.slots[cur as usize].ref_count == 0 {
                self.remove(cur);
                removed += 1;
            }
            cur = prev;
        }
        removed
    }
}

/// 検索結果
#[derive(Debug)]
pub enum Lookup<'a, V> {
    /// 確定済みのエントリが見つかった
    Ready(CacheLock<'a, V>),
    /// 他の誰かが計算中。計算し直してはいけない
    Pending(CacheLock<'a, V>),
    /// 新しく予約した。呼び出し側が計算して `insert_result` する責任を持つ
    Reserved(CacheLock<'a, V>),
    /// 容量いっぱいで、全エントリがピン留めされていて予約できない。
    /// キャッシュせずに計算する
    Full,
}

impl<'a, V> Lookup<'a, V> {
    /// 既存エントリが見つかったか（ready / pending）
    #[inline]
    pub fn found(&self) -> bool {
        matches!(self, Lookup::Ready(_) | Lookup::Pending(_))
    }

    /// ロックを取り出す（`Full` なら `None`）
    pub fn into_lock(self) -> Option<CacheLock<'a, V>> {
        match self {
            Lookup::Ready(lock) | Lookup::Pending(lock) | Lookup::Reserved(lock) => Some(lock),
            Lookup::Full => None,
        }
    }
}

/// 64bit ハッシュをキーとする容量固定のキャッシュ
///
/// 全操作は複数スレッドから同時に呼び出せる。
pub struct HashKeyedCache<V> {
    shards: Box<[CachePadded<Mutex<Shard<V>>>]>,
    capacity: AtomicUsize,
    /// 全シャードのエントリ数の合計（シャードロックの下で増減する）
    entries: AtomicUsize,
    counters: CacheCounters,
    /// 満杯警告は一度だけ出す
    full_warned: AtomicBool,
}

impl<V> HashKeyedCache<V> {
    /// 新しいキャッシュを作成（容量はエントリ数）
    ///
    /// シャード数は、1シャードあたり `MIN_SHARD_ENTRIES` 件以上になるように
    /// `[1, capacity / MIN_SHARD_ENTRIES]` に丸められる。小さいキャッシュは
    /// 1シャードになり、LRU が厳密になる。
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shard_count = shards.clamp(1, (capacity / MIN_SHARD_ENTRIES).max(1));
        let shards: Box<[_]> =
            (0..shard_count).map(|_| CachePadded::new(Mutex::new(Shard::new()))).collect();

        log::info!("NNCache init: capacity={} shards={}", capacity, shard_count);

        Self {
            shards,
            capacity: AtomicUsize::new(capacity),
            entries: AtomicUsize::new(0),
            counters: CacheCounters::default(),
            full_warned: AtomicBool::new(false),
        }
    }

    /// 設定から作成
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.shards)
    }

    /// キーを検索し、無ければ pending エントリを予約する
    ///
    /// 同じキーに対する予約はシャードロックの下で行われるため、
    /// 同時に呼ばれても `Reserved` を受け取るのは1つだけ。
    pub fn lookup_or_reserve(&self, key: u64) -> Lookup<'_, V> {
        let shard_idx = self.shard_index(key);
        self.counters.record_lookup();

        let mut attempts = 0;
        loop {
            let mut shard = self.shards[shard_idx].lock();

            // 他シャードから追い出している間に別スレッドが予約した可能性があるので毎回引き直す
            let existing = shard.index.get(&key).copied();
            if let Some(i) = existing {
                return self.pin_found(shard, shard_idx, i, key);
            }

            if self.try_claim_entry() {
                let i = shard.alloc(key);
                self.counters.record_reservation();
                return Lookup::Reserved(CacheLock::new(self, shard_idx, i, key, true, None));
            }

            // 容量いっぱい。まず自シャードの LRU 末尾と入れ替える（件数は変わらない）
            if self.capacity() > 0 && shard.evict_one() {
                self.counters.record_evictions(1);
                let i = shard.alloc(key);
                self.counters.record_reservation();
                return Lookup::Reserved(CacheLock::new(self, shard_idx, i, key, true, None));
            }
            drop(shard);

            // 自シャードは全てピン留め。他シャードから1件追い出して空きを作る
            if attempts == MAX_BORROW_ATTEMPTS || !self.evict_from_other_shards(shard_idx) {
                break;
            }
            attempts += 1;
        }

        self.counters.record_rejection();
        if self.capacity() > 0 && !self.full_warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "NNCache full: all {} entries are pinned; key={:#018x} is computed without caching",
                self.entries.load(Ordering::Relaxed),
                key
            );
        }
        Lookup::Full
    }

    /// 索引にあったエントリをピン留めして返す
    fn pin_found(
        &self,
        mut shard: MutexGuard<'_, Shard<V>>,
        shard_idx: usize,
        i: u32,
        key: u64,
    ) -> Lookup<'_, V> {
        enum Found<V> {
            Ready(Arc<V>),
            Pending,
            Reclaimed,
        }

        let found = {
            let slot = &mut shard.slots[i as usize];
            slot.ref_count += 1;
            match &mut slot.state {
                SlotState::Ready(value) => Found::Ready(Arc::clone(value)),
                SlotState::Pending { owned: true } => Found::Pending,
                SlotState::Pending { owned } => {
                    *owned = true;
                    Found::Reclaimed
                }
            }
        };

        match found {
            Found::Ready(value) => {
                shard.touch(i);
                self.counters.record_hit();
                Lookup::Ready(CacheLock::new(self, shard_idx, i, key, false, Some(value)))
            }
            Found::Pending => {
                self.counters.record_pending_hit();
                Lookup::Pending(CacheLock::new(self, shard_idx, i, key, false, None))
            }
            Found::Reclaimed => {
                shard.touch(i);
                self.counters.record_reservation();
                Lookup::Reserved(CacheLock::new(self, shard_idx, i, key, true, None))
            }
        }
    }

    /// 容量に空きがあれば1件分を確保する
    #[inline]
    fn try_claim_entry(&self) -> bool {
        let capacity = self.capacity();
        self.entries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < capacity).then_some(n + 1))
            .is_ok()
    }

    /// `home` 以外のシャードから、ピン留めされていないエントリを1件追い出す
    fn evict_from_other_shards(&self, home: usize) -> bool {
        let shard_count = self.shards.len();
        for offset in 1..shard_count {
            let mut shard = self.shards[(home + offset) % shard_count].lock();
            if shard.evict_one() {
                self.entries.fetch_sub(1, Ordering::AcqRel);
                drop(shard);
                self.counters.record_evictions(1);
                return true;
            }
        }
        false
    }

    /// 全体が容量以下になるまで `shard` から追い出す
    fn shrink_shard_to_capacity(&self, shard: &mut Shard<V>) -> usize {
        let mut evicted = 0;
        while self.entries.load(Ordering::Acquire) > self.capacity() && shard.evict_one() {
            self.entries.fetch_sub(1, Ordering::AcqRel);
            evicted += 1;
        }
        evicted
    }

    /// ready なエントリだけを検索する（予約しない・LRU を更新しない）
    pub fn peek_ready(&self, key: u64) -> Option<CacheLock<'_, V>> {
        let shard_idx = self.shard_index(key);
        let mut shard = self.shards[shard_idx].lock();
        let i = *shard.index.get(&key)?;
        let slot = &mut shard.slots[i as usize];
        let value = match &slot.state {
            SlotState::Ready(value) => Arc::clone(value),
            SlotState::Pending { .. } => return None,
        };
        slot.ref_count += 1;
        Some(CacheLock::new(self, shard_idx, i, key, false, Some(value)))
    }

    /// 予約済み pending エントリに値を書き込み ready にする
    ///
    /// 書き込みは1回限り。ready なエントリへの書き込みや、予約を所有しない
    /// ロックからの書き込みはエラーで、保存済みの値は変わらない。
    pub fn insert_result(&self, lock: &CacheLock<'_, V>, value: V) -> Result<Arc<V>, CacheError> {
        if !std::ptr::eq(lock.cache, self) {
            return Err(CacheError::ForeignLock { key: lock.key });
        }

        let mut shard = self.shards[lock.shard].lock();
        let slot = &mut shard.slots[lock.slot as usize];
        debug_assert_eq!(slot.key, lock.key);

        if matches!(slot.state, SlotState::Ready(_)) {
            return Err(CacheError::AlreadyPopulated { key: lock.key });
        }
        if !lock.owner {
            return Err(CacheError::NotReservationOwner { key: lock.key });
        }

        let value = Arc::new(value);
        slot.state = SlotState::Ready(Arc::clone(&value));
        drop(shard);
        self.counters.record_insert();
        let _ = lock.value.set(Arc::clone(&value));
        Ok(value)
    }

    /// ピン留めされていない全エントリを破棄する
    pub fn clear(&self) {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let n = shard.clear_unpinned();
            self.entries.fetch_sub(n, Ordering::AcqRel);
            removed += n;
        }
        log::debug!("NNCache clear: removed={}", removed);
    }

    /// 容量を変更する
    ///
    /// 縮小時はピン留めされていないエントリを LRU 順に追い出す。ピン留め中の
    /// エントリは解放された時点で追い出される。
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
        let shard_count = self.shards.len();
        let mut evicted = 0;
        // 超過している間は、まず取り分より多いシャードから追い出す
        for (i, shard) in self.shards.iter().enumerate() {
            let mut shard = shard.lock();
            let limit = fair_share(capacity, shard_count, i);
            while self.entries.load(Ordering::Acquire) > capacity && shard.evict_above(limit) {
                self.entries.fetch_sub(1, Ordering::AcqRel);
                evicted += 1;
            }
        }
        for shard in self.shards.iter() {
            evicted += self.shrink_shard_to_capacity(&mut shard.lock());
        }
        self.counters.record_evictions(evicted);
        self.full_warned.store(false, Ordering::Relaxed);
        log::info!("NNCache resize: capacity={} evicted={}", capacity, evicted);
    }

    /// 容量（エントリ数）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    /// シャード数
    #[inline]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// 現在のエントリ数（pending を含む）
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 使用率を1000分率で返す
    pub fn usage_permille(&self) -> u32 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }
        ((self.len().min(capacity) * 1000) / capacity) as u32
    }

    /// 統計情報を取得
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// 統計情報をリセット
    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// ロックが ready な値を読む
    pub(super) fn ready_value(&self, shard: usize, slot: u32) -> Option<Arc<V>> {
        let shard = self.shards[shard].lock();
        match &shard.slots[slot as usize].state {
            SlotState::Ready(value) => Some(Arc::clone(value)),
            SlotState::Pending { .. } => None,
        }
    }

    /// ロックの解放
    ///
    /// 予約者が値を書かずに手放した pending エントリは放棄扱いになり、
    /// 参照が無くなった時点で破棄される。
    pub(super) fn release(&self, shard_idx: usize, i: u32, owner: bool) {
        let mut shard = self.shards[shard_idx].lock();
        let orphaned = {
            let slot = &mut shard.slots[i as usize];
            debug_assert!(slot.ref_count > 0, "release of an unpinned entry");
            slot.ref_count -= 1;
            if owner {
                if let SlotState::Pending { owned } = &mut slot.state {
                    *owned = false;
                }
            }
            slot.ref_count == 0 && matches!(slot.state, SlotState::Pending { owned: false })
        };
        if orphaned {
            shard.remove(i);
            self.entries.fetch_sub(1, Ordering::AcqRel);
        }
        // 縮小時にピン留めで残ったエントリ
        let evicted = self.shrink_shard_to_capacity(&mut shard);
        drop(shard);
        if evicted > 0 {
            self.counters.record_evictions(evicted);
        }
    }

    /// キーの上位ビットからシャードを決める
    #[inline]
    fn shard_index(&self, key: u64) -> usize {
        ((key as u128 * self.shards.len() as u128) >> 64) as usize
    }
}

/// 縮小時の i 番目のシャードの取り分（余りは先頭のシャードに配る）
#[inline]
fn fair_share(capacity: usize, shard_count: usize, i: usize) -> usize {
    capacity / shard_count + usize::from(i < capacity % shard_count)
}
