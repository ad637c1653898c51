//! キャッシュ統計
//!
//! ホットパスで使うので全カウンタは Relaxed の AtomicU64。
//! スナップショットは各カウンタを個別に読むため、厳密に同一時点の値ではない。

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub(super) struct CacheCounters {
    lookups: AtomicU64,
    hits: AtomicU64,
    pending_hits: AtomicU64,
    reservations: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    rejections: AtomicU64,
}

impl CacheCounters {
    #[inline]
    pub(super) fn record_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_pending_hit(&self) {
        self.pending_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_reservation(&self) {
        self.reservations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(super) fn record_evictions(&self, n: usize) {
        if n > 0 {
            self.evictions.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(super) fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self) -> CacheStats {
        CacheStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            pending_hits: self.pending_hits.load(Ordering::Relaxed),
            reservations: self.reservations.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }

    pub(super) fn reset(&self) {
        for counter in [
            &self.lookups,
            &self.hits,
            &self.pending_hits,
            &self.reservations,
            &self.inserts,
            &self.evictions,
            &self.rejections,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// キャッシュの統計情報
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// `lookup_or_reserve` の呼び出し回数
    pub lookups: u64,
    /// ready なエントリが見つかった回数
    pub hits: u64,
    /// 計算中（pending）のエントリが見つかった回数
    pub pending_hits: u64,
    /// 新規予約（放棄された予約の引き継ぎを含む）
    pub reservations: u64,
    /// pending → ready の書き込み回数
    pub inserts: u64,
    /// LRU による追い出し数
    pub evictions: u64,
    /// 全スロットがピン留めされていて予約できなかった回数
    pub rejections: u64,
}

impl CacheStats {
    /// ヒット率を計算（0.0 - 1.0）
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    /// ヒット率をパーセントで取得
    pub fn hit_rate_percent(&self) -> f64 {
        self.hit_rate() * 100.0
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lookups: {}, hits: {}, pending_hits: {}, reservations: {}, inserts: {}, evictions: {}, rejections: {}, hit_rate: {:.2}%",
            self.lookups,
            self.hits,
            self.pending_hits,
            self.reservations,
            self.inserts,
            self.evictions,
            self.rejections,
            self.hit_rate_percent()
        )
    }
}
