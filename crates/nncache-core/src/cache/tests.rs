//! Test modules for the evaluation cache

use super::*;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::mock::mix64;
use std::sync::{Arc, Barrier};
use std::thread;

fn eval(q: f32) -> CachedEvaluation {
    CachedEvaluation {
        q,
        ..CachedEvaluation::default()
    }
}

/// 予約して即座に値を書き込む
fn populate(cache: &NNCache, key: u64, q: f32) {
    match cache.lookup_or_reserve(key) {
        Lookup::Reserved(lock) => {
            cache.insert_result(&lock, eval(q)).unwrap();
        }
        other => panic!("expected reservation for {key}, got {other:?}"),
    }
}

#[cfg(test)]
mod lookup_tests {
    use super::*;

    #[test]
    fn test_reserve_insert_hit() {
        let cache = NNCache::new(16, 1);

        let lock = cache.lookup_or_reserve(42).into_lock().unwrap();
        assert!(lock.is_reservation());
        assert!(!lock.is_ready());
        assert!(lock.value().is_none());

        let stored = cache.insert_result(&lock, eval(0.25)).unwrap();
        assert_eq!(stored.q, 0.25);
        assert!(lock.is_ready());
        drop(lock);

        match cache.lookup_or_reserve(42) {
            Lookup::Ready(lock) => {
                assert!(!lock.is_reservation());
                assert_eq!(lock.value().unwrap().q, 0.25);
            }
            other => panic!("expected ready entry, got {other:?}"),
        }

        let stats = cache.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.reservations, 1);
        assert_eq!(stats.inserts, 1);
    }

    #[test]
    fn test_second_lookup_sees_pending() {
        let cache = NNCache::new(16, 1);
        let owner = cache.lookup_or_reserve(7);
        assert!(matches!(owner, Lookup::Reserved(_)));

        let waiter = cache.lookup_or_reserve(7);
        assert!(waiter.found());
        let Lookup::Pending(waiter) = waiter else {
            panic!("expected pending entry");
        };
        assert!(waiter.value().is_none());

        let owner = owner.into_lock().unwrap();
        cache.insert_result(&owner, eval(-0.5)).unwrap();
        // 待っていた側のロックからも値が見える
        assert_eq!(waiter.value().unwrap().q, -0.5);
        assert_eq!(cache.stats().pending_hits, 1);
    }

    #[test]
    fn test_insert_is_write_once() {
        let cache = NNCache::new(16, 1);
        let lock = cache.lookup_or_reserve(9).into_lock().unwrap();
        cache.insert_result(&lock, eval(0.1)).unwrap();

        let err = cache.insert_result(&lock, eval(0.9)).unwrap_err();
        assert_eq!(err, CacheError::AlreadyPopulated { key: 9 });
        assert_eq!(cache.peek_ready(9).unwrap().value().unwrap().q, 0.1);
    }

    #[test]
    fn test_insert_from_non_owner_rejected() {
        let cache = NNCache::new(16, 1);
        let owner = cache.lookup_or_reserve(5).into_lock().unwrap();
        let waiter = cache.lookup_or_reserve(5).into_lock().unwrap();

        let err = cache.insert_result(&waiter, eval(0.3)).unwrap_err();
        assert_eq!(err, CacheError::NotReservationOwner { key: 5 });
        assert!(cache.peek_ready(5).is_none());

        cache.insert_result(&owner, eval(0.4)).unwrap();
        assert_eq!(waiter.value().unwrap().q, 0.4);
    }

    #[test]
    fn test_insert_through_other_cache_rejected() {
        let cache = NNCache::new(16, 1);
        let other = NNCache::new(16, 1);
        let lock = cache.lookup_or_reserve(21).into_lock().unwrap();
        // 別キャッシュ側にも同じシャード・スロットのエントリを作っておく
        populate(&other, 99, 0.9);

        assert_eq!(
            other.insert_result(&lock, eval(0.3)).unwrap_err(),
            CacheError::ForeignLock { key: 21 }
        );
        assert_eq!(other.peek_ready(99).unwrap().value().unwrap().q, 0.9);
        assert!(other.peek_ready(21).is_none());

        // 元のキャッシュの予約はそのまま使える
        cache.insert_result(&lock, eval(0.3)).unwrap();
        assert_eq!(cache.peek_ready(21).unwrap().value().unwrap().q, 0.3);
    }

    #[test]
    fn test_peek_ready_does_not_reserve() {
        let cache = NNCache::new(16, 1);
        assert!(cache.peek_ready(1).is_none());
        assert_eq!(cache.len(), 0);

        let lock = cache.lookup_or_reserve(1).into_lock().unwrap();
        assert!(cache.peek_ready(1).is_none());
        cache.insert_result(&lock, eval(0.0)).unwrap();
        assert!(cache.peek_ready(1).is_some());

        let stats = cache.stats();
        assert_eq!(stats.lookups, 1);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let cache = NNCache::new(0, 4);
        assert!(matches!(cache.lookup_or_reserve(1), Lookup::Full));
        assert!(matches!(cache.lookup_or_reserve(1), Lookup::Full));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.usage_permille(), 0);
        assert_eq!(cache.stats().rejections, 2);
    }
}

#[cfg(test)]
mod eviction_tests {
    use super::*;

    #[test]
    fn test_lru_eviction_order() {
        let cache = NNCache::new(2, 1);
        populate(&cache, 1, 0.1);
        populate(&cache, 2, 0.2);

        // 1 を使って 2 を最古にする
        assert!(matches!(cache.lookup_or_reserve(1), Lookup::Ready(_)));
        populate(&cache, 3, 0.3);

        assert!(cache.peek_ready(1).is_some());
        assert!(cache.peek_ready(2).is_none());
        assert!(cache.peek_ready(3).is_some());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_peek_does_not_refresh_recency() {
        let cache = NNCache::new(2, 1);
        populate(&cache, 1, 0.1);
        populate(&cache, 2, 0.2);

        drop(cache.peek_ready(1));
        populate(&cache, 3, 0.3);
        assert!(cache.peek_ready(1).is_none());
        assert!(cache.peek_ready(2).is_some());
    }

    #[test]
    fn test_pinned_entries_are_never_evicted() {
        let cache = NNCache::new(2, 1);
        populate(&cache, 1, 0.1);
        populate(&cache, 2, 0.2);

        let pinned = cache.peek_ready(1).unwrap();
        populate(&cache, 3, 0.3);
        assert!(cache.peek_ready(1).is_some());
        assert!(cache.peek_ready(2).is_none());
        assert_eq!(pinned.value().unwrap().q, 0.1);
    }

    #[test]
    fn test_full_when_everything_pinned() {
        let cache = NNCache::new(2, 1);
        let a = cache.lookup_or_reserve(1).into_lock().unwrap();
        let b = cache.lookup_or_reserve(2).into_lock().unwrap();

        assert!(matches!(cache.lookup_or_reserve(3), Lookup::Full));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().rejections, 1);

        cache.insert_result(&a, eval(0.1)).unwrap();
        drop(a);
        // 1 が解放されたので追い出して予約できる
        assert!(matches!(cache.lookup_or_reserve(3), Lookup::Reserved(_)));
        drop(b);
    }

    #[test]
    fn test_default_shards_capacity_two_evicts_least_recent() {
        for trial in 0..200u64 {
            let cache = NNCache::from_config(&CacheConfig {
                capacity: 2,
                ..CacheConfig::default()
            });
            let [a, b, c] = [0, 1, 2].map(|n| mix64(trial * 3 + n));
            populate(&cache, a, 0.1);
            populate(&cache, b, 0.2);
            populate(&cache, c, 0.3);

            assert!(cache.peek_ready(a).is_none(), "trial={trial}");
            assert!(matches!(cache.lookup_or_reserve(b), Lookup::Ready(_)), "trial={trial}");
            assert!(cache.peek_ready(c).is_some(), "trial={trial}");
            assert_eq!(cache.len(), 2);
        }
    }

    #[test]
    fn test_pinned_reservations_fill_whole_capacity() {
        let cache = NNCache::new(16, DEFAULT_SHARDS);
        let held: Vec<_> = (0..16u64)
            .map(|n| match cache.lookup_or_reserve(mix64(n)) {
                Lookup::Reserved(lock) => lock,
                other => panic!("reservation {n} rejected with {} entries: {other:?}", cache.len()),
            })
            .collect();
        assert_eq!(cache.len(), 16);
        assert!(matches!(cache.lookup_or_reserve(mix64(16)), Lookup::Full));
        drop(held);
    }

    #[test]
    fn test_pinned_reservations_fill_all_shards() {
        let capacity = MIN_SHARD_ENTRIES * 4;
        let cache = NNCache::new(capacity, 4);
        assert_eq!(cache.shard_count(), 4);

        // キーの偏りで1シャードに集まっても、全体の容量までは予約できる
        let held: Vec<_> = (0..capacity as u64)
            .map(|n| match cache.lookup_or_reserve(mix64(n)) {
                Lookup::Reserved(lock) => lock,
                other => panic!("reservation {n} rejected: {other:?}"),
            })
            .collect();
        assert_eq!(cache.len(), capacity);
        assert!(matches!(cache.lookup_or_reserve(mix64(capacity as u64)), Lookup::Full));
        assert_eq!(cache.stats().evictions, 0);
        drop(held);
    }

    #[test]
    fn test_full_shard_evicts_from_other_shard() {
        let capacity = MIN_SHARD_ENTRIES * 2;
        let cache = NNCache::new(capacity, 2);
        assert_eq!(cache.shard_count(), 2);

        // 上位ビットが 0 のキーは全てシャード 0 に入る
        for key in 0..capacity as u64 {
            populate(&cache, key, key as f32);
        }
        assert_eq!(cache.len(), capacity);

        // シャード 1 は空なので、シャード 0 の LRU 末尾を追い出して予約する
        let lock = cache.lookup_or_reserve(1 << 63).into_lock().unwrap();
        assert!(lock.is_reservation());
        assert_eq!(cache.len(), capacity);
        assert!(cache.peek_ready(0).is_none());
        assert!(cache.peek_ready(1).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().rejections, 0);
    }

    #[test]
    fn test_abandoned_reservation_is_freed() {
        let cache = NNCache::new(4, 1);
        let lock = cache.lookup_or_reserve(11).into_lock().unwrap();
        assert_eq!(cache.len(), 1);
        drop(lock);
        assert_eq!(cache.len(), 0);
        assert!(matches!(cache.lookup_or_reserve(11), Lookup::Reserved(_)));
    }

    #[test]
    fn test_abandoned_reservation_reclaimed_while_waiter_pinned() {
        let cache = NNCache::new(4, 1);
        let owner = cache.lookup_or_reserve(12).into_lock().unwrap();
        let waiter = cache.lookup_or_reserve(12).into_lock().unwrap();
        drop(owner);

        // 待っている側がピン留めしているので残るが、次の検索で再予約できる
        assert_eq!(cache.len(), 1);
        let reclaimed = cache.lookup_or_reserve(12);
        let Lookup::Reserved(reclaimed) = reclaimed else {
            panic!("expected the abandoned entry to be re-reserved");
        };
        cache.insert_result(&reclaimed, eval(0.7)).unwrap();
        assert_eq!(waiter.value().unwrap().q, 0.7);
    }

    #[test]
    fn test_clear_keeps_pinned_entries() {
        let cache = NNCache::new(8, 2);
        for key in 0..4u64 {
            populate(&cache, key << 60, key as f32);
        }
        let pinned = cache.peek_ready(1 << 60).unwrap();
        cache.clear();
        assert_eq!(cache.len(), 1);
        assert!(cache.peek_ready(1 << 60).is_some());
        drop(pinned);
    }

    #[test]
    fn test_set_capacity_shrinks() {
        let cache = NNCache::new(8, 1);
        for key in 0..8u64 {
            populate(&cache, key, key as f32);
        }
        assert_eq!(cache.usage_permille(), 1000);

        cache.set_capacity(3);
        assert_eq!(cache.capacity(), 3);
        assert_eq!(cache.len(), 3);
        // 最近の3つが残る
        for key in 5..8u64 {
            assert!(cache.peek_ready(key).is_some());
        }
        assert_eq!(cache.stats().evictions, 5);
    }

    #[test]
    fn test_shrink_with_pinned_entries_is_deferred() {
        let cache = NNCache::new(4, 1);
        for key in 0..4u64 {
            populate(&cache, key, key as f32);
        }
        let pins: Vec<_> = (0..4u64).filter_map(|key| cache.peek_ready(key)).collect();
        cache.set_capacity(1);
        assert_eq!(cache.len(), 4);

        drop(pins);
        assert_eq!(cache.len(), 1);
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[test]
    fn test_exactly_one_reservation_under_race() {
        let cache = NNCache::new(1024, 8);
        let threads = 8;
        let barrier = Barrier::new(threads);
        let key = 0xDEAD_BEEF_u64;

        let reserved: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        let lookup = cache.lookup_or_reserve(key);
                        let reserved = matches!(lookup, Lookup::Reserved(_));
                        // 全員が検索し終えるまでロックを保持する
                        barrier.wait();
                        drop(lookup);
                        usize::from(reserved)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(reserved, 1);
    }

    #[test]
    fn test_concurrent_fill_respects_capacity() {
        let cache = Arc::new(NNCache::new(256, 4));
        let handles: Vec<_> = (0..4u64)
            .map(|thread_id| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..2000u64 {
                        // 偶数回目は全スレッド共通の16局面、奇数回目は毎回新しい局面
                        let key = if i % 2 == 0 {
                            crate::mock::mix64(i % 16)
                        } else {
                            crate::mock::mix64(thread_id * 10_000 + i)
                        };
                        if let Lookup::Reserved(lock) = cache.lookup_or_reserve(key) {
                            cache.insert_result(&lock, eval(i as f32)).unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.len() <= 256);
        let stats = cache.stats();
        assert_eq!(stats.lookups, 8000);
        assert!(stats.evictions > 0);
        assert!(stats.hit_rate() > 0.0);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Lookup(u64),
        Release(usize),
        Fill(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..12).prop_map(Op::Lookup),
            any::<usize>().prop_map(Op::Release),
            any::<usize>().prop_map(Op::Fill),
        ]
    }

    proptest! {
        #[test]
        fn pinned_entries_are_never_evicted(ops in proptest::collection::vec(op(), 1..200)) {
            let cache = NNCache::new(4, 1);
            let mut held: Vec<NNCacheLock<'_>> = Vec::new();

            for op in ops {
                match op {
                    Op::Lookup(key) => {
                        if let Some(lock) = cache.lookup_or_reserve(key).into_lock() {
                            held.push(lock);
                        }
                    }
                    Op::Release(i) => {
                        if !held.is_empty() {
                            let n = held.len();
                            held.swap_remove(i % n);
                        }
                    }
                    Op::Fill(i) => {
                        if !held.is_empty() {
                            let lock = &held[i % held.len()];
                            let _ = cache.insert_result(lock, eval(1.0));
                        }
                    }
                }

                prop_assert!(cache.len() <= 4);
                for lock in &held {
                    if lock.is_ready() {
                        prop_assert!(cache.peek_ready(lock.key()).is_some());
                    }
                }
            }

            drop(held);
            // 放棄された予約は残らない
            cache.clear();
            prop_assert_eq!(cache.len(), 0);
        }
    }
}
