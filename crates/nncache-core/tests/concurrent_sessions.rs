use nncache_core::mock::{MockEncoder, MockHistory, MockNetwork, planes_digest};
use nncache_core::{
    CachingComputation, ComputationConfig, Network, NNCache, PositionEncoder,
};
use std::collections::BTreeSet;
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

const MOVES: [u16; 4] = [1, 2, 3, 4];

fn positions(count: u64) -> Vec<MockHistory> {
    (0..count).map(|i| MockHistory::new(vec![1000 + i, 2000 + i])).collect()
}

/// 全局面が読めるまでセッションを繰り返し、各局面の q を返す
fn evaluate_all(
    network: &MockNetwork,
    encoder: &MockEncoder,
    cache: &NNCache,
    config: &ComputationConfig,
    histories: &[MockHistory],
) -> Vec<f32> {
    let mut q = vec![f32::NAN; histories.len()];
    let mut remaining: BTreeSet<usize> = (0..histories.len()).collect();

    while !remaining.is_empty() {
        let mut session =
            CachingComputation::new(network.new_computation(), encoder, cache, config).unwrap();
        session.reserve(remaining.len());
        let order: Vec<usize> = remaining.iter().copied().collect();
        for &i in &order {
            session.add_input(&histories[i], &MOVES).unwrap();
        }
        session.compute_blocking().unwrap();
        for (sample, &i) in order.iter().enumerate() {
            if let Ok(value) = session.q_val(sample) {
                q[i] = value;
                remaining.remove(&i);
            }
        }
    }
    q
}

#[test]
fn test_each_position_computed_once_across_threads() {
    let network = MockNetwork::with_latency(Duration::from_millis(2));
    let encoder = MockEncoder::default();
    let cache = NNCache::new(4096, 8);
    let config = ComputationConfig::default();
    let histories = positions(64);
    let threads = 6;
    let barrier = Barrier::new(threads);

    let results: Vec<Vec<f32>> = thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let (network, encoder, cache, config) = (&network, &encoder, &cache, &config);
                let (histories, barrier) = (&histories, &barrier);
                s.spawn(move || {
                    // スレッドごとに順番をずらして衝突を起こす
                    let mut rotated = histories.clone();
                    rotated.rotate_left(t * 7 % histories.len());
                    barrier.wait();
                    let q = evaluate_all(network, encoder, cache, config, &rotated);
                    let mut restored = q.clone();
                    restored.rotate_right(t * 7 % histories.len());
                    restored
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for history in &histories {
        let planes = encoder
            .encode(history, config.history_fill, config.history_length)
            .planes;
        assert_eq!(network.times_computed(&planes), 1);
    }
    assert_eq!(network.computed_samples(), histories.len());

    for (i, history) in histories.iter().enumerate() {
        let planes = encoder
            .encode(history, config.history_fill, config.history_length)
            .planes;
        let (expected, _, _) = MockNetwork::outputs(planes_digest(&planes));
        for q in &results {
            assert_eq!(q[i], expected);
        }
    }

    let stats = cache.stats();
    assert_eq!(stats.inserts, histories.len() as u64);
    assert_eq!(cache.len(), histories.len());
}

#[test]
fn test_small_cache_stays_correct_under_contention() {
    let network = MockNetwork::new();
    let encoder = MockEncoder::default();
    let cache = NNCache::new(8, 2);
    let config = ComputationConfig::default();
    let histories = positions(40);

    let results: Vec<Vec<f32>> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| evaluate_all(&network, &encoder, &cache, &config, &histories)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (i, history) in histories.iter().enumerate() {
        let planes = encoder
            .encode(history, config.history_fill, config.history_length)
            .planes;
        let (expected, _, _) = MockNetwork::outputs(planes_digest(&planes));
        for q in &results {
            assert_eq!(q[i], expected);
        }
    }
    assert!(cache.len() <= 8);
    assert!(network.computed_samples() >= histories.len());
}
