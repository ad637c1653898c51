//! 評価キャッシュの負荷生成
//!
//! 複数の探索スレッドを模して、共有プールから偏った分布で局面を引き、
//! `CachingComputation` のセッションを回し続ける。同じ局面が別スレッドで
//! 同時に要求される（置換）状況を意図的に作る。

use anyhow::{Context, Result};
use nncache_core::mock::{MockEncoder, MockHistory, MockNetwork};
use nncache_core::{
    CacheStats, CachingComputation, ComputationError, EvaluatorConfig, NNCache, Network,
};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// 負荷の形
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadConfig {
    /// ワーカースレッド数
    pub threads: usize,
    /// スレッドあたりのセッション数
    pub sessions: usize,
    /// セッションあたりの局面数
    pub batch_size: usize,
    /// 共有プールの局面数
    pub positions: usize,
    pub seed: u64,
    /// 順伝播1回あたりの疑似遅延
    #[serde(serialize_with = "serialize_micros")]
    pub latency: Duration,
}

fn serialize_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            sessions: 200,
            batch_size: 64,
            positions: 20_000,
            seed: 1,
            latency: Duration::ZERO,
        }
    }
}

/// 共有の局面プール
#[derive(Debug, Clone)]
pub struct PositionPool {
    entries: Vec<(MockHistory, Vec<u16>)>,
}

impl PositionPool {
    /// 乱数で局面と合法手を作る
    pub fn generate(count: usize, seed: u64) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let entries = (0..count)
            .map(|_| {
                let plies = rng.random_range(1..=6);
                let history = MockHistory::new((0..plies).map(|_| rng.random::<u64>()).collect::<Vec<_>>());
                let num_moves = rng.random_range(1..=80);
                let moves = (0..num_moves).map(|_| rng.random_range(0..1858u16)).collect();
                (history, moves)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, i: usize) -> (&MockHistory, &[u16]) {
        let (history, moves) = &self.entries[i];
        (history, moves)
    }
}

/// プールの先頭側に偏った添字（一様乱数の2乗）
pub fn skewed_index(rng: &mut impl Rng, len: usize) -> usize {
    let u: f64 = rng.random();
    ((u * u * len as f64) as usize).min(len.saturating_sub(1))
}

/// ワーカー1つ分の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub sessions: u64,
    /// 要求した局面数（ヒット・重複を含む）
    pub samples: u64,
    /// 親バッチに積んだ局面数
    pub misses: u64,
    /// 他スレッドの計算待ちで結果が得られなかった局面数
    pub unavailable: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: &WorkerReport) {
        self.sessions += other.sessions;
        self.samples += other.samples;
        self.misses += other.misses;
        self.unavailable += other.unavailable;
    }
}

/// 実行結果
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub workload: WorkloadConfig,
    pub capacity: usize,
    pub shards: usize,
    pub elapsed_ms: u128,
    pub totals: WorkerReport,
    pub forward_passes: usize,
    pub computed_samples: usize,
    pub samples_per_sec: f64,
    pub usage_permille: u32,
    pub cache: CacheStats,
}

impl BenchReport {
    /// 要求された局面のうちネットワークまで届かなかった割合
    pub fn saved_ratio(&self) -> f64 {
        if self.totals.samples == 0 {
            return 0.0;
        }
        1.0 - self.computed_samples as f64 / self.totals.samples as f64
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "threads={} sessions/thread={} batch={} positions={} capacity={} shards={}",
            self.workload.threads,
            self.workload.sessions,
            self.workload.batch_size,
            self.workload.positions,
            self.capacity,
            self.shards
        )?;
        writeln!(
            f,
            "elapsed={}ms samples={} ({:.0}/s) computed={} forward_passes={} saved={:.1}%",
            self.elapsed_ms,
            self.totals.samples,
            self.samples_per_sec,
            self.computed_samples,
            self.forward_passes,
            self.saved_ratio() * 100.0
        )?;
        writeln!(
            f,
            "unavailable={} usage={}‰",
            self.totals.unavailable, self.usage_permille
        )?;
        write!(f, "{}", self.cache)
    }
}

/// 負荷を流して集計する
pub fn run(workload: &WorkloadConfig, evaluator: &EvaluatorConfig) -> Result<BenchReport> {
    anyhow::ensure!(workload.threads >= 1, "threads must be >= 1");
    anyhow::ensure!(workload.positions >= 1, "positions must be >= 1");

    let cache = NNCache::from_config(&evaluator.cache);
    let network = MockNetwork::with_latency(workload.latency);
    let encoder = MockEncoder::default();
    let pool = PositionPool::generate(workload.positions, workload.seed);

    log::info!(
        "nncache-bench: threads={} sessions={} batch={} positions={}",
        workload.threads,
        workload.sessions,
        workload.batch_size,
        workload.positions
    );

    let start = Instant::now();
    let reports: Vec<Result<WorkerReport>> = thread::scope(|s| {
        let handles: Vec<_> = (0..workload.threads)
            .map(|thread_id| {
                let (cache, network, encoder, pool) = (&cache, &network, &encoder, &pool);
                s.spawn(move || {
                    run_worker(thread_id, workload, evaluator, cache, network, encoder, pool)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(report) => report,
                Err(_) => Err(anyhow::anyhow!("worker thread panicked")),
            })
            .collect()
    });
    let elapsed = start.elapsed();

    let mut totals = WorkerReport::default();
    for (thread_id, report) in reports.into_iter().enumerate() {
        let report = report.with_context(|| format!("worker {thread_id} failed"))?;
        log::debug!("worker {}: {:?}", thread_id, report);
        totals.merge(&report);
    }

    let secs = elapsed.as_secs_f64();
    Ok(BenchReport {
        workload: workload.clone(),
        capacity: cache.capacity(),
        shards: cache.shard_count(),
        elapsed_ms: elapsed.as_millis(),
        totals,
        forward_passes: network.forward_passes(),
        computed_samples: network.computed_samples(),
        samples_per_sec: if secs > 0.0 { totals.samples as f64 / secs } else { 0.0 },
        usage_permille: cache.usage_permille(),
        cache: cache.stats(),
    })
}

fn run_worker(
    thread_id: usize,
    workload: &WorkloadConfig,
    evaluator: &EvaluatorConfig,
    cache: &NNCache,
    network: &MockNetwork,
    encoder: &MockEncoder,
    pool: &PositionPool,
) -> Result<WorkerReport> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(workload.seed.wrapping_add(thread_id as u64));
    let mut report = WorkerReport::default();

    for _ in 0..workload.sessions {
        let mut session = CachingComputation::new(
            network.new_computation(),
            encoder,
            cache,
            &evaluator.computation,
        )?;
        session.reserve(workload.batch_size);
        for _ in 0..workload.batch_size {
            let (history, moves) = pool.get(skewed_index(&mut rng, pool.len()));
            session.add_input(history, moves)?;
        }
        session.compute_blocking()?;

        for sample in 0..session.batch_size() {
            match session.q_val(sample) {
                Ok(_) => {}
                Err(ComputationError::Unavailable { .. }) => report.unavailable += 1,
                Err(err) => return Err(err.into()),
            }
        }
        report.sessions += 1;
        report.samples += session.batch_size() as u64;
        report.misses += session.cache_misses() as u64;
    }

    Ok(report)
}
