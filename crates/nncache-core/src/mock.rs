//! テスト・ベンチマーク用のダミー実装
//!
//! - `MockNetwork`: 入力プレーンから決定的に出力を作るネットワーク。順伝播の回数や
//!   局面ごとの計算回数を数える。遅延や失敗を注入できる。
//! - `MockEncoder`: 局面キーの列（`MockHistory`）をエンコードする。

use crate::encoder::{EncodedPosition, FillEmptyHistory, PositionEncoder};
use crate::network::{InputPlane, InputPlanes, Network, NetworkComputation};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// splitmix64 の finalizer
#[inline]
pub fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// [0, 1) の一様値
#[inline]
fn unit(x: u64) -> f32 {
    (mix64(x) >> 40) as f32 / (1u64 << 24) as f32
}

/// 入力プレーンの要約値（MockNetwork の出力はこれだけから決まる）
pub fn planes_digest(planes: &[InputPlane]) -> u64 {
    planes.iter().fold(planes.len() as u64, |acc, plane| {
        mix64(acc ^ plane.mask).wrapping_add(plane.value.to_bits() as u64)
    })
}

/// 局面の履歴（各局面を64bitキーで表す）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockHistory {
    plies: Vec<u64>,
    /// 平手（標準の開始局面）から始まったか
    from_startpos: bool,
}

impl MockHistory {
    /// 平手から始まった履歴
    pub fn new(plies: Vec<u64>) -> Self {
        Self {
            plies,
            from_startpos: true,
        }
    }

    /// 任意局面（局面指定）から始まった履歴
    pub fn from_setup(plies: Vec<u64>) -> Self {
        Self {
            plies,
            from_startpos: false,
        }
    }

    /// 1手進める
    pub fn push(&mut self, key: u64) {
        self.plies.push(key);
    }

    /// 現局面のキー
    pub fn last(&self) -> Option<u64> {
        self.plies.last().copied()
    }

    pub fn len(&self) -> usize {
        self.plies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plies.is_empty()
    }
}

/// `MockHistory` 用エンコーダ
///
/// 指し手は方策インデックスそのもの（`u16`）。`transform` は方策インデックスとの XOR。
#[derive(Debug, Clone, Copy, Default)]
pub struct MockEncoder {
    pub transform: u32,
}

impl PositionEncoder for MockEncoder {
    type History = MockHistory;
    type Move = u16;

    fn content_hash(&self, history: &MockHistory, history_length: usize) -> u64 {
        history
            .plies
            .iter()
            .rev()
            .take(history_length)
            .fold(mix64(history_length as u64), |acc, &key| mix64(acc ^ key))
    }

    fn encode(
        &self,
        history: &MockHistory,
        fill: FillEmptyHistory,
        history_length: usize,
    ) -> EncodedPosition {
        let oldest = history.plies.first().copied();
        let fill_with_oldest = match fill {
            FillEmptyHistory::No => false,
            FillEmptyHistory::FenOnly => !history.from_startpos,
            FillEmptyHistory::Always => true,
        };

        let planes = (0..history_length)
            .map(|i| match history.plies.len().checked_sub(i + 1) {
                Some(ply) => InputPlane::new(history.plies[ply], 1.0),
                None => match oldest {
                    Some(key) if fill_with_oldest => InputPlane::new(key, 1.0),
                    _ => InputPlane::new(0, 0.0),
                },
            })
            .collect();

        EncodedPosition {
            planes,
            transform: self.transform,
        }
    }

    fn policy_index(&self, mv: &u16, transform: u32) -> u16 {
        *mv ^ (transform as u16)
    }
}

#[derive(Debug, Default)]
struct MockShared {
    forward_passes: AtomicUsize,
    samples: AtomicUsize,
    per_digest: Mutex<HashMap<u64, usize>>,
    fail_next: AtomicBool,
    latency: Duration,
}

/// 決定的な出力を返すダミーネットワーク
///
/// クローンは統計を共有する。
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    shared: Arc<MockShared>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// 順伝播ごとに `latency` だけブロックする
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            shared: Arc::new(MockShared {
                latency,
                ..MockShared::default()
            }),
        }
    }

    /// 次の順伝播を失敗させる
    pub fn fail_next_compute(&self) {
        self.shared.fail_next.store(true, Ordering::SeqCst);
    }

    /// 実行された順伝播の回数
    pub fn forward_passes(&self) -> usize {
        self.shared.forward_passes.load(Ordering::SeqCst)
    }

    /// 順伝播で計算されたサンプルの総数
    pub fn computed_samples(&self) -> usize {
        self.shared.samples.load(Ordering::SeqCst)
    }

    /// 入力 `planes` が計算された回数
    pub fn times_computed(&self, planes: &[InputPlane]) -> usize {
        let digest = planes_digest(planes);
        self.shared.per_digest.lock().get(&digest).copied().unwrap_or(0)
    }

    /// (q, d, m) の期待値
    pub fn outputs(digest: u64) -> (f32, f32, f32) {
        let q = unit(digest) * 2.0 - 1.0;
        let d = unit(digest ^ 0xD) * (1.0 - q.abs());
        let m = (mix64(digest ^ 0x4D) % 200) as f32;
        (q, d, m)
    }

    /// 方策ロジットの期待値 [-2, 2)
    pub fn logit(digest: u64, move_id: u16) -> f32 {
        unit(digest ^ ((move_id as u64 + 3) << 17)) * 4.0 - 2.0
    }
}

impl Network for MockNetwork {
    type Computation = MockComputation;

    fn new_computation(&self) -> MockComputation {
        MockComputation {
            shared: Arc::clone(&self.shared),
            inputs: Vec::new(),
        }
    }
}

/// `MockNetwork` のバッチ計算
#[derive(Debug)]
pub struct MockComputation {
    shared: Arc<MockShared>,
    inputs: Vec<u64>,
}

impl NetworkComputation for MockComputation {
    fn add_input(&mut self, input: InputPlanes) -> usize {
        self.inputs.push(planes_digest(&input));
        self.inputs.len() - 1
    }

    fn compute_blocking(&mut self) -> anyhow::Result<()> {
        if !self.shared.latency.is_zero() {
            std::thread::sleep(self.shared.latency);
        }
        if self.shared.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected forward pass failure (batch of {})", self.inputs.len());
        }
        self.shared.forward_passes.fetch_add(1, Ordering::SeqCst);
        self.shared.samples.fetch_add(self.inputs.len(), Ordering::SeqCst);
        let mut per_digest = self.shared.per_digest.lock();
        for &digest in &self.inputs {
            *per_digest.entry(digest).or_insert(0) += 1;
        }
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.inputs.len()
    }

    fn q_val(&self, sample: usize) -> f32 {
        MockNetwork::outputs(self.inputs[sample]).0
    }

    fn d_val(&self, sample: usize) -> f32 {
        MockNetwork::outputs(self.inputs[sample]).1
    }

    fn m_val(&self, sample: usize) -> f32 {
        MockNetwork::outputs(self.inputs[sample]).2
    }

    fn p_val(&self, sample: usize, move_id: u16) -> f32 {
        MockNetwork::logit(self.inputs[sample], move_id)
    }
}
