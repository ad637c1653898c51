//! キャッシュ付きバッチ計算
//!
//! 1つの探索スレッドが1バッチ分の局面を集め、キャッシュに無いものだけを
//! ネットワークの親バッチに積んで順伝播する。
//!
//! - キャッシュヒット: 親バッチに積まず、キャッシュの値を返す
//! - 同一バッチ内の重複: 最初の1つだけを積み、残りはその結果を共有する
//! - 他セッションが計算中: 積まない。計算後に一度だけキャッシュを見直す
//! - キャッシュ満杯: 積んで計算するが、結果はこのセッション内にだけ残る
//!
//! セッションは `add_input` の段階 → `compute_blocking` → 読み出しの段階、の順に一方向に進む。

use crate::cache::{Lookup, NNCache, NNCacheLock};
use crate::config::ComputationConfig;
use crate::encoder::{FillEmptyHistory, PositionEncoder};
use crate::error::{ComputationError, ComputationResult, ConfigError};
use crate::eval::{CachedEvaluation, INLINE_POLICY_LEN};
use crate::network::NetworkComputation;
use crate::pfloat16::PFloat16;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// 合法手の方策インデックス（add_input 時に変換済み）
type MoveIndices = SmallVec<[u16; INLINE_POLICY_LEN]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    /// キャッシュにあった
    Hit,
    /// 親バッチに積んだ
    Miss { idx_in_parent: usize },
    /// 同じセッション内の先行ミスと同じ局面
    Duplicate { idx_in_parent: usize },
    /// 他セッションが計算中
    Pending,
}

#[derive(Debug)]
struct WorkItem<'a> {
    hash: u64,
    /// Hit: ready エントリ / Miss: 予約（満杯なら None）/ Pending: 待ち対象
    lock: Option<NNCacheLock<'a>>,
    kind: ItemKind,
    /// Miss のみ
    moves: MoveIndices,
    result: Option<Arc<CachedEvaluation>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Collecting,
    Computed,
    Failed,
}

/// キャッシュ付きの1バッチ計算
///
/// 親の `NetworkComputation` を専有する。キャッシュとエンコーダは共有で、
/// 複数スレッドのセッションが同じキャッシュを同時に使える。
pub struct CachingComputation<'a, C, E>
where
    C: NetworkComputation,
    E: PositionEncoder,
{
    parent: C,
    encoder: &'a E,
    cache: &'a NNCache,
    softmax_temperature: f32,
    history_fill: FillEmptyHistory,
    history_length: usize,
    batch: Vec<WorkItem<'a>>,
    /// このセッションで親バッチに積んだ局面（hash → 親スロット）
    queued: HashMap<u64, usize>,
    misses: usize,
    state: SessionState,
}

impl<'a, C, E> CachingComputation<'a, C, E>
where
    C: NetworkComputation,
    E: PositionEncoder,
{
    /// セッションを作る
    ///
    /// `config` は検証される（温度が 0 以下だと方策が全て 0 になるため）。
    pub fn new(
        parent: C,
        encoder: &'a E,
        cache: &'a NNCache,
        config: &ComputationConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            parent,
            encoder,
            cache,
            softmax_temperature: config.softmax_temperature,
            history_fill: config.history_fill,
            history_length: config.history_length,
            batch: Vec::new(),
            queued: HashMap::new(),
            misses: 0,
            state: SessionState::Collecting,
        })
    }

    /// キャッシュだけを引く（予約もバッチへの追加もしない）
    ///
    /// ready なエントリがあればその評価を返す。pending や未登録は `None`。
    pub fn cache_lookup(&self, history: &E::History) -> Option<Arc<CachedEvaluation>> {
        let hash = self.encoder.content_hash(history, self.history_length);
        self.cache.peek_ready(hash)?.value()
    }

    /// 局面をバッチに追加する
    ///
    /// キャッシュにあればヒットとして記録し、無ければ予約して親バッチに積む。
    /// `moves` はこの局面の合法手（方策の並び順になる）。
    pub fn add_input(&mut self, history: &E::History, moves: &[E::Move]) -> ComputationResult<()> {
        self.ensure_collecting()?;
        let hash = self.encoder.content_hash(history, self.history_length);

        if let Some(&idx_in_parent) = self.queued.get(&hash) {
            self.batch.push(WorkItem {
                hash,
                lock: None,
                kind: ItemKind::Duplicate { idx_in_parent },
                moves: MoveIndices::new(),
                result: None,
            });
            return Ok(());
        }

        let cache = self.cache;
        match cache.lookup_or_reserve(hash) {
            Lookup::Ready(lock) => {
                let result = lock.value();
                self.batch.push(WorkItem {
                    hash,
                    lock: Some(lock),
                    kind: ItemKind::Hit,
                    moves: MoveIndices::new(),
                    result,
                });
            }
            Lookup::Pending(lock) => {
                log::trace!("CachingComputation: {hash:#018x} is pending in another session");
                self.batch.push(WorkItem {
                    hash,
                    lock: Some(lock),
                    kind: ItemKind::Pending,
                    moves: MoveIndices::new(),
                    result: None,
                });
            }
            Lookup::Reserved(lock) => self.push_miss(hash, Some(lock), history, moves),
            Lookup::Full => self.push_miss(hash, None, history, moves),
        }
        Ok(())
    }

    /// 既にキャッシュにある局面をハッシュだけで追加する
    ///
    /// ready なエントリがあればヒットとして追加して `true`。無ければ何もせず `false`。
    pub fn add_input_by_hash(&mut self, hash: u64) -> ComputationResult<bool> {
        self.ensure_collecting()?;
        let Some(lock) = self.cache.peek_ready(hash) else {
            return Ok(false);
        };
        let result = lock.value();
        self.batch.push(WorkItem {
            hash,
            lock: Some(lock),
            kind: ItemKind::Hit,
            moves: MoveIndices::new(),
            result,
        });
        Ok(true)
    }

    fn push_miss(
        &mut self,
        hash: u64,
        lock: Option<NNCacheLock<'a>>,
        history: &E::History,
        moves: &[E::Move],
    ) {
        let encoded = self.encoder.encode(history, self.history_fill, self.history_length);
        let moves = moves
            .iter()
            .map(|mv| self.encoder.policy_index(mv, encoded.transform))
            .collect();
        let idx_in_parent = self.parent.add_input(encoded.planes);
        self.queued.insert(hash, idx_in_parent);
        self.misses += 1;
        self.batch.push(WorkItem {
            hash,
            lock,
            kind: ItemKind::Miss { idx_in_parent },
            moves,
            result: None,
        });
    }

    /// 最後に追加した項目を取り消す
    ///
    /// 親バッチに積んだミスは取り消せない。ヒット・重複・計算待ちは取り消せる
    /// （保持していたロックも解放される）。
    pub fn pop_last_input_hit(&mut self) -> ComputationResult<()> {
        self.ensure_collecting()?;
        let sample = self.batch.len().checked_sub(1).ok_or(ComputationError::EmptyBatch)?;
        if let ItemKind::Miss { .. } = self.batch[sample].kind {
            return Err(ComputationError::PopMiss { sample });
        }
        self.batch.pop();
        Ok(())
    }

    /// 最後の項目がキャッシュヒットならそれを取り除く
    ///
    /// 計算後でも呼べる（バッチの末尾を捨てるだけ）。
    pub fn pop_cache_hit(&mut self) -> ComputationResult<()> {
        let sample = self.batch.len().checked_sub(1).ok_or(ComputationError::EmptyBatch)?;
        if self.batch[sample].kind != ItemKind::Hit {
            return Err(ComputationError::NotACacheHit { sample });
        }
        self.batch.pop();
        Ok(())
    }

    /// 親バッチに積んだ（実際に計算される）局面数
    #[inline]
    pub fn cache_misses(&self) -> usize {
        self.misses
    }

    /// ヒットを含む全項目数
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch.len()
    }

    /// 予想される項目数で領域を確保する
    pub fn reserve(&mut self, additional: usize) {
        self.batch.reserve(additional);
        self.queued.reserve(additional);
    }

    /// 親バッチを順伝播し、結果をキャッシュに書き込む
    ///
    /// ミスが無ければ順伝播しない。エンジンが失敗した場合はこのセッションの
    /// 結果はすべて無効になり、予約はロックの解放とともに放棄される。
    pub fn compute_blocking(&mut self) -> ComputationResult<()> {
        match self.state {
            SessionState::Collecting => {}
            SessionState::Computed => return Err(ComputationError::AlreadyComputed),
            SessionState::Failed => return Err(ComputationError::Poisoned),
        }

        let mut computed: Vec<Option<Arc<CachedEvaluation>>> = Vec::new();
        if self.misses > 0 {
            if let Err(err) = self.parent.compute_blocking() {
                log::warn!(
                    "CachingComputation: forward pass failed (misses={}): {:#}",
                    self.misses,
                    err
                );
                self.state = SessionState::Failed;
                return Err(ComputationError::Network(err));
            }

            computed.resize(self.parent.batch_size(), None);
            for item in self.batch.iter_mut() {
                let ItemKind::Miss { idx_in_parent } = item.kind else {
                    continue;
                };
                let evaluation = build_evaluation(
                    &self.parent,
                    idx_in_parent,
                    &item.moves,
                    self.softmax_temperature,
                );
                let value = match &item.lock {
                    Some(lock) => match self.cache.insert_result(lock, evaluation) {
                        Ok(value) => value,
                        Err(err) => {
                            self.state = SessionState::Failed;
                            return Err(err.into());
                        }
                    },
                    None => Arc::new(evaluation),
                };
                if let Some(slot) = computed.get_mut(idx_in_parent) {
                    *slot = Some(Arc::clone(&value));
                }
                item.result = Some(value);
            }
        }

        let mut unresolved = 0usize;
        for item in self.batch.iter_mut() {
            match item.kind {
                ItemKind::Duplicate { idx_in_parent } => {
                    item.result = computed.get(idx_in_parent).cloned().flatten();
                }
                ItemKind::Pending => {
                    item.result = item.lock.as_ref().and_then(|lock| lock.value());
                    if item.result.is_none() {
                        unresolved += 1;
                    }
                }
                ItemKind::Hit | ItemKind::Miss { .. } => {}
            }
        }

        log::debug!(
            "CachingComputation: batch={} misses={} unresolved={}",
            self.batch.len(),
            self.misses,
            unresolved
        );
        self.state = SessionState::Computed;
        Ok(())
    }

    /// サンプルの評価全体
    pub fn evaluation(&self, sample: usize) -> ComputationResult<&Arc<CachedEvaluation>> {
        if self.state == SessionState::Failed {
            return Err(ComputationError::Poisoned);
        }
        let item = self.batch.get(sample).ok_or(ComputationError::SampleOutOfRange {
            sample,
            batch_size: self.batch.len(),
        })?;
        if let Some(result) = &item.result {
            return Ok(result);
        }
        match self.state {
            SessionState::Collecting => Err(ComputationError::NotComputed { sample }),
            _ => Err(ComputationError::Unavailable { sample }),
        }
    }

    /// サンプルの結果が読めるか
    pub fn is_available(&self, sample: usize) -> bool {
        self.evaluation(sample).is_ok()
    }

    /// サンプルのハッシュ（キャッシュキー）
    pub fn hash(&self, sample: usize) -> Option<u64> {
        self.batch.get(sample).map(|item| item.hash)
    }

    /// 評価値
    pub fn q_val(&self, sample: usize) -> ComputationResult<f32> {
        Ok(self.evaluation(sample)?.q)
    }

    /// 引き分け確率
    pub fn d_val(&self, sample: usize) -> ComputationResult<f32> {
        Ok(self.evaluation(sample)?.d)
    }

    /// 残り手数の推定値
    pub fn m_val(&self, sample: usize) -> ComputationResult<f32> {
        Ok(self.evaluation(sample)?.m)
    }

    /// `move_ct` 番目の合法手の方策確率
    pub fn p_val(&self, sample: usize, move_ct: usize) -> ComputationResult<f32> {
        let evaluation = self.evaluation(sample)?;
        evaluation
            .policy(move_ct)
            .ok_or(ComputationError::MoveOutOfRange {
                sample,
                move_ct,
                num_moves: evaluation.num_moves(),
            })
    }

    fn ensure_collecting(&self) -> ComputationResult<()> {
        match self.state {
            SessionState::Collecting => Ok(()),
            SessionState::Computed => Err(ComputationError::AlreadyComputed),
            SessionState::Failed => Err(ComputationError::Poisoned),
        }
    }
}

/// 親スロットの出力からキャッシュ用の評価を作る
///
/// 方策は合法手のロジットだけに温度付きソフトマックスを掛け、PFloat16 に圧縮する。
fn build_evaluation<C: NetworkComputation>(
    parent: &C,
    sample: usize,
    moves: &[u16],
    temperature: f32,
) -> CachedEvaluation {
    let mut probs: SmallVec<[f32; INLINE_POLICY_LEN]> =
        moves.iter().map(|&mv| parent.p_val(sample, mv)).collect();
    let max_logit = probs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut total = 0.0f32;
    for p in probs.iter_mut() {
        *p = ((*p - max_logit) / temperature).exp();
        total += *p;
    }
    let scale = if total > 0.0 { 1.0 / total } else { 1.0 };

    CachedEvaluation {
        q: parent.q_val(sample),
        d: parent.d_val(sample),
        m: parent.m_val(sample),
        p: probs.iter().map(|&p| PFloat16::encode(p * scale)).collect(),
    }
}
