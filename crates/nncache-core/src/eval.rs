//! キャッシュされる評価値

use crate::pfloat16::PFloat16;
use smallvec::SmallVec;

/// 方策ベクトルのインライン容量
///
/// 典型的な合法手数はこれに収まる。超えた分はヒープに置かれる。
pub const INLINE_POLICY_LEN: usize = 64;

/// 合法手ごとの圧縮済み確率
pub type Policy = SmallVec<[PFloat16; INLINE_POLICY_LEN]>;

/// 1局面分のネットワーク評価
///
/// `policy` は作成時に渡された合法手と同じ順序・同じ長さを持つ。
/// キャッシュに ready として公開された後は不変。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedEvaluation {
    /// 期待勝率相当の評価値 [-1, 1]
    pub q: f32,
    /// 引き分け確率 [0, 1]（WDL ヘッドを持つモデルのみ意味を持つ）
    pub d: f32,
    /// 残り手数の推定値
    pub m: f32,
    /// 合法手のみの方策
    pub p: Policy,
}

impl CachedEvaluation {
    /// 合法手数
    #[inline]
    pub fn num_moves(&self) -> usize {
        self.p.len()
    }

    /// `move_ct` 番目の合法手の確率
    #[inline]
    pub fn policy(&self, move_ct: usize) -> Option<f32> {
        self.p.get(move_ct).map(|p| p.decode())
    }
}
