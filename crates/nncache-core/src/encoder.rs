//! 局面エンコーダのインターフェース
//!
//! 局面（と履歴）からキャッシュキーとネットワーク入力を作る外部の決定的関数。

use crate::network::InputPlanes;
use serde::{Deserialize, Serialize};

/// 履歴が `history_length` に満たないときの入力の埋め方
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillEmptyHistory {
    /// 埋めない（ゼロプレーン）
    No,
    /// 開始局面が平手以外のときだけ最古の局面で埋める
    #[default]
    FenOnly,
    /// 常に最古の局面で埋める
    Always,
}

/// エンコード結果
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPosition {
    pub planes: InputPlanes,
    /// 盤面の対称変換（方策インデックスの変換に使う）
    pub transform: u32,
}

/// 局面エンコーダ
pub trait PositionEncoder {
    /// 局面と履歴
    type History;
    /// 指し手
    type Move;

    /// キャッシュキー
    ///
    /// 盤面と直近 `history_length` 局面の履歴だけから決まる。合法手の並び順には依存しない。
    fn content_hash(&self, history: &Self::History, history_length: usize) -> u64;

    /// ネットワーク入力へのエンコード
    fn encode(
        &self,
        history: &Self::History,
        fill: FillEmptyHistory,
        history_length: usize,
    ) -> EncodedPosition;

    /// 指し手をネットワークの方策インデックスに変換する
    fn policy_index(&self, mv: &Self::Move, transform: u32) -> u16;
}
