//! ネットワーク評価エンジンのインターフェース
//!
//! 実際の順伝播（CPU/GPU バックエンド）はこのクレートの外側にある。
//! キャッシュ層はここで定義するトレイトにだけ依存する。

/// ビットボード1枚分の入力プレーン
///
/// `mask` の立っているマスに `value` が入る。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputPlane {
    pub mask: u64,
    pub value: f32,
}

impl InputPlane {
    pub const fn new(mask: u64, value: f32) -> Self {
        Self { mask, value }
    }

    /// 全マス `value` のプレーン
    pub const fn filled(value: f32) -> Self {
        Self { mask: u64::MAX, value }
    }
}

impl Default for InputPlane {
    fn default() -> Self {
        Self { mask: 0, value: 1.0 }
    }
}

/// 1局面分のネットワーク入力
pub type InputPlanes = Vec<InputPlane>;

/// 1回のバッチ計算
///
/// `add_input` で局面を積み、`compute_blocking` で順伝播を実行した後、
/// スロット番号で出力を読む。1つのバッチは1つのセッションが専有する。
pub trait NetworkComputation {
    /// 局面をバッチに追加し、そのスロット番号を返す
    fn add_input(&mut self, input: InputPlanes) -> usize;

    /// 積まれた全スロットの順伝播（ブロッキング）
    fn compute_blocking(&mut self) -> anyhow::Result<()>;

    /// 積まれたスロット数
    fn batch_size(&self) -> usize;

    /// 評価値 [-1, 1]
    fn q_val(&self, sample: usize) -> f32;

    /// 引き分け確率（WDL ヘッドが無いモデルは 0）
    fn d_val(&self, sample: usize) -> f32;

    /// 残り手数の推定値
    fn m_val(&self, sample: usize) -> f32;

    /// 方策ロジット（`move_id` はネットワークの方策インデックス）
    fn p_val(&self, sample: usize, move_id: u16) -> f32;
}

/// バッチ計算を作るネットワーク
pub trait Network: Send + Sync {
    type Computation: NetworkComputation;

    fn new_computation(&self) -> Self::Computation;
}
