//! 設定
//!
//! 構築時に一度だけ渡す固定の設定束。TOML から読み込める。
//!
//! ```toml
//! [cache]
//! capacity = 200000
//! shards = 16
//!
//! [computation]
//! softmax_temperature = 1.359
//! history_fill = "fen_only"
//! history_length = 8
//! ```

use crate::cache::DEFAULT_SHARDS;
use crate::encoder::FillEmptyHistory;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// デフォルトのキャッシュ容量（エントリ数）
pub const DEFAULT_CACHE_CAPACITY: usize = 200_000;

/// デフォルトの方策ソフトマックス温度
pub const DEFAULT_SOFTMAX_TEMPERATURE: f32 = 1.359;

/// デフォルトの履歴長（ネットワーク入力に含める局面数）
pub const DEFAULT_HISTORY_LENGTH: usize = 8;

/// キャッシュ本体の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// 容量（エントリ数）。0 でキャッシュ無効
    pub capacity: usize,
    /// シャード数（1シャードあたり `MIN_SHARD_ENTRIES` 件以上になるよう丸められる）
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            shards: DEFAULT_SHARDS,
        }
    }
}

/// バッチ計算の設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComputationConfig {
    /// 合法手ロジットに掛けるソフトマックス温度
    pub softmax_temperature: f32,
    /// 履歴が足りないときの埋め方
    pub history_fill: FillEmptyHistory,
    /// ネットワーク入力に含める履歴の局面数
    pub history_length: usize,
}

impl CacheConfig {
    /// 値の範囲を検証する
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "cache.capacity must be <= {} (got {})",
                u32::MAX,
                self.capacity
            )));
        }
        Ok(())
    }
}

impl ComputationConfig {
    /// 値の範囲を検証する
    pub fn validate(&self) -> Result<(), ConfigError> {
        let temp = self.softmax_temperature;
        if !temp.is_finite() || temp <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "computation.softmax_temperature must be finite and > 0 (got {temp})"
            )));
        }
        if self.history_length == 0 {
            return Err(ConfigError::Invalid(
                "computation.history_length must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ComputationConfig {
    fn default() -> Self {
        Self {
            softmax_temperature: DEFAULT_SOFTMAX_TEMPERATURE,
            history_fill: FillEmptyHistory::default(),
            history_length: DEFAULT_HISTORY_LENGTH,
        }
    }
}

/// 評価キャッシュ全体の設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluatorConfig {
    pub cache: CacheConfig,
    pub computation: ComputationConfig,
}

impl EvaluatorConfig {
    /// TOML 文字列から読み込み、検証する
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML ファイルから読み込み、検証する
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 値の範囲を検証する
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.computation.validate()
    }
}
