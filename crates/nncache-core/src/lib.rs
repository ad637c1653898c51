//! # nncache-core
//!
//! 探索とニューラルネットワーク推論の間に置く評価キャッシュ層。
//!
//! ## モジュール構成
//!
//! - `pfloat16`: 確率値用の16bit圧縮形式
//! - `eval`: キャッシュされる評価値（q/d/m と合法手の方策）
//! - `cache`: ハッシュキーの容量固定キャッシュ（pending/ready、参照カウント、LRU）
//! - `network` / `encoder`: 外部の推論エンジンと局面エンコーダのインターフェース
//! - `computation`: キャッシュ付きバッチ計算（重複排除）
//! - `config`: 設定
//! - `error`: エラー型
//! - `mock`: テスト・ベンチマーク用のダミー実装
//!

pub mod cache;
pub mod computation;
pub mod config;
pub mod encoder;
pub mod error;
pub mod eval;
pub mod mock;
pub mod network;
pub mod pfloat16;

pub use cache::{CacheLock, CacheStats, HashKeyedCache, Lookup, NNCache, NNCacheLock};
pub use computation::CachingComputation;
pub use config::{CacheConfig, ComputationConfig, EvaluatorConfig};
pub use encoder::{EncodedPosition, FillEmptyHistory, PositionEncoder};
pub use error::{CacheError, ComputationError, ComputationResult, ConfigError};
pub use eval::CachedEvaluation;
pub use network::{InputPlane, InputPlanes, Network, NetworkComputation};
pub use pfloat16::PFloat16;
