//! 評価キャッシュモジュール
//!
//! 64bit の局面ハッシュをキーに、ネットワークの評価結果を保持する。
//!
//! - `HashKeyedCache`: シャード分割されたテーブル本体
//! - `CacheLock`: エントリを参照カウントでピン留めするハンドル
//! - `Lookup`: 検索結果（ready / pending / 新規予約 / 満杯）
//! - `CacheStats`: ヒット率などの統計
//!
//! # エビクション
//!
//! 容量はテーブル全体のエントリ数。容量を超える予約のときだけ追い出す。
//! シャード内では厳密な LRU、テーブル全体では近似 LRU（まず予約先のシャードから、
//! 無ければ他のシャードから追い出す）。`2 * MIN_SHARD_ENTRIES` 未満の容量は
//! 1シャードになるので厳密な LRU。
//! 参照カウントが 0 のエントリだけが追い出し対象になる。
//! 容量いっぱいで全エントリがピン留めされている場合だけ、新しいキーの予約は
//! `Lookup::Full` で拒否される（呼び出し側はキャッシュせずに計算する）。

mod lock;
mod stats;
mod table;
#[cfg(test)]
mod tests;

pub use lock::CacheLock;
pub use stats::CacheStats;
pub use table::{HashKeyedCache, Lookup, MIN_SHARD_ENTRIES};

use crate::eval::CachedEvaluation;

/// ネットワーク評価用のキャッシュ
pub type NNCache = HashKeyedCache<CachedEvaluation>;

/// `NNCache` のエントリロック
pub type NNCacheLock<'a> = CacheLock<'a, CachedEvaluation>;

/// デフォルトのシャード数
pub const DEFAULT_SHARDS: usize = 16;
