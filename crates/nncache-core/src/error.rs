//! Error types for the evaluation cache
//!
//! 通常のミスやエビクションはエラーにしない。ここに並ぶのは
//! 呼び出し側の契約違反、エンジンの失敗、設定の不備だけ。

use std::path::PathBuf;

/// Cache-level contract violations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// エントリは既に ready（書き込みは1回限り）
    #[error("cache entry {key:#018x} is already populated")]
    AlreadyPopulated { key: u64 },

    /// 予約を所有していないロックからの書き込み
    #[error("lock on cache entry {key:#018x} does not own its reservation")]
    NotReservationOwner { key: u64 },

    /// ロックが別のキャッシュのもの
    #[error("lock on cache entry {key:#018x} belongs to another cache")]
    ForeignLock { key: u64 },
}

/// Errors surfaced by a caching computation session
#[derive(thiserror::Error, Debug)]
pub enum ComputationError {
    #[error("sample {sample} is out of range (batch size {batch_size})")]
    SampleOutOfRange { sample: usize, batch_size: usize },

    #[error("move {move_ct} is out of range for sample {sample} ({num_moves} legal moves)")]
    MoveOutOfRange { sample: usize, move_ct: usize, num_moves: usize },

    /// compute_blocking 前にミスのサンプルを読もうとした
    #[error("sample {sample} has not been computed yet")]
    NotComputed { sample: usize },

    /// 他セッションの計算待ちで、このセッションでは結果が得られなかった
    #[error("sample {sample} is being computed by another session")]
    Unavailable { sample: usize },

    /// 親バッチに積んだミスは取り消せない
    #[error("sample {sample} was a cache miss and cannot be popped")]
    PopMiss { sample: usize },

    #[error("sample {sample} is not a cache hit")]
    NotACacheHit { sample: usize },

    #[error("batch is empty")]
    EmptyBatch,

    #[error("computation has already run")]
    AlreadyComputed,

    /// 前回の compute_blocking が失敗しており、このセッションの結果は無効
    #[error("computation failed earlier; session results are invalid")]
    Poisoned,

    #[error("network forward pass failed: {0:#}")]
    Network(anyhow::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Configuration loading / validation errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Result type for computation sessions
pub type ComputationResult<T> = Result<T, ComputationError>;
