use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use nncache_core::EvaluatorConfig;
use tools::workload::{self, WorkloadConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Load generator for the NN evaluation cache")]
struct Cli {
    /// 設定ファイル（TOML。未指定時はデフォルト設定）
    #[arg(long)]
    config: Option<PathBuf>,

    /// ワーカースレッド数
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// スレッドあたりのセッション数
    #[arg(long, default_value_t = 200)]
    sessions: usize,

    /// セッションあたりの局面数
    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// 共有プールの局面数
    #[arg(long, default_value_t = 20_000)]
    positions: usize,

    /// キャッシュ容量（設定ファイルより優先）
    #[arg(long)]
    capacity: Option<usize>,

    /// シャード数（設定ファイルより優先）
    #[arg(long)]
    shards: Option<usize>,

    /// 乱数シード
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// 順伝播1回あたりの疑似遅延(us)
    #[arg(long, default_value_t = 0)]
    latency_us: u64,

    /// 結果を JSON で出力
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    if cli.threads == 0 {
        bail!("--threads must be >= 1");
    }
    if cli.positions == 0 {
        bail!("--positions must be >= 1");
    }

    let mut evaluator = match &cli.config {
        Some(path) => EvaluatorConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EvaluatorConfig::default(),
    };
    if let Some(capacity) = cli.capacity {
        evaluator.cache.capacity = capacity;
    }
    if let Some(shards) = cli.shards {
        evaluator.cache.shards = shards;
    }
    evaluator.validate()?;

    let workload = WorkloadConfig {
        threads: cli.threads,
        sessions: cli.sessions,
        batch_size: cli.batch_size,
        positions: cli.positions,
        seed: cli.seed,
        latency: Duration::from_micros(cli.latency_us),
    };

    let report = workload::run(&workload, &evaluator)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    log::info!(
        "nncache-bench done: hit_rate={:.1}% saved={:.1}%",
        report.cache.hit_rate_percent(),
        report.saved_ratio() * 100.0
    );
    Ok(())
}
