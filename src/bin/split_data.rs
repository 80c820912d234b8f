//! 元画像を train / val / test に分割
#![recursion_limit = "256"]

use std::path::PathBuf;

use clap::Parser;

use mango_leaf_lib::logging::{init_logging, LogLevel};
use mango_leaf_lib::ml_commands::run_split;
use mango_leaf_lib::partition::PartitionConfig;

#[derive(Parser, Debug)]
#[command(name = "split_data")]
#[command(version)]
#[command(about = "Split a class-per-folder image directory into train/val/test")]
struct Cli {
    /// クラスごとのフォルダを含む元ディレクトリ
    #[arg(default_value = "data/raw")]
    source: PathBuf,

    /// 出力先
    #[arg(default_value = "data/processed")]
    output: PathBuf,

    #[arg(long, default_value_t = 0.7)]
    train_ratio: f64,

    #[arg(long, default_value_t = 0.15)]
    val_ratio: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    let config = PartitionConfig {
        train_ratio: cli.train_ratio,
        val_ratio: cli.val_ratio,
        seed: cli.seed,
    };
    let report = run_split(&cli.source, &cli.output, &config)?;

    println!("\n=== 分割結果 ({}) ===", cli.output.display());
    println!("{}", report);

    Ok(())
}
