//! 2段階転移学習の実行
//!
//! 学習後に成果物・学習履歴（CSV/SVG）を保存し、test 分割があれば評価します。
#![recursion_limit = "256"]

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use mango_leaf_lib::backend::{cpu_device, effective_device_type, CpuTrainingBackend};
#[cfg(feature = "wgpu")]
use mango_leaf_lib::backend::{gpu_device, GpuTrainingBackend};
use mango_leaf_lib::logging::{init_logging, LogLevel};
use mango_leaf_lib::ml::EpochRecord;
use mango_leaf_lib::ml_commands::run_training;
use mango_leaf_lib::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "train")]
#[command(version)]
#[command(about = "Train the mango leaf classifier (feature extraction, then fine-tuning)")]
struct Cli {
    /// 設定ファイル
    #[arg(long, env = "MANGO_CONFIG")]
    config: Option<PathBuf>,

    /// train/ val/ test/ を含むディレクトリ
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 出力する成果物（tar.gz）
    #[arg(long)]
    model: Option<PathBuf>,

    /// 事前学習済みバックボーン重み
    #[arg(long)]
    pretrained: Option<PathBuf>,

    #[arg(long)]
    feature_extraction_epochs: Option<usize>,

    #[arg(long)]
    fine_tune_epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// CPUバックエンドを使う
    #[arg(long)]
    cpu: bool,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    let mut config = AppConfig::load_or_default(cli.config.unwrap_or_else(AppConfig::default_path));
    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(model) = cli.model {
        config.model.model_path = model.to_string_lossy().into_owned();
    }
    if let Some(pretrained) = cli.pretrained {
        config.model.pretrained_backbone_path = Some(pretrained.to_string_lossy().into_owned());
    }
    if let Some(epochs) = cli.feature_extraction_epochs {
        config.training.feature_extraction_epochs = epochs;
    }
    if let Some(epochs) = cli.fine_tune_epochs {
        config.training.fine_tune_epochs = epochs;
    }
    if let Some(batch_size) = cli.batch_size {
        config.data.batch_size = batch_size;
    }
    if cli.cpu {
        config.device_type = DeviceType::Cpu;
    }
    config.validate()?;
    config.display();

    let total_epochs = config.training.feature_extraction_epochs + config.training.fine_tune_epochs;
    let progress = |record: &EpochRecord| {
        println!(
            "[{}/{}] {} val_acc={:.4}",
            record.epoch, total_epochs, record.phase, record.val_accuracy
        );
    };

    let device_type = effective_device_type(&config.device_type);
    info!("計算デバイス: {}", device_type);
    let summary = match device_type {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => run_training::<GpuTrainingBackend>(&config, &gpu_device(), progress)?,
        _ => run_training::<CpuTrainingBackend>(&config, &cpu_device(), progress)?,
    };

    println!("\n=== 学習完了 ===");
    println!("モデル: {}", summary.model_path.display());
    println!("実行エポック数: {}", summary.history.len());
    if let Some(best) = summary.history.best_val_accuracy() {
        println!("最良検証精度: {:.4}", best);
    }
    println!("学習履歴: {}, {}", summary.history_csv.display(), summary.history_svg.display());

    if let Some(report) = summary.test_report {
        println!("\n{}", report);
    }

    Ok(())
}
