//! 保存済みモデルの評価
//!
//! test 分割全体を評価して混同行列SVGを出力します。
//! `--image` 指定時は1枚だけ推論して上位3件を表示します。
#![recursion_limit = "256"]

use std::path::PathBuf;

use clap::Parser;

use mango_leaf_lib::backend::{cpu_device, effective_device_type, CpuBackend};
#[cfg(feature = "wgpu")]
use mango_leaf_lib::backend::{gpu_device, GpuBackend};
use mango_leaf_lib::logging::{init_logging, LogLevel};
use mango_leaf_lib::ml_commands::{predict_image, run_evaluation};
use mango_leaf_lib::model::{load_metadata, print_metadata_info, AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "evaluate")]
#[command(version)]
#[command(about = "Evaluate a trained mango leaf classifier")]
struct Cli {
    /// 設定ファイル
    #[arg(long, env = "MANGO_CONFIG")]
    config: Option<PathBuf>,

    /// モデル成果物（tar.gz）
    #[arg(long)]
    model: Option<PathBuf>,

    /// train/ val/ test/ を含むディレクトリ
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 単一画像のみ推論する
    #[arg(long)]
    image: Option<PathBuf>,

    /// 表示するランダムサンプル数
    #[arg(long, default_value_t = 8)]
    samples: usize,

    /// 混同行列SVGの出力先
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

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
    if let Some(model) = cli.model {
        config.model.model_path = model.to_string_lossy().into_owned();
    }
    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir.to_string_lossy().into_owned();
    }
    if cli.cpu {
        config.device_type = DeviceType::Cpu;
    }

    let model_path = PathBuf::from(&config.model.model_path);
    let metadata = load_metadata(&model_path)?;
    print_metadata_info(&metadata);

    let device_type = effective_device_type(&config.device_type);

    if let Some(image) = cli.image {
        let prediction = match device_type {
            #[cfg(feature = "wgpu")]
            DeviceType::Wgpu => predict_image::<GpuBackend>(&model_path, &image, &gpu_device())?,
            _ => predict_image::<CpuBackend>(&model_path, &image, &cpu_device())?,
        };

        println!("\n画像: {}", image.display());
        println!("予測: {}", prediction.label);
        println!("信頼度: {:.4} ({:.2}%)", prediction.confidence, prediction.confidence * 100.0);
        println!("\n上位3件:");
        for (rank, (label, p)) in prediction.top_k(3).into_iter().enumerate() {
            println!("  {}. {}: {:.4} ({:.2}%)", rank + 1, label, p, p * 100.0);
        }
        return Ok(());
    }

    let summary = match device_type {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => run_evaluation::<GpuBackend>(&config, &gpu_device(), &cli.output_dir, cli.samples)?,
        _ => run_evaluation::<CpuBackend>(&config, &cpu_device(), &cli.output_dir, cli.samples)?,
    };

    println!("\n{}", summary.report);

    if !summary.samples.is_empty() {
        println!("\nランダムサンプル ({}件):", summary.samples.len());
        for sample in &summary.samples {
            println!("  {}", sample);
        }
        let correct = summary.samples.iter().filter(|s| s.correct).count();
        println!(
            "サンプル正解率: {}/{} ({:.1}%)",
            correct,
            summary.samples.len(),
            correct as f64 / summary.samples.len() as f64 * 100.0
        );
    }
    println!("\n混同行列: {}", summary.confusion_matrix_svg.display());

    Ok(())
}
