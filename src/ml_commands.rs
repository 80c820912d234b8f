//! コマンド実装（学習・評価・単一画像推論・データ分割）
//!
//! 各バイナリはCLI引数を設定に反映してからここを呼びます。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::{
    module::AutodiffModule,
    tensor::backend::{AutodiffBackend, Backend},
};
use burn_dataset::Dataset;
use tracing::{info, warn};

use crate::error::MangoError;
use crate::ml::dataset::LeafDataset;
use crate::ml::evaluation::{evaluate_dataset, EvaluationReport, SamplePrediction};
use crate::ml::inference::{load_classifier, InferenceEngine, Prediction};
use crate::ml::training::{save_trained_model, train_model, EpochRecord, TrainingHistory};
use crate::model::config::AppConfig;
use crate::partition::{split_dataset, verify_split, PartitionConfig, PartitionReport};
use crate::report::{write_confusion_matrix_svg, write_history_svg};

pub const HISTORY_CSV: &str = "training_history.csv";
pub const HISTORY_SVG: &str = "training_history.svg";
pub const CONFUSION_MATRIX_SVG: &str = "confusion_matrix.svg";

/// 成果物と同じディレクトリ
fn output_dir_of(model_path: &Path) -> PathBuf {
    model_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 学習コマンドの結果
pub struct TrainingSummary {
    pub model_path: PathBuf,
    pub history: TrainingHistory,
    pub history_csv: PathBuf,
    pub history_svg: PathBuf,
    /// test 分割があれば評価結果
    pub test_report: Option<EvaluationReport>,
}

/// 学習 → 保存 → 履歴出力 → テスト評価
pub fn run_training<B: AutodiffBackend>(
    config: &AppConfig,
    device: &B::Device,
    progress_callback: impl FnMut(&EpochRecord),
) -> Result<TrainingSummary> {
    let outcome = train_model::<B>(config, device, progress_callback)?;
    let model = outcome.model.valid();

    let model_path = PathBuf::from(&config.model.model_path);
    save_trained_model(
        &model_path,
        &model,
        &outcome.model_config,
        &outcome.labels,
        config.data.image_size,
        &outcome.history,
    )?;

    let out_dir = output_dir_of(&model_path);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let history_csv = out_dir.join(HISTORY_CSV);
    let history_svg = out_dir.join(HISTORY_SVG);
    outcome.history.write_csv(&history_csv)?;
    write_history_svg(&outcome.history, &history_svg)?;
    info!("学習履歴を保存しました: {}, {}", history_csv.display(), history_svg.display());

    let test_dir = config.data.split_dir("test");
    let test_report = if test_dir.is_dir() {
        let test_set = LeafDataset::from_split_dir(&test_dir, &outcome.labels)?;
        if test_set.is_empty() {
            warn!("テストデータが0枚のため評価をスキップします");
            None
        } else {
            let run = evaluate_dataset::<B::InnerBackend>(
                &model,
                test_set,
                config.data.image_size,
                config.data.batch_size,
                device,
            )?;
            let report = run.report()?;
            write_confusion_matrix_svg(&report.confusion_matrix, &out_dir.join(CONFUSION_MATRIX_SVG))?;
            Some(report)
        }
    } else {
        warn!("テストディレクトリがありません: {}", test_dir.display());
        None
    };

    Ok(TrainingSummary {
        model_path,
        history: outcome.history,
        history_csv,
        history_svg,
        test_report,
    })
}

/// 評価コマンドの結果
pub struct EvaluationSummary {
    pub report: EvaluationReport,
    pub samples: Vec<SamplePrediction>,
    pub confusion_matrix_svg: PathBuf,
}

/// 保存済みモデルで test 分割を評価
///
/// 成果物のラベル順が設定と異なる場合は設定エラーです。
pub fn run_evaluation<B: Backend>(
    config: &AppConfig,
    device: &B::Device,
    output_dir: &Path,
    num_samples: usize,
) -> Result<EvaluationSummary> {
    let (model, metadata) = load_classifier::<B>(Path::new(&config.model.model_path), device)?;
    metadata.labels.ensure_same(&config.labels)?;

    let test_dir = config.data.split_dir("test");
    let test_set = LeafDataset::from_split_dir(&test_dir, &metadata.labels)?;
    test_set.log_counts("テストデータ");
    if test_set.is_empty() {
        return Err(MangoError::config(format!("no test images in {}", test_dir.display())).into());
    }

    let run = evaluate_dataset::<B>(
        &model,
        test_set,
        metadata.image_size,
        config.data.batch_size,
        device,
    )?;
    let report = run.report()?;
    let samples = run.sample_predictions(num_samples, config.data.seed);

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let confusion_matrix_svg = output_dir.join(CONFUSION_MATRIX_SVG);
    write_confusion_matrix_svg(&report.confusion_matrix, &confusion_matrix_svg)?;
    info!("混同行列を保存しました: {}", confusion_matrix_svg.display());

    Ok(EvaluationSummary {
        report,
        samples,
        confusion_matrix_svg,
    })
}

/// 単一画像の推論
pub fn predict_image<B: Backend>(
    model_path: &Path,
    image_path: &Path,
    device: &B::Device,
) -> Result<Prediction> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;
    let prediction = engine.predict_path(image_path)?;
    info!(
        "{}: {} ({:.2}%)",
        image_path.display(),
        prediction.label,
        prediction.confidence * 100.0
    );
    Ok(prediction)
}

/// データ分割と検証
pub fn run_split(source_dir: &Path, output_dir: &Path, config: &PartitionConfig) -> Result<PartitionReport> {
    let report = split_dataset(source_dir, output_dir, config)?;
    let verified = verify_split(output_dir)?;
    if verified != report {
        warn!("分割後の枚数が一致しません（出力先に既存ファイルがある可能性があります）");
    }
    Ok(verified)
}
