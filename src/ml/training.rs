//! 2段階転移学習
//!
//! 1. 特徴抽出: バックボーン全体を凍結し、分類ヘッドのみ学習
//! 2. ファインチューニング: `fine_tune_at` 以降の層を解凍し、小さい学習率で継続
//!
//! 各フェーズは (現在の重み, データ, ハイパーパラメータ) から (新しい重み, 履歴) を返す関数です。
//! エポック番号はフェーズをまたいで連番になります。

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoader,
    module::{AutodiffModule, Module},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use burn_dataset::Dataset;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::MangoError;
use crate::ml::augmentation::Augmenter;
use crate::ml::backbone::MobileNetV2Config;
use crate::ml::dataset::{eval_loader, train_loader, BatchOutcome, LeafDataset};
use crate::ml::ml_model::{FrozenStages, MangoClassifier, MangoClassifierConfig};
use crate::ml::schedule::{EarlyStopping, PlateauMode, ReduceLrOnPlateau, StoppingDecision};
use crate::model::config::{AppConfig, TrainingSettings};
use crate::model::labels::LabelSet;
use crate::model::{save_model_with_metadata, ModelMetadata};

/// 学習フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    FeatureExtraction,
    FineTuning,
    Done,
}

impl TrainingPhase {
    pub fn next(self) -> Self {
        match self {
            TrainingPhase::FeatureExtraction => TrainingPhase::FineTuning,
            TrainingPhase::FineTuning | TrainingPhase::Done => TrainingPhase::Done,
        }
    }
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingPhase::FeatureExtraction => write!(f, "特徴抽出"),
            TrainingPhase::FineTuning => write!(f, "ファインチューニング"),
            TrainingPhase::Done => write!(f, "完了"),
        }
    }
}

/// 1フェーズ分のハイパーパラメータ
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    pub phase: TrainingPhase,
    pub epochs: usize,
    pub learning_rate: f64,
    /// 凍結するバックボーンのステージ数（先頭から）
    pub frozen_stages: usize,
    pub early_stopping_patience: usize,
    pub plateau_patience: usize,
    pub plateau_factor: f64,
    pub plateau_min_delta: f64,
    pub min_learning_rate: f64,
}

impl PhasePlan {
    /// フェーズに応じた計画（Done なら None）
    pub fn for_phase(
        phase: TrainingPhase,
        settings: &TrainingSettings,
        backbone: &MobileNetV2Config,
    ) -> Option<Self> {
        let (epochs, learning_rate, frozen_stages) = match phase {
            TrainingPhase::FeatureExtraction => (
                settings.feature_extraction_epochs,
                settings.feature_extraction_lr,
                backbone.stage_layer_spans().len(),
            ),
            TrainingPhase::FineTuning => (
                settings.fine_tune_epochs,
                settings.fine_tune_lr,
                backbone.frozen_stage_count(settings.fine_tune_at),
            ),
            TrainingPhase::Done => return None,
        };

        Some(Self {
            phase,
            epochs,
            learning_rate,
            frozen_stages,
            early_stopping_patience: settings.early_stopping_patience,
            plateau_patience: settings.plateau_patience,
            plateau_factor: settings.plateau_factor,
            plateau_min_delta: settings.plateau_min_delta,
            min_learning_rate: settings.min_learning_rate,
        })
    }
}

/// 1エポック分の記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1始まり、フェーズをまたいで連番
    pub epoch: usize,
    pub phase: TrainingPhase,
    pub loss: f64,
    pub accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
    /// 読み込み失敗でスキップしたバッチ数（学習 + 検証）
    pub skipped_batches: usize,
}

/// 両フェーズを連結した学習履歴
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn extend(&mut self, records: Vec<EpochRecord>) {
        self.epochs.extend(records);
    }

    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.epochs
            .iter()
            .map(|r| r.val_accuracy)
            .fold(None, |best, v| Some(best.map_or(v, |b: f64| b.max(v))))
    }

    /// ファインチューニング最初のエポック番号
    pub fn fine_tune_start(&self) -> Option<usize> {
        self.epochs
            .iter()
            .find(|r| r.phase == TrainingPhase::FineTuning)
            .map(|r| r.epoch)
    }

    /// CSVとして保存
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create history CSV: {}", path.display()))?;
        for record in &self.epochs {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// CSVから読み込む
    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open history CSV: {}", path.display()))?;
        let epochs = reader
            .deserialize()
            .collect::<std::result::Result<Vec<EpochRecord>, _>>()?;
        Ok(Self { epochs })
    }
}

/// フェーズの結果
pub struct PhaseOutcome<B: AutodiffBackend> {
    pub model: MangoClassifier<B>,
    pub history: Vec<EpochRecord>,
    pub stopped_early: bool,
}

/// 損失・正解数の集計
#[derive(Debug, Default, Clone, Copy)]
struct RunningStats {
    loss_sum: f64,
    correct: usize,
    samples: usize,
    skipped: usize,
}

impl RunningStats {
    fn add(&mut self, loss: f64, correct: usize, samples: usize) {
        self.loss_sum += loss * samples as f64;
        self.correct += correct;
        self.samples += samples;
    }

    fn loss(&self) -> f64 {
        if self.samples == 0 {
            f64::NAN
        } else {
            self.loss_sum / self.samples as f64
        }
    }

    fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.correct as f64 / self.samples as f64
        }
    }
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let correct: i64 = logits
        .argmax(1)
        .squeeze_dim::<1>(1)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct.max(0) as usize
}

/// 検証データで損失と精度を計算（推論モード）
fn validate<B: Backend>(
    model: &MangoClassifier<B>,
    loader: &Arc<dyn DataLoader<B, BatchOutcome<B>>>,
) -> RunningStats {
    let mut stats = RunningStats::default();

    for outcome in loader.iter() {
        let batch = match outcome {
            Ok(batch) => batch,
            Err(failure) => {
                warn!("検証バッチをスキップ: {}", failure);
                stats.skipped += 1;
                continue;
            }
        };
        let samples = batch.labels.len();
        let logits = model.forward(batch.images);
        let loss: f64 = model
            .loss(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();
        stats.add(loss, count_correct(logits, batch.targets), samples);
    }

    stats
}

/// 1フェーズを実行
///
/// 早期終了が発火した場合は最良エポックの重みに戻して返します。
pub fn run_phase<B: AutodiffBackend>(
    mut model: MangoClassifier<B>,
    plan: &PhasePlan,
    start_epoch: usize,
    train: &Arc<dyn DataLoader<B, BatchOutcome<B>>>,
    valid: &Arc<dyn DataLoader<B::InnerBackend, BatchOutcome<B::InnerBackend>>>,
    progress: &mut dyn FnMut(&EpochRecord),
) -> PhaseOutcome<B> {
    // オプティマイザ状態はフェーズごとに初期化
    let mut optimizer = AdamConfig::new().with_epsilon(1e-7).init();
    let frozen = FrozenStages::new(&model, plan.frozen_stages);

    let mut stopper = EarlyStopping::new(plan.early_stopping_patience, PlateauMode::Max);
    let mut plateau = ReduceLrOnPlateau::new(
        plan.learning_rate,
        plan.plateau_factor,
        plan.plateau_patience,
        plan.min_learning_rate,
        PlateauMode::Min,
    )
    .with_min_delta(plan.plateau_min_delta);

    // BatchNorm の移動統計は clone で共有されるため、最良エポックはレコードとして退避する
    let mut best_record = None;
    let mut history = Vec::with_capacity(plan.epochs);
    let mut stopped_early = false;

    info!(
        "=== {} フェーズ開始: {} エポック, 学習率 {}, 凍結ステージ {} ===",
        plan.phase, plan.epochs, plan.learning_rate, frozen.stages()
    );

    for offset in 0..plan.epochs {
        let epoch = start_epoch + offset;
        let lr = plateau.current_lr();
        let mut stats = RunningStats::default();

        for outcome in train.iter() {
            let batch = match outcome {
                Ok(batch) => batch,
                Err(failure) => {
                    warn!("学習バッチをスキップ: {}", failure);
                    stats.skipped += 1;
                    continue;
                }
            };
            let samples = batch.labels.len();

            let features = frozen.forward(batch.images);
            let logits = model.forward_from_stage(features, frozen.stages());
            let loss = model.loss(logits.clone(), batch.targets.clone());

            let loss_value: f64 = loss.clone().into_scalar().elem();
            stats.add(loss_value, count_correct(logits, batch.targets), samples);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(lr, model, grads);
        }

        if stats.samples == 0 {
            warn!("エポック {}: 学習できたバッチがありません", epoch);
        }

        let val = validate(&model.valid(), valid);
        let record = EpochRecord {
            epoch,
            phase: plan.phase,
            loss: stats.loss(),
            accuracy: stats.accuracy(),
            val_loss: val.loss(),
            val_accuracy: val.accuracy(),
            learning_rate: lr,
            skipped_batches: stats.skipped + val.skipped,
        };
        info!(
            "エポック {} [{}] loss={:.4} acc={:.4} val_loss={:.4} val_acc={:.4} lr={:e}",
            record.epoch,
            record.phase,
            record.loss,
            record.accuracy,
            record.val_loss,
            record.val_accuracy,
            record.learning_rate
        );

        let decision = stopper.step(epoch, record.val_accuracy);
        if decision == StoppingDecision::Improved {
            best_record = Some(model.clone().into_record());
        }

        let next_lr = plateau.step(record.val_loss);
        if next_lr < lr {
            info!("ReduceLROnPlateau: 学習率を {:e} に減衰しました", next_lr);
        }

        progress(&record);
        history.push(record);

        if decision == StoppingDecision::Stop {
            stopped_early = true;
            info!("早期終了: val_accuracy が {} エポック改善しませんでした", plan.early_stopping_patience);
            if let (Some(best), Some(best_epoch)) = (best_record.take(), stopper.best_epoch()) {
                model = model.load_record(best);
                info!("エポック {} の重みを復元しました (val_accuracy={:.4})", best_epoch, stopper.best());
            }
            break;
        }
    }

    PhaseOutcome {
        model,
        history,
        stopped_early,
    }
}

/// 学習結果
pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: MangoClassifier<B>,
    pub model_config: MangoClassifierConfig,
    pub labels: LabelSet,
    pub history: TrainingHistory,
}

/// 2段階の学習を実行
///
/// データディレクトリの不備（ルート・分割・クラスディレクトリの欠落、学習・検証データ0枚）は
/// 学習開始前に設定エラーとして返します。
pub fn train_model<B: AutodiffBackend>(
    config: &AppConfig,
    device: &B::Device,
    mut progress_callback: impl FnMut(&EpochRecord),
) -> Result<TrainingOutcome<B>> {
    config.validate()?;

    let data_dir = Path::new(&config.data.data_dir);
    if !data_dir.is_dir() {
        return Err(MangoError::config(format!("data root not found: {}", data_dir.display())).into());
    }

    let labels = config.labels.clone();
    info!("クラス ({}個): {}", labels.len(), labels.names().join(", "));

    let train_set = LeafDataset::from_split_dir(&config.data.split_dir("train"), &labels)?;
    let val_set = LeafDataset::from_split_dir(&config.data.split_dir("val"), &labels)?;
    train_set.log_counts("学習データ");
    val_set.log_counts("検証データ");

    if train_set.is_empty() {
        return Err(MangoError::config("training split contains no images").into());
    }
    if val_set.is_empty() {
        return Err(MangoError::config("validation split contains no images").into());
    }

    let model_config = MangoClassifierConfig::from_settings(&config.model, labels.len());
    let pretrained = config.model.pretrained_backbone_path.as_deref().map(Path::new);
    let mut model = model_config.init_pretrained::<B>(pretrained, device)?;

    let augmenter = config
        .augmentation
        .enabled
        .then(|| Arc::new(Augmenter::new(config.augmentation.clone(), config.data.seed)));

    let image_size = config.data.image_size;
    let batch_size = config.data.batch_size;
    let train = train_loader::<B>(
        train_set,
        image_size,
        batch_size,
        config.data.num_workers,
        config.data.seed,
        augmenter,
        device,
    );
    let valid = eval_loader::<B::InnerBackend>(val_set, image_size, batch_size, device);

    let mut history = TrainingHistory::default();
    let mut phase = TrainingPhase::FeatureExtraction;
    let mut next_epoch = 1;

    while let Some(plan) = PhasePlan::for_phase(phase, &config.training, &model_config.backbone) {
        info!("\n{}", model.summary(&model_config, plan.frozen_stages));

        let outcome = run_phase(model, &plan, next_epoch, &train, &valid, &mut progress_callback);
        if outcome.stopped_early {
            info!("{} フェーズは早期終了しました", plan.phase);
        }

        model = outcome.model;
        next_epoch += outcome.history.len();
        history.extend(outcome.history);
        phase = phase.next();
    }

    if let Some(best) = history.best_val_accuracy() {
        info!("学習完了: {} エポック, 最良 val_accuracy={:.4}", history.len(), best);
    }

    Ok(TrainingOutcome {
        model,
        model_config,
        labels,
        history,
    })
}

/// 学習済みモデルを成果物（tar.gz）として保存
pub fn save_trained_model<B: Backend>(
    output_path: &Path,
    model: &MangoClassifier<B>,
    model_config: &MangoClassifierConfig,
    labels: &LabelSet,
    image_size: usize,
    history: &TrainingHistory,
) -> Result<()> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let model_binary = recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))?;

    let metadata = ModelMetadata::new(
        labels.clone(),
        image_size,
        model_config.clone(),
        history.len(),
        history.best_val_accuracy(),
    );

    save_model_with_metadata(output_path, &metadata, &model_binary)?;
    info!(
        "モデルを保存しました: {} ({:.2} MB)",
        output_path.display(),
        model_binary.len() as f64 / 1024.0 / 1024.0
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::{NdArray, NdArrayDevice};

    use crate::ml::dataset::LeafItem;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    const SIZE: usize = 32;

    /// 2クラス（赤・緑）の学習4枚と検証1枚のローダー
    fn tiny_loaders(
        dir: &Path,
    ) -> (
        Arc<dyn DataLoader<TestAutodiffBackend, BatchOutcome<TestAutodiffBackend>>>,
        Arc<dyn DataLoader<TestBackend, BatchOutcome<TestBackend>>>,
    ) {
        let labels = LabelSet::new(vec!["red".to_string(), "green".to_string()]).unwrap();
        let colors = [[200u8, 30, 30], [30, 200, 30]];
        let mut items = Vec::new();
        for i in 0..4 {
            let path = dir.join(format!("train_{}.png", i));
            image::RgbImage::from_pixel(40, 40, image::Rgb(colors[i % 2])).save(&path).unwrap();
            items.push(LeafItem { path, label: i % 2 });
        }
        let val_path = dir.join("val.png");
        image::RgbImage::from_pixel(40, 40, image::Rgb(colors[1])).save(&val_path).unwrap();

        let device = NdArrayDevice::Cpu;
        let train = train_loader::<TestAutodiffBackend>(
            LeafDataset::from_items(items, &labels),
            SIZE,
            2,
            1,
            7,
            None,
            &device,
        );
        let valid = eval_loader::<TestBackend>(
            LeafDataset::from_items(vec![LeafItem { path: val_path, label: 1 }], &labels),
            SIZE,
            1,
            &device,
        );
        (train, valid)
    }

    fn tiny_model() -> (MangoClassifier<TestAutodiffBackend>, MangoClassifierConfig) {
        let config = MangoClassifierConfig::new(2, MobileNetV2Config::new().with_width_multiplier(0.25))
            .with_hidden_units(8);
        (config.init::<TestAutodiffBackend>(&NdArrayDevice::Cpu), config)
    }

    fn plan(config: &MangoClassifierConfig, epochs: usize) -> PhasePlan {
        PhasePlan {
            phase: TrainingPhase::FeatureExtraction,
            epochs,
            learning_rate: 1e-2,
            frozen_stages: config.backbone.stage_layer_spans().len(),
            early_stopping_patience: 100,
            plateau_patience: 100,
            plateau_factor: 0.5,
            plateau_min_delta: 0.0,
            min_learning_rate: 1e-7,
        }
    }

    fn record(epoch: usize, phase: TrainingPhase, val_accuracy: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            phase,
            loss: 1.0,
            accuracy: 0.5,
            val_loss: 1.1,
            val_accuracy,
            learning_rate: 1e-3,
            skipped_batches: 0,
        }
    }

    #[test]
    fn test_early_stop_restores_best_epoch_weights() {
        let dir = tempfile::tempdir().unwrap();
        let (train, valid) = tiny_loaders(dir.path());
        let (model, config) = tiny_model();
        let mut plan = plan(&config, 5);
        plan.early_stopping_patience = 1;

        // 検証1枚なので val_accuracy は 0 か 1、遅くとも3エポック目で停止する
        let outcome = run_phase(model, &plan, 1, &train, &valid, &mut |_| {});
        assert!(outcome.stopped_early);
        assert!(outcome.history.len() <= 3);

        let best_acc = outcome
            .history
            .iter()
            .map(|r| r.val_accuracy)
            .fold(f64::NEG_INFINITY, f64::max);
        let best = outcome
            .history
            .iter()
            .find(|r| r.val_accuracy == best_acc)
            .unwrap();
        assert!(best.epoch < outcome.history.last().unwrap().epoch);

        let revalidated = validate(&outcome.model.valid(), &valid);
        assert_eq!(revalidated.accuracy(), best.val_accuracy);
        assert!((revalidated.loss() - best.val_loss).abs() < 1e-6);
    }

    #[test]
    fn test_plateau_lowers_learning_rate_of_next_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let (train, valid) = tiny_loaders(dir.path());
        let (model, config) = tiny_model();
        let mut plan = plan(&config, 3);
        plan.plateau_patience = 1;
        // 初回以外は改善とみなさない
        plan.plateau_min_delta = 1e9;

        let mut seen = Vec::new();
        let outcome = run_phase(model, &plan, 4, &train, &valid, &mut |r| seen.push(r.epoch));
        assert!(!outcome.stopped_early);
        assert_eq!(seen, vec![4, 5, 6]);

        let rates: Vec<f64> = outcome.history.iter().map(|r| r.learning_rate).collect();
        assert_eq!(rates, vec![1e-2, 1e-2, 5e-3]);
    }

    #[test]
    fn test_phase_transitions() {
        assert_eq!(TrainingPhase::FeatureExtraction.next(), TrainingPhase::FineTuning);
        assert_eq!(TrainingPhase::FineTuning.next(), TrainingPhase::Done);
        assert_eq!(TrainingPhase::Done.next(), TrainingPhase::Done);
    }

    #[test]
    fn test_phase_plans_follow_settings() {
        let settings = TrainingSettings::default();
        let backbone = MobileNetV2Config::new();

        let p1 = PhasePlan::for_phase(TrainingPhase::FeatureExtraction, &settings, &backbone).unwrap();
        assert_eq!(p1.epochs, 15);
        assert_eq!(p1.learning_rate, 1e-3);
        assert_eq!(p1.frozen_stages, 19);

        let p2 = PhasePlan::for_phase(TrainingPhase::FineTuning, &settings, &backbone).unwrap();
        assert_eq!(p2.epochs, 10);
        assert_eq!(p2.learning_rate, 1e-5);
        assert_eq!(p2.frozen_stages, 13);
        assert_eq!(p2.min_learning_rate, 1e-7);

        assert!(PhasePlan::for_phase(TrainingPhase::Done, &settings, &backbone).is_none());
    }

    #[test]
    fn test_history_merge_and_best() {
        let mut history = TrainingHistory::default();
        history.extend(vec![
            record(1, TrainingPhase::FeatureExtraction, 0.4),
            record(2, TrainingPhase::FeatureExtraction, 0.6),
        ]);
        history.extend(vec![record(3, TrainingPhase::FineTuning, 0.55)]);

        assert_eq!(history.len(), 3);
        assert_eq!(history.fine_tune_start(), Some(3));
        assert_eq!(history.best_val_accuracy(), Some(0.6));
        let epochs: Vec<_> = history.epochs.iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 3]);
    }

    #[test]
    fn test_history_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let mut history = TrainingHistory::default();
        history.extend(vec![
            record(1, TrainingPhase::FeatureExtraction, 0.25),
            record(2, TrainingPhase::FineTuning, 0.5),
        ]);
        history.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("epoch,phase,loss,accuracy,val_loss,val_accuracy,learning_rate"));
        assert!(text.contains("fine_tuning"));

        let loaded = TrainingHistory::read_csv(&path).unwrap();
        assert_eq!(loaded, history);
    }

    #[test]
    fn test_running_stats_weighting() {
        let mut stats = RunningStats::default();
        stats.add(1.0, 1, 1);
        stats.add(0.0, 3, 3);
        assert!((stats.loss() - 0.25).abs() < 1e-12);
        assert!((stats.accuracy() - 1.0).abs() < 1e-12);
        assert!(RunningStats::default().loss().is_nan());
    }
}
