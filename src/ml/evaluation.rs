//! テストデータでの評価
//!
//! シャッフルなしのローダーで1回だけ走査し、(正解, 予測, 確率, パス) を記録します。
//! 順序が固定なので予測をファイル名に対応付けられます。

use std::fmt;
use std::path::PathBuf;

use burn::tensor::backend::Backend;
use burn_dataset::Dataset;
use rand::{rngs::StdRng, SeedableRng};
use tracing::{info, warn};

use crate::error::MangoError;
use crate::metrics::{ClassificationReport, Confusion, ConfusionMatrix};
use crate::ml::dataset::{eval_loader, LeafDataset};
use crate::ml::inference::argmax;
use crate::ml::ml_model::MangoClassifier;
use crate::model::labels::LabelSet;

/// 精度の評価メッセージ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccuracyGrade {
    Excellent,
    VeryGood,
    Good,
    NeedsImprovement,
}

impl AccuracyGrade {
    pub fn from_accuracy(accuracy: f64) -> Self {
        if accuracy >= 0.90 {
            AccuracyGrade::Excellent
        } else if accuracy >= 0.80 {
            AccuracyGrade::VeryGood
        } else if accuracy >= 0.70 {
            AccuracyGrade::Good
        } else {
            AccuracyGrade::NeedsImprovement
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            AccuracyGrade::Excellent => "EXCELLENT! 非常に高精度なモデルです",
            AccuracyGrade::VeryGood => "VERY GOOD! 実用に十分な精度です",
            AccuracyGrade::Good => "GOOD: 改善の余地があります",
            AccuracyGrade::NeedsImprovement => "NEEDS IMPROVEMENT: 信頼性が不十分です",
        }
    }
}

/// 1回の評価走査の生データ
#[derive(Debug, Clone)]
pub struct EvaluationRun {
    pub labels: LabelSet,
    pub paths: Vec<PathBuf>,
    pub y_true: Vec<usize>,
    pub y_pred: Vec<usize>,
    /// サンプルごとのSoftmax出力（ラベル順）
    pub probabilities: Vec<Vec<f32>>,
    pub skipped_batches: usize,
}

/// ランダムに抜き出した予測例
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePrediction {
    pub path: PathBuf,
    pub actual: String,
    pub predicted: String,
    pub confidence: f32,
    pub correct: bool,
}

impl fmt::Display for SamplePrediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}  正解: {} / 予測: {} ({:.4})",
            if self.correct { "✓" } else { "✗" },
            self.path.display(),
            self.actual,
            self.predicted,
            self.confidence
        )
    }
}

impl EvaluationRun {
    pub fn len(&self) -> usize {
        self.y_true.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y_true.is_empty()
    }

    pub fn correct(&self) -> usize {
        self.y_true.iter().zip(&self.y_pred).filter(|(t, p)| t == p).count()
    }

    pub fn accuracy(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.correct() as f64 / self.len() as f64
        }
    }

    pub fn confusion_matrix(&self) -> Result<ConfusionMatrix, MangoError> {
        ConfusionMatrix::from_predictions(&self.labels, &self.y_true, &self.y_pred)
    }

    /// 集計レポート
    pub fn report(&self) -> Result<EvaluationReport, MangoError> {
        let confusion_matrix = self.confusion_matrix()?;
        let accuracy = confusion_matrix.accuracy();

        Ok(EvaluationReport {
            total: confusion_matrix.total(),
            correct: confusion_matrix.trace(),
            accuracy,
            grade: AccuracyGrade::from_accuracy(accuracy),
            per_class_accuracy: confusion_matrix.per_class_accuracy(),
            top_confusions: confusion_matrix.top_confusions(5),
            classification: ClassificationReport::from_confusion(&confusion_matrix),
            confusion_matrix,
            skipped_batches: self.skipped_batches,
        })
    }

    /// シード付き乱数でn件を非復元抽出
    pub fn sample_predictions(&self, n: usize, seed: u64) -> Vec<SamplePrediction> {
        let mut rng = StdRng::seed_from_u64(seed);
        let amount = n.min(self.len());

        rand::seq::index::sample(&mut rng, self.len(), amount)
            .into_iter()
            .map(|i| {
                let actual = self.labels.name(self.y_true[i]).unwrap_or_default().to_string();
                let predicted = self.labels.name(self.y_pred[i]).unwrap_or_default().to_string();
                SamplePrediction {
                    path: self.paths[i].clone(),
                    correct: self.y_true[i] == self.y_pred[i],
                    confidence: self.probabilities[i][self.y_pred[i]],
                    actual,
                    predicted,
                }
            })
            .collect()
    }
}

/// 評価結果のまとめ
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub total: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub grade: AccuracyGrade,
    pub per_class_accuracy: Vec<(String, f64)>,
    pub confusion_matrix: ConfusionMatrix,
    pub top_confusions: Vec<Confusion>,
    pub classification: ClassificationReport,
    pub skipped_batches: usize,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(50);

        writeln!(f, "{}", rule)?;
        writeln!(f, "テスト精度: {:.4} ({:.2}%)  [{}/{}]", self.accuracy, self.accuracy * 100.0, self.correct, self.total)?;
        writeln!(f, "{}", self.grade.message())?;
        if self.skipped_batches > 0 {
            writeln!(f, "読み込み失敗でスキップしたバッチ: {}", self.skipped_batches)?;
        }

        writeln!(f, "\n{}\nクラス別精度\n{}", rule, rule)?;
        for (label, acc) in &self.per_class_accuracy {
            writeln!(f, "{}: {:.4} ({:.2}%)", label, acc, acc * 100.0)?;
        }

        writeln!(f, "\n{}\n混同行列\n{}", rule, rule)?;
        let width = self
            .confusion_matrix
            .labels()
            .iter()
            .map(|l| l.len())
            .max()
            .unwrap_or(0);
        for (label, row) in self.confusion_matrix.labels().iter().zip(self.confusion_matrix.rows()) {
            let cells: Vec<String> = row.iter().map(|c| format!("{:>4}", c)).collect();
            writeln!(f, "{:>width$} |{}", label, cells.join(""), width = width)?;
        }

        writeln!(f, "\n誤分類の上位:")?;
        if self.top_confusions.is_empty() {
            writeln!(f, "  なし")?;
        }
        for c in &self.top_confusions {
            writeln!(f, "  {} -> {}: {} 件", c.actual, c.predicted, c.count)?;
        }

        writeln!(f, "\n{}\n分類レポート\n{}", rule, rule)?;
        write!(f, "{}", self.classification)
    }
}

/// データセット全体を評価
///
/// 読み込みに失敗したバッチは警告してスキップします。
pub fn evaluate_dataset<B: Backend>(
    model: &MangoClassifier<B>,
    dataset: LeafDataset,
    image_size: usize,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvaluationRun, MangoError> {
    let labels = dataset.labels().clone();
    let num_classes = labels.len();
    info!("[Evaluation] {} 枚を評価します", dataset.len());

    let loader = eval_loader::<B>(dataset, image_size, batch_size, device);

    let mut run = EvaluationRun {
        labels,
        paths: Vec::new(),
        y_true: Vec::new(),
        y_pred: Vec::new(),
        probabilities: Vec::new(),
        skipped_batches: 0,
    };

    for outcome in loader.iter() {
        let batch = match outcome {
            Ok(batch) => batch,
            Err(failure) => {
                warn!("[Evaluation] バッチをスキップ: {}", failure);
                run.skipped_batches += 1;
                continue;
            }
        };

        let probs = model
            .forward_softmax(batch.images)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| MangoError::model(format!("推論結果の取得エラー: {:?}", e)))?;

        for ((row, label), path) in probs.chunks(num_classes).zip(batch.labels).zip(batch.paths) {
            let (predicted, _) = argmax(row).ok_or_else(|| MangoError::model("empty model output"))?;
            run.y_true.push(label);
            run.y_pred.push(predicted);
            run.probabilities.push(row.to_vec());
            run.paths.push(path);
        }
    }

    info!(
        "[Evaluation] 完了: {} 枚, 精度 {:.4}",
        run.len(),
        run.accuracy()
    );
    Ok(run)
}
