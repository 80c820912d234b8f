//! 評価指標
//!
//! 混同行列・クラス別精度・適合率/再現率/F1を
//! (正解ラベル, 予測ラベル) の列から計算します。

use std::fmt;

use serde::Serialize;

use crate::error::MangoError;
use crate::model::labels::LabelSet;

/// 混同行列（行 = 正解、列 = 予測）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    labels: Vec<String>,
    counts: Vec<Vec<usize>>,
}

/// 誤分類の組
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confusion {
    pub actual: String,
    pub predicted: String,
    pub count: usize,
}

impl ConfusionMatrix {
    pub fn from_predictions(
        labels: &LabelSet,
        y_true: &[usize],
        y_pred: &[usize],
    ) -> Result<Self, MangoError> {
        if y_true.len() != y_pred.len() {
            return Err(MangoError::model(format!(
                "{} ground-truth labels but {} predictions",
                y_true.len(),
                y_pred.len()
            )));
        }

        let n = labels.len();
        let mut counts = vec![vec![0usize; n]; n];
        for (&t, &p) in y_true.iter().zip(y_pred) {
            if t >= n || p >= n {
                return Err(MangoError::model(format!(
                    "label index out of range: true={}, predicted={}, classes={}",
                    t, p, n
                )));
            }
            counts[t][p] += 1;
        }

        Ok(Self {
            labels: labels.names().to_vec(),
            counts,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts[actual][predicted]
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }

    /// 正解がクラス i のサンプル数
    pub fn row_total(&self, actual: usize) -> usize {
        self.counts[actual].iter().sum()
    }

    /// クラス j と予測されたサンプル数
    pub fn column_total(&self, predicted: usize) -> usize {
        self.counts.iter().map(|row| row[predicted]).sum()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|row| row.iter().sum::<usize>()).sum()
    }

    /// 対角成分の合計（正解数）
    pub fn trace(&self) -> usize {
        (0..self.num_classes()).map(|i| self.counts[i][i]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.trace(), self.total())
    }

    /// クラス別精度（正解が0件のクラスは除外）
    pub fn per_class_accuracy(&self) -> Vec<(String, f64)> {
        (0..self.num_classes())
            .filter(|&i| self.row_total(i) > 0)
            .map(|i| (self.labels[i].clone(), ratio(self.counts[i][i], self.row_total(i))))
            .collect()
    }

    /// 非対角成分の上位n件（件数の降順、同数はクラス名の降順）
    pub fn top_confusions(&self, n: usize) -> Vec<Confusion> {
        let mut confusions: Vec<Confusion> = Vec::new();
        for (i, row) in self.counts.iter().enumerate() {
            for (j, &count) in row.iter().enumerate() {
                if i != j && count > 0 {
                    confusions.push(Confusion {
                        actual: self.labels[i].clone(),
                        predicted: self.labels[j].clone(),
                        count,
                    });
                }
            }
        }

        confusions.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.actual.cmp(&a.actual))
                .then_with(|| b.predicted.cmp(&a.predicted))
        });
        confusions.truncate(n);
        confusions
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// クラスごとの適合率・再現率・F1
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AveragedMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// クラス別の適合率・再現率・F1 とその平均
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub macro_avg: AveragedMetrics,
    pub weighted_avg: AveragedMetrics,
}

impl ClassificationReport {
    /// 0除算は0として扱う。平均は正解か予測に1回以上現れたクラスが対象
    pub fn from_confusion(cm: &ConfusionMatrix) -> Self {
        let classes: Vec<ClassMetrics> = (0..cm.num_classes())
            .map(|i| {
                let tp = cm.get(i, i);
                let precision = ratio(tp, cm.column_total(i));
                let recall = ratio(tp, cm.row_total(i));
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };
                ClassMetrics {
                    label: cm.labels()[i].clone(),
                    precision,
                    recall,
                    f1,
                    support: cm.row_total(i),
                }
            })
            .collect();

        let present: Vec<&ClassMetrics> = classes
            .iter()
            .enumerate()
            .filter(|(i, c)| c.support > 0 || cm.column_total(*i) > 0)
            .map(|(_, c)| c)
            .collect();
        let total = cm.total();

        let mean = |f: fn(&ClassMetrics) -> f64| {
            if present.is_empty() {
                0.0
            } else {
                present.iter().map(|c| f(c)).sum::<f64>() / present.len() as f64
            }
        };
        let weighted = |f: fn(&ClassMetrics) -> f64| {
            if total == 0 {
                0.0
            } else {
                classes.iter().map(|c| f(c) * c.support as f64).sum::<f64>() / total as f64
            }
        };

        let macro_avg = AveragedMetrics {
            precision: mean(|c| c.precision),
            recall: mean(|c| c.recall),
            f1: mean(|c| c.f1),
            support: total,
        };
        let weighted_avg = AveragedMetrics {
            precision: weighted(|c| c.precision),
            recall: weighted(|c| c.recall),
            f1: weighted(|c| c.f1),
            support: total,
        };

        Self {
            accuracy: cm.accuracy(),
            classes,
            macro_avg,
            weighted_avg,
        }
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.label.len())
            .chain(["weighted avg".len()])
            .max()
            .unwrap_or(12);

        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support",
            width = width
        )?;
        writeln!(f)?;
        for c in &self.classes {
            writeln!(
                f,
                "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                c.label, c.precision, c.recall, c.f1, c.support,
                width = width
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$} {:>9} {:>9} {:>9.4} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support,
            width = width
        )?;
        for (name, avg) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>width$} {:>9.4} {:>9.4} {:>9.4} {:>9}",
                name, avg.precision, avg.recall, avg.f1, avg.support,
                width = width
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels3() -> LabelSet {
        LabelSet::new(vec!["a".into(), "b".into(), "c".into()]).unwrap()
    }

    #[test]
    fn test_row_sums_and_trace() {
        let y_true = [0, 0, 0, 1, 1, 2, 2, 2, 2];
        let y_pred = [0, 1, 0, 1, 1, 2, 0, 2, 1];
        let cm = ConfusionMatrix::from_predictions(&labels3(), &y_true, &y_pred).unwrap();

        assert_eq!(cm.row_total(0), 3);
        assert_eq!(cm.row_total(1), 2);
        assert_eq!(cm.row_total(2), 4);
        assert_eq!(cm.total(), 9);
        assert_eq!(cm.trace(), 6);

        let direct = y_true.iter().zip(&y_pred).filter(|(t, p)| t == p).count() as f64 / 9.0;
        assert!((cm.accuracy() - direct).abs() < 1e-12);
    }

    #[test]
    fn test_per_class_accuracy_skips_empty_classes() {
        let cm = ConfusionMatrix::from_predictions(&labels3(), &[0, 0, 2], &[0, 1, 2]).unwrap();
        let per_class = cm.per_class_accuracy();
        assert_eq!(per_class.len(), 2);
        assert_eq!(per_class[0], ("a".to_string(), 0.5));
        assert_eq!(per_class[1], ("c".to_string(), 1.0));
    }

    #[test]
    fn test_top_confusions_ordering() {
        let y_true = [0, 0, 1, 1, 2, 2, 2];
        let y_pred = [1, 1, 0, 2, 0, 0, 1];
        let cm = ConfusionMatrix::from_predictions(&labels3(), &y_true, &y_pred).unwrap();
        let top = cm.top_confusions(5);

        assert_eq!(top[0].count, 2);
        // 同数 (c→a, a→b) はクラス名の降順
        assert_eq!((top[0].actual.as_str(), top[0].predicted.as_str()), ("c", "a"));
        assert_eq!((top[1].actual.as_str(), top[1].predicted.as_str()), ("a", "b"));
        assert!(top.iter().all(|c| c.actual != c.predicted));
        assert_eq!(top.iter().map(|c| c.count).sum::<usize>(), 7 - cm.trace());
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        assert!(ConfusionMatrix::from_predictions(&labels3(), &[0], &[3]).is_err());
        assert!(ConfusionMatrix::from_predictions(&labels3(), &[0, 1], &[0]).is_err());
    }

    #[test]
    fn test_report_weighted_recall_equals_accuracy() {
        let y_true = [0, 0, 0, 1, 1, 2, 2, 2, 2];
        let y_pred = [0, 1, 0, 1, 1, 2, 0, 2, 1];
        let cm = ConfusionMatrix::from_predictions(&labels3(), &y_true, &y_pred).unwrap();
        let report = ClassificationReport::from_confusion(&cm);

        assert!((report.weighted_avg.recall - report.accuracy).abs() < 1e-12);
        assert_eq!(report.macro_avg.support, 9);
        // b: tp=2, 予測4件（index 1, 3, 4, 8）
        assert!((report.classes[1].precision - 0.5).abs() < 1e-12);
        assert!((report.classes[1].recall - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_report_zero_division() {
        let cm = ConfusionMatrix::from_predictions(&labels3(), &[0, 0], &[0, 0]).unwrap();
        let report = ClassificationReport::from_confusion(&cm);
        assert_eq!(report.classes[1].precision, 0.0);
        assert_eq!(report.classes[1].f1, 0.0);
        assert_eq!(report.macro_avg.f1, 1.0);

        let text = report.to_string();
        assert!(text.contains("precision"));
        assert!(text.contains("1.0000"));
        assert!(text.contains("weighted avg"));
    }
}
