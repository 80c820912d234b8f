//! モデルメタデータの定義
//!
//! 成果物（tar.gz）には重みと一緒にラベル順・入力サイズ・分類器構成を保存し、
//! 推論側はこのメタデータだけでモデルを再構築します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::MangoError;
use crate::ml::ml_model::MangoClassifierConfig;
use crate::model::labels::LabelSet;

/// 成果物フォーマットのバージョン
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,

    /// 出力インデックス順のクラス名
    pub labels: LabelSet,

    /// モデル入力の一辺（ピクセル）
    pub image_size: usize,

    /// 分類器の構成（幅倍率・ヘッドのユニット数など）
    pub classifier: MangoClassifierConfig,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,

    /// 実行したエポック数（両フェーズ合計）
    pub epochs_run: usize,

    #[serde(default)]
    pub best_val_accuracy: Option<f64>,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        labels: LabelSet,
        image_size: usize,
        classifier: MangoClassifierConfig,
        epochs_run: usize,
        best_val_accuracy: Option<f64>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            format_version: MODEL_FORMAT_VERSION,
            labels,
            image_size,
            classifier,
            trained_at,
            epochs_run,
            best_val_accuracy,
        }
    }

    /// 読み込んだメタデータの整合性を確認
    pub fn validate(&self) -> Result<(), MangoError> {
        if self.format_version != MODEL_FORMAT_VERSION {
            return Err(MangoError::model(format!(
                "unsupported model format version {} (expected {})",
                self.format_version, MODEL_FORMAT_VERSION
            )));
        }
        if self.image_size == 0 {
            return Err(MangoError::model("image_size must be positive"));
        }
        if self.classifier.num_classes != self.labels.len() {
            return Err(MangoError::model(format!(
                "classifier has {} outputs but {} labels are stored",
                self.classifier.num_classes,
                self.labels.len()
            )));
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
