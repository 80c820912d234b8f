//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データ、拡張、モデル、学習、サーバーの設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::MangoError;
use crate::model::labels::LabelSet;

/// 計算デバイスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// train/ val/ test/ を含むディレクトリ
    pub data_dir: String,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// データローダーのワーカー数
    pub num_workers: usize,
    /// ランダムシード
    pub seed: u64,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            data_dir: "data/processed".to_string(),
            image_size: 224,
            batch_size: 16,
            num_workers: 1,
            seed: 42,
        }
    }
}

impl DataSettings {
    /// 分割ディレクトリ（train / val / test）のパス
    pub fn split_dir(&self, split: &str) -> PathBuf {
        Path::new(&self.data_dir).join(split)
    }
}

/// データ拡張設定（学習時のみ適用）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationSettings {
    pub enabled: bool,
    /// 回転角度の範囲（度）
    pub rotation_range: f32,
    /// 水平シフト（辺の長さに対する割合）
    pub width_shift_range: f32,
    /// 垂直シフト（辺の長さに対する割合）
    pub height_shift_range: f32,
    /// せん断角度の範囲（度）
    pub shear_range: f32,
    /// ズーム範囲: [1 - zoom, 1 + zoom]
    pub zoom_range: f32,
    pub horizontal_flip: bool,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rotation_range: 20.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// 学習済みモデル（tar.gz）のパス
    pub model_path: String,
    /// 事前学習済みバックボーン重み（burnレコード）のパス
    pub pretrained_backbone_path: Option<String>,
    /// バックボーンのチャネル倍率
    pub width_multiplier: f32,
    /// 分類ヘッドの中間ユニット数
    pub hidden_units: usize,
    /// ドロップアウト率
    pub dropout: f64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_path: "models/mango_leaf_model.tar.gz".to_string(),
            pretrained_backbone_path: None,
            width_multiplier: 1.0,
            hidden_units: 128,
            dropout: 0.3,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 第1段階（特徴抽出）のエポック数
    pub feature_extraction_epochs: usize,
    /// 第1段階の学習率
    pub feature_extraction_lr: f64,
    /// 第2段階（ファインチューニング）のエポック数
    pub fine_tune_epochs: usize,
    /// 第2段階の学習率
    pub fine_tune_lr: f64,
    /// この層番号より前のバックボーン層は第2段階でも凍結
    pub fine_tune_at: usize,
    /// 早期終了: val_accuracy が改善しないエポック数の上限
    pub early_stopping_patience: usize,
    /// 学習率減衰: val_loss が改善しないエポック数の上限
    pub plateau_patience: usize,
    pub plateau_factor: f64,
    pub plateau_min_delta: f64,
    pub min_learning_rate: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            feature_extraction_epochs: 15,
            feature_extraction_lr: 1e-3,
            fine_tune_epochs: 10,
            fine_tune_lr: 1e-5,
            fine_tune_at: 100,
            early_stopping_patience: 5,
            plateau_patience: 3,
            plateau_factor: 0.2,
            plateau_min_delta: 1e-4,
            min_learning_rate: 1e-7,
        }
    }
}

/// 推論サーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// アップロードの最大サイズ（バイト）
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// クラスラベル（順序がクラスIDを決める）
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub data: DataSettings,
    #[serde(default)]
    pub augmentation: AugmentationSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない場合や壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> Result<(), MangoError> {
        if self.data.image_size == 0 {
            return Err(MangoError::config("image_size must be positive"));
        }
        if self.data.batch_size == 0 {
            return Err(MangoError::config("batch_size must be positive"));
        }
        if self.model.width_multiplier <= 0.0 {
            return Err(MangoError::config("width_multiplier must be positive"));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(MangoError::config("dropout must be in [0, 1)"));
        }
        let t = &self.training;
        if t.feature_extraction_lr <= 0.0 || t.fine_tune_lr <= 0.0 || t.min_learning_rate <= 0.0 {
            return Err(MangoError::config("learning rates must be positive"));
        }
        if !(t.plateau_factor > 0.0 && t.plateau_factor < 1.0) {
            return Err(MangoError::config("plateau_factor must be in (0, 1)"));
        }
        // LabelSetはデシリアライズ時に空・重複を拒否済み
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("クラス ({}): {}", self.labels.len(), self.labels.names().join(", "));
        println!("\n--- データ設定 ---");
        println!("データディレクトリ: {}", self.data.data_dir);
        println!("画像サイズ: {}x{}", self.data.image_size, self.data.image_size);
        println!("バッチサイズ: {}", self.data.batch_size);
        println!("シード: {}", self.data.seed);
        println!("データ拡張: {}", if self.augmentation.enabled { "有効" } else { "無効" });
        println!("\n--- モデル設定 ---");
        println!("モデルパス: {}", self.model.model_path);
        match &self.model.pretrained_backbone_path {
            Some(path) => println!("事前学習済み重み: {}", path),
            None => println!("事前学習済み重み: なし"),
        }
        println!("幅倍率: {}", self.model.width_multiplier);
        println!("ドロップアウト率: {}", self.model.dropout);
        println!("\n--- トレーニング設定 ---");
        println!(
            "第1段階: {} エポック, 学習率 {}",
            self.training.feature_extraction_epochs, self.training.feature_extraction_lr
        );
        println!(
            "第2段階: {} エポック, 学習率 {} (層 {} 以降を解凍)",
            self.training.fine_tune_epochs, self.training.fine_tune_lr, self.training.fine_tune_at
        );
        println!("========================\n");
    }
}
