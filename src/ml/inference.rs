//! モデル推論機能
//!
//! 成果物（tar.gz）からメタデータと重みを読み込み、画像バイト列を分類します。
//! 前処理は学習・評価と同じ `preprocess_bytes` を使います。

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use crate::error::MangoError;
use crate::ml::ml_model::{load_image_chw, preprocess_bytes, MangoClassifier};
use crate::model::labels::LabelSet;
use crate::model::{load_model_with_metadata, ModelMetadata};

/// 1枚分の分類結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub index: usize,
    pub label: String,
    pub confidence: f32,
    /// ラベル順の (クラス名, 確率)
    pub probabilities: Vec<(String, f32)>,
}

impl Prediction {
    /// Softmax出力から作成（最大確率のクラスを採用、同率なら小さいインデックス）
    pub fn from_probabilities(labels: &LabelSet, probs: &[f32]) -> Result<Self, MangoError> {
        if probs.len() != labels.len() {
            return Err(MangoError::model(format!(
                "model produced {} probabilities for {} labels",
                probs.len(),
                labels.len()
            )));
        }

        let (index, confidence) = argmax(probs)
            .ok_or_else(|| MangoError::model("model produced no probabilities"))?;
        let probabilities = labels
            .iter()
            .zip(probs)
            .map(|(name, &p)| (name.to_string(), p))
            .collect();

        Ok(Self {
            index,
            label: labels.name(index).unwrap_or_default().to_string(),
            confidence,
            probabilities,
        })
    }

    /// 確率の高い順に上位k件
    pub fn top_k(&self, k: usize) -> Vec<(&str, f32)> {
        let mut ranked: Vec<(&str, f32)> = self
            .probabilities
            .iter()
            .map(|(name, p)| (name.as_str(), *p))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(k);
        ranked
    }
}

/// 最大値とそのインデックス（先勝ち）
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

/// 画像分類器のインターフェース
///
/// HTTPサービスはこのトレイト越しにモデルを使います。
pub trait ImageClassifier: Send + Sync {
    /// エンコード済み画像（PNG/JPEGなど）を分類
    fn classify(&self, image_bytes: &[u8]) -> Result<Prediction, MangoError>;

    fn labels(&self) -> &LabelSet;

    fn image_size(&self) -> usize;

    /// 入力形状 (N, C, H, W)、バッチ次元は不定
    fn input_shape(&self) -> [Option<usize>; 4] {
        let size = self.image_size();
        [None, Some(3), Some(size), Some(size)]
    }

    /// 出力形状 (N, クラス数)
    fn output_shape(&self) -> [Option<usize>; 2] {
        [None, Some(self.labels().len())]
    }
}

/// 成果物からモデルとメタデータを復元
pub fn load_classifier<B: Backend>(
    model_path: &Path,
    device: &B::Device,
) -> Result<(MangoClassifier<B>, ModelMetadata)> {
    if !model_path.exists() {
        return Err(MangoError::config(format!(
            "model file not found: {}",
            model_path.display()
        ))
        .into());
    }

    let (metadata, model_binary) = load_model_with_metadata(model_path)?;
    metadata.validate()?;

    let model = metadata.classifier.init::<B>(device);

    // モデルの重みを復元
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| MangoError::model(format!("モデル重みの読み込みエラー: {:?}", e)))?;
    let model = model.load_record(record);

    info!(
        "[Inference] モデルを読み込みました: {} ({}クラス, 入力 {}x{})",
        model_path.display(),
        metadata.labels.len(),
        metadata.image_size,
        metadata.image_size
    );

    Ok((model, metadata))
}

/// 推論エンジン
///
/// `Mutex` は burn のモジュールが `Sync` とは限らないためのもので、推論は重みを変更しません。
/// 同時リクエストはこのロックで直列化されます。
pub struct InferenceEngine<B: Backend> {
    model: Mutex<MangoClassifier<B>>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: &B::Device) -> Result<Self> {
        let (model, metadata) = load_classifier::<B>(model_path.as_ref(), device)?;
        Ok(Self::from_model(model, metadata, device.clone()))
    }

    /// 学習直後のモデルから作成
    pub fn from_model(model: MangoClassifier<B>, metadata: ModelMetadata, device: B::Device) -> Self {
        Self {
            model: Mutex::new(model),
            metadata,
            device,
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 前処理済みCHWデータを分類
    pub fn predict_chw(&self, data: &[f32]) -> Result<Prediction, MangoError> {
        let size = self.metadata.image_size;
        if data.len() != 3 * size * size {
            return Err(MangoError::model(format!(
                "expected {} input values, got {}",
                3 * size * size,
                data.len()
            )));
        }

        let tensor = Tensor::<B, 1>::from_floats(data, &self.device).reshape([1, 3, size, size]);
        let probs = {
            let model = self.model.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            model.forward_softmax(tensor)
        };
        let probs = probs
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| MangoError::model(format!("推論結果の取得エラー: {:?}", e)))?;

        Prediction::from_probabilities(&self.metadata.labels, &probs)
    }

    /// 画像バイト列を分類
    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction, MangoError> {
        let data = preprocess_bytes(bytes, self.metadata.image_size)?;
        self.predict_chw(&data)
    }

    /// 画像ファイルを分類
    pub fn predict_path(&self, path: &Path) -> Result<Prediction, MangoError> {
        let data = load_image_chw(path, self.metadata.image_size)?;
        self.predict_chw(&data)
    }
}

impl<B: Backend> ImageClassifier for InferenceEngine<B> {
    fn classify(&self, image_bytes: &[u8]) -> Result<Prediction, MangoError> {
        self.predict_bytes(image_bytes)
    }

    fn labels(&self) -> &LabelSet {
        &self.metadata.labels
    }

    fn image_size(&self) -> usize {
        self.metadata.image_size
    }
}
