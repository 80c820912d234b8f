//! 機械学習モデルの共通定義
//!
//! マンゴー葉の病害分類モデル（MobileNetV2 + 分類ヘッド）と、
//! 学習・評価・推論で共通の画像前処理を提供します。

use std::fmt;
use std::ops::Range;
use std::path::Path;

use anyhow::Result;
use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    nn::{
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        Int, Tensor,
    },
};
use image::{imageops::FilterType, RgbImage};
use tracing::{info, warn};

use crate::error::MangoError;
use crate::ml::backbone::{MobileNetV2, MobileNetV2Config};
use crate::model::config::ModelSettings;

/// 既定の入力画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// モデル設定
#[derive(Config, Debug)]
pub struct MangoClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// バックボーン設定
    pub backbone: MobileNetV2Config,
    /// 中間全結合層のユニット数
    #[config(default = 128)]
    pub hidden_units: usize,
    /// ドロップアウト率
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl MangoClassifierConfig {
    /// 設定ファイルのモデル設定から作成
    pub fn from_settings(settings: &ModelSettings, num_classes: usize) -> Self {
        Self::new(
            num_classes,
            MobileNetV2Config::new().with_width_multiplier(settings.width_multiplier),
        )
        .with_hidden_units(settings.hidden_units)
        .with_dropout(settings.dropout)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> MangoClassifier<B> {
        let backbone = self.backbone.init(device);
        let features = backbone.out_channels();

        MangoClassifier {
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout_features: DropoutConfig::new(self.dropout).init(),
            dense: LinearConfig::new(features, self.hidden_units).init(device),
            activation: Relu::new(),
            norm: BatchNormConfig::new(self.hidden_units).init(device),
            dropout_hidden: DropoutConfig::new(self.dropout).init(),
            output: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
        }
    }

    /// モデルを初期化し、指定があれば事前学習済みバックボーン重みを読み込む
    pub fn init_pretrained<B: Backend>(
        &self,
        pretrained: Option<&Path>,
        device: &B::Device,
    ) -> Result<MangoClassifier<B>> {
        let mut model = self.init(device);
        match pretrained {
            Some(path) => {
                model.backbone = model.backbone.load_pretrained(path, device)?;
                info!("[Model] 事前学習済みバックボーン重みを読み込みました: {}", path.display());
            }
            None => {
                warn!("[Model] 事前学習済み重みが指定されていません。バックボーンはランダム初期化です");
            }
        }
        Ok(model)
    }
}

/// マンゴー葉病害分類モデル
///
/// # アーキテクチャ
/// - MobileNetV2 特徴抽出器
/// - Global Average Pooling
/// - Dropout → Dense(hidden) + ReLU → BatchNorm → Dropout
/// - Dense(num_classes) （Softmaxは分類時に適用）
#[derive(Module, Debug)]
pub struct MangoClassifier<B: Backend> {
    backbone: MobileNetV2<B>,
    pool: AdaptiveAvgPool2d,
    dropout_features: Dropout,
    dense: Linear<B>,
    activation: Relu,
    norm: BatchNorm<B>,
    dropout_hidden: Dropout,
    output: Linear<B>,
}

impl<B: Backend> MangoClassifier<B> {
    pub fn backbone(&self) -> &MobileNetV2<B> {
        &self.backbone
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward_from_stage(images, 0)
    }

    /// バックボーンの `start_stage` 以降と分類ヘッドを適用
    pub fn forward_from_stage(&self, x: Tensor<B, 4>, start_stage: usize) -> Tensor<B, 2> {
        let x = self
            .backbone
            .forward_stages(x, start_stage..self.backbone.num_stages());
        let x = self.pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        self.head(x.reshape([batch_size, channels]))
    }

    fn head(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.dropout_features.forward(features);
        let x = self.activation.forward(self.dense.forward(x));

        // BatchNormはチャネル次元を dim 1 に持つ3次元以上で適用
        let [batch_size, hidden] = x.dims();
        let x = self
            .norm
            .forward(x.reshape([batch_size, hidden, 1]))
            .reshape([batch_size, hidden]);

        let x = self.dropout_hidden.forward(x);
        self.output.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 交差エントロピー損失（ロジットから計算）
    pub fn loss(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, targets)
    }

    /// 層構成とパラメータ数の要約
    pub fn summary(&self, config: &MangoClassifierConfig, frozen_stages: usize) -> ModelSummary {
        let spans = config.backbone.stage_layer_spans();
        let params = self.backbone.stage_num_params();
        let num_blocks = self.backbone.num_stages().saturating_sub(2);

        let stages = spans
            .into_iter()
            .zip(params)
            .enumerate()
            .map(|(i, (layers, params))| StageSummary {
                name: if i == 0 {
                    "stem".to_string()
                } else if i <= num_blocks {
                    format!("block_{}", i - 1)
                } else {
                    "out_conv".to_string()
                },
                layers,
                params,
                frozen: i < frozen_stages,
            })
            .collect::<Vec<_>>();

        let total_params = self.num_params();
        let frozen_params: usize = stages.iter().filter(|s| s.frozen).map(|s| s.params).sum();

        ModelSummary {
            stages,
            head_params: total_params - self.backbone.num_params(),
            total_params,
            trainable_params: total_params - frozen_params,
        }
    }
}

/// 凍結ステージ（バックボーン先頭部分）
///
/// 内部バックエンドで推論モードとして実行し、出力だけを自動微分側へ戻します。
/// 凍結ステージのパラメータには勾配が付かないため、オプティマイザは更新しません。
pub struct FrozenStages<B: AutodiffBackend> {
    backbone: MobileNetV2<B::InnerBackend>,
    stages: usize,
}

impl<B: AutodiffBackend> FrozenStages<B> {
    pub fn new(model: &MangoClassifier<B>, stages: usize) -> Self {
        Self {
            stages: stages.min(model.backbone.num_stages()),
            backbone: model.backbone.valid(),
        }
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let features = self
            .backbone
            .forward_stages(images.inner(), 0..self.stages);
        Tensor::from_inner(features)
    }
}

/// ステージ1個分の要約
#[derive(Debug, Clone)]
pub struct StageSummary {
    pub name: String,
    pub layers: Range<usize>,
    pub params: usize,
    pub frozen: bool,
}

/// モデル要約
#[derive(Debug, Clone)]
pub struct ModelSummary {
    pub stages: Vec<StageSummary>,
    pub head_params: usize,
    pub total_params: usize,
    pub trainable_params: usize,
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== モデル構成 ===")?;
        writeln!(f, "{:<10} {:>9} {:>10}  状態", "ステージ", "層", "パラメータ")?;
        for stage in &self.stages {
            writeln!(
                f,
                "{:<10} {:>4}-{:<4} {:>10}  {}",
                stage.name,
                stage.layers.start,
                stage.layers.end.saturating_sub(1),
                stage.params,
                if stage.frozen { "凍結" } else { "学習" }
            )?;
        }
        writeln!(f, "{:<10} {:>9} {:>10}  学習", "head", "-", self.head_params)?;
        writeln!(f, "総パラメータ数: {}", self.total_params)?;
        writeln!(f, "学習対象: {}", self.trainable_params)?;
        write!(f, "凍結: {}", self.total_params - self.trainable_params)
    }
}

/// 画像バイト列をデコードしてRGBに変換（アルファ除去・グレースケール展開）
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, MangoError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| MangoError::decode(e.to_string()))
}

/// 正方形にリサイズ（アスペクト比は保持しない）
pub fn resize_square(img: &RgbImage, size: usize) -> RgbImage {
    if img.width() as usize == size && img.height() as usize == size {
        return img.clone();
    }
    image::imageops::resize(img, size as u32, size as u32, FilterType::Triangle)
}

/// RGB画像を [0,1] に正規化して (C, H, W) の順で平坦化
pub fn rgb_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let mut data = Vec::with_capacity(3 * (width * height) as usize);

    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                data.push(img.get_pixel(x, y)[channel] as f32 / 255.0);
            }
        }
    }

    data
}

/// 画像バイト列からモデル入力を作成（推論サーバーと単一画像評価で共通）
pub fn preprocess_bytes(bytes: &[u8], size: usize) -> Result<Vec<f32>, MangoError> {
    let img = decode_rgb(bytes)?;
    Ok(rgb_to_chw(&resize_square(&img, size)))
}

/// 画像ファイルを読み込んでモデル入力を作成
pub fn load_image_chw(path: &Path, size: usize) -> Result<Vec<f32>, MangoError> {
    let bytes = std::fs::read(path)?;
    preprocess_bytes(&bytes, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::optim::GradientsParams;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgba};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn tiny_config() -> MangoClassifierConfig {
        MangoClassifierConfig::new(8, MobileNetV2Config::new().with_width_multiplier(0.25))
            .with_hidden_units(16)
    }

    #[test]
    fn test_forward_shape_and_softmax() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::ones([2, 3, 32, 32], &device);

        let probs = model.forward_softmax(images);
        assert_eq!(probs.dims(), [2, 8]);

        let values = probs.into_data().to_vec::<f32>().unwrap();
        for row in values.chunks(8) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn test_inference_is_deterministic() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::full([1, 3, 32, 32], 0.5, &device);

        let a = model.forward_softmax(images.clone()).into_data().to_vec::<f32>().unwrap();
        let b = model.forward_softmax(images).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_frozen_stages_produce_no_backbone_gradients() {
        let device = Default::default();
        let model = tiny_config().init::<TestAutodiffBackend>(&device);
        let frozen = FrozenStages::new(&model, model.backbone().num_stages());

        let images = Tensor::<TestAutodiffBackend, 4>::ones([2, 3, 32, 32], &device);
        let targets = Tensor::<TestAutodiffBackend, 1, Int>::from_ints([0, 3], &device);
        let logits = model.forward_from_stage(frozen.forward(images), frozen.stages());
        let loss = model.loss(logits, targets);

        let grads = loss.backward();
        assert!(model.output.weight.val().grad(&grads).is_some());

        let backbone_grads = GradientsParams::from_grads(grads, model.backbone());
        assert_eq!(backbone_grads.len(), 0);
    }

    #[test]
    fn test_summary_counts() {
        let device = Default::default();
        let config = tiny_config();
        let model = config.init::<TestBackend>(&device);

        let all_frozen = model.summary(&config, 19);
        assert_eq!(all_frozen.stages.len(), 19);
        assert_eq!(all_frozen.trainable_params, all_frozen.head_params);

        let partly = model.summary(&config, config.backbone.frozen_stage_count(100));
        assert!(partly.trainable_params > partly.head_params);
        assert!(partly.trainable_params < partly.total_params);

        let none = model.summary(&config, 0);
        assert_eq!(none.trainable_params, none.total_params);
        assert!(format!("{}", none).contains("out_conv"));
    }

    #[test]
    fn test_preprocess_converts_to_rgb_and_resizes() {
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> =
            ImageBuffer::from_pixel(40, 20, Rgba([255, 0, 51, 128]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let data = preprocess_bytes(&bytes, 16).unwrap();
        assert_eq!(data.len(), 3 * 16 * 16);
        assert!((data[0] - 1.0).abs() < 1e-6);
        assert!(data[16 * 16].abs() < 1e-6);
        assert!((data[2 * 16 * 16] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result = preprocess_bytes(b"not an image", 16);
        assert!(matches!(result, Err(MangoError::Decode(_))));
    }
}
