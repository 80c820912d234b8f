//! MobileNetV2 特徴抽出器
//!
//! 分類ヘッドの前段に置くバックボーンです。ステージ単位（stem、逆残差ブロック×17、最終1x1畳み込み）で
//! 順伝播でき、ファインチューニング時の凍結境界もステージ単位で決まります。
//!
//! 各ステージには Keras 版 MobileNetV2 に換算した層番号の範囲を持たせています
//! （入力層を0番として全154層）。`fine_tune_at` との比較はこの番号で行います。

use std::ops::Range;
use std::path::Path;

use anyhow::Result;
use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor},
};

/// 逆残差ブロックの構成 (拡張率 t, 出力チャネル c, 繰り返し n, ストライド s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

/// 入力層 + stem (Conv, BN, ReLU6)
const STEM_LAYERS: usize = 4;
/// 最終 Conv, BN, ReLU6
const LAST_LAYERS: usize = 3;

/// チャネル数を8の倍数に丸める
fn make_divisible(value: f32, divisor: usize) -> usize {
    let d = divisor as f32;
    let rounded = (((value + d / 2.0) / d).floor() * d).max(d);
    // 丸めで10%以上減る場合は1段上げる
    if rounded < 0.9 * value {
        (rounded + d) as usize
    } else {
        rounded as usize
    }
}

/// バックボーン設定
#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// チャネル倍率（alpha）
    #[config(default = 1.0)]
    pub width_multiplier: f32,
}

/// 逆残差ブロック1個の形状
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub stride: usize,
    pub expand_ratio: usize,
    /// Keras換算の先頭層番号
    pub first_layer: usize,
}

impl BlockSpec {
    pub fn hidden_channels(&self) -> usize {
        self.in_channels * self.expand_ratio
    }

    pub fn use_residual(&self) -> bool {
        self.stride == 1 && self.in_channels == self.out_channels
    }

    /// Keras換算の層数
    pub fn layer_count(&self) -> usize {
        let expand = if self.expand_ratio != 1 { 3 } else { 0 };
        let pad = if self.stride == 2 { 1 } else { 0 };
        let add = if self.use_residual() { 1 } else { 0 };
        expand + pad + 3 + 2 + add
    }
}

impl MobileNetV2Config {
    pub fn stem_channels(&self) -> usize {
        make_divisible(STEM_CHANNELS as f32 * self.width_multiplier, 8)
    }

    /// 最終畳み込みの出力チャネル数（特徴次元）
    pub fn out_channels(&self) -> usize {
        if self.width_multiplier > 1.0 {
            make_divisible(LAST_CHANNELS as f32 * self.width_multiplier, 8)
        } else {
            LAST_CHANNELS
        }
    }

    /// 17個の逆残差ブロックの形状（重みの確保なしで計算）
    pub fn block_specs(&self) -> Vec<BlockSpec> {
        let mut specs = Vec::new();
        let mut in_channels = self.stem_channels();
        let mut first_layer = STEM_LAYERS;

        for (t, c, n, s) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = make_divisible(c as f32 * self.width_multiplier, 8);
            for i in 0..n {
                let spec = BlockSpec {
                    in_channels,
                    out_channels,
                    stride: if i == 0 { s } else { 1 },
                    expand_ratio: t,
                    first_layer,
                };
                first_layer += spec.layer_count();
                in_channels = out_channels;
                specs.push(spec);
            }
        }

        specs
    }

    /// 各ステージのKeras換算層番号範囲（stem、ブロック、最終畳み込みの順）
    pub fn stage_layer_spans(&self) -> Vec<Range<usize>> {
        let specs = self.block_specs();
        let mut spans = Vec::with_capacity(specs.len() + 2);
        spans.push(0..STEM_LAYERS);

        let mut next = STEM_LAYERS;
        for spec in &specs {
            next = spec.first_layer + spec.layer_count();
            spans.push(spec.first_layer..next);
        }
        spans.push(next..next + LAST_LAYERS);
        spans
    }

    /// Keras換算の総層数
    pub fn total_layers(&self) -> usize {
        self.stage_layer_spans().last().map(|s| s.end).unwrap_or(0)
    }

    /// 先頭層番号が `fine_tune_at` より前のステージ数（凍結するステージ数）
    pub fn frozen_stage_count(&self, fine_tune_at: usize) -> usize {
        self.stage_layer_spans()
            .iter()
            .take_while(|span| span.start < fine_tune_at)
            .count()
    }

    /// バックボーンを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let stem = ConvBnRelu6::new(3, self.stem_channels(), 3, 2, 1, device);

        let specs = self.block_specs();
        let last_in = specs
            .last()
            .map(|s| s.out_channels)
            .unwrap_or_else(|| self.stem_channels());
        let blocks = specs
            .into_iter()
            .map(|spec| InvertedResidual::new(spec, device))
            .collect();

        let last = ConvBnRelu6::new(last_in, self.out_channels(), 1, 1, 1, device);

        MobileNetV2 {
            stem,
            blocks,
            last,
            out_channels: Ignored(self.out_channels()),
        }
    }
}

/// Conv + BatchNorm + ReLU6
#[derive(Module, Debug)]
pub struct ConvBnRelu6<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> ConvBnRelu6<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel - 1) / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let bn = BatchNormConfig::new(out_channels).init(device);

        Self { conv, bn }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        x.clamp(0.0, 6.0)
    }
}

/// 逆残差ブロック（expand 1x1 → depthwise 3x3 → project 1x1）
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvBnRelu6<B>>,
    depthwise: ConvBnRelu6<B>,
    project: Conv2d<B>,
    project_bn: BatchNorm<B>,
    spec: Ignored<BlockSpec>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(spec: BlockSpec, device: &B::Device) -> Self {
        let hidden = spec.hidden_channels();
        let expand = (spec.expand_ratio != 1)
            .then(|| ConvBnRelu6::new(spec.in_channels, hidden, 1, 1, 1, device));
        let depthwise = ConvBnRelu6::new(hidden, hidden, 3, spec.stride, hidden, device);
        let project = Conv2dConfig::new([hidden, spec.out_channels], [1, 1])
            .with_bias(false)
            .init(device);
        let project_bn = BatchNormConfig::new(spec.out_channels).init(device);

        Self {
            expand,
            depthwise,
            project,
            project_bn,
            spec: Ignored(spec),
        }
    }

    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match &self.expand {
            Some(expand) => expand.forward(x.clone()),
            None => x.clone(),
        };
        let out = self.depthwise.forward(out);
        let out = self.project_bn.forward(self.project.forward(out));

        if self.spec.use_residual() {
            x + out
        } else {
            out
        }
    }
}

/// MobileNetV2 本体（全結合層なし）
///
/// 出力は `[batch, out_channels, H/32, W/32]` の特徴マップです。
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvBnRelu6<B>,
    blocks: Vec<InvertedResidual<B>>,
    last: ConvBnRelu6<B>,
    out_channels: Ignored<usize>,
}

impl<B: Backend> MobileNetV2<B> {
    /// ステージ数（stem + ブロック数 + 最終畳み込み）
    pub fn num_stages(&self) -> usize {
        self.blocks.len() + 2
    }

    pub fn out_channels(&self) -> usize {
        *self.out_channels
    }

    /// 1ステージ分の順伝播
    pub fn forward_stage(&self, stage: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if stage == 0 {
            self.stem.forward(x)
        } else if stage <= self.blocks.len() {
            self.blocks[stage - 1].forward(x)
        } else {
            self.last.forward(x)
        }
    }

    /// 指定範囲のステージを順に適用
    pub fn forward_stages(&self, x: Tensor<B, 4>, stages: Range<usize>) -> Tensor<B, 4> {
        let end = stages.end.min(self.num_stages());
        (stages.start..end).fold(x, |x, stage| self.forward_stage(stage, x))
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_stages(x, 0..self.num_stages())
    }

    /// ステージごとのパラメータ数
    pub fn stage_num_params(&self) -> Vec<usize> {
        let mut counts = Vec::with_capacity(self.num_stages());
        counts.push(self.stem.num_params());
        counts.extend(self.blocks.iter().map(|b| b.num_params()));
        counts.push(self.last.num_params());
        counts
    }

    /// 事前学習済み重み（burnレコードファイル）を読み込む
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path, &recorder, device)
            .map_err(|e| anyhow::anyhow!("事前学習済み重みの読み込みエラー ({}): {:?}", path.display(), e))
    }

    /// 重みをburnレコードファイルとして保存
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        let recorder = DefaultFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path, &recorder)
            .map_err(|e| anyhow::anyhow!("重みの保存エラー ({}): {:?}", path.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(32.0, 8), 32);
        assert_eq!(make_divisible(4.0, 8), 8);
        assert_eq!(make_divisible(24.0 * 0.35, 8), 8);
        assert_eq!(make_divisible(160.0 * 0.75, 8), 120);
    }

    #[test]
    fn test_keras_layer_numbering() {
        let config = MobileNetV2Config::new();
        let specs = config.block_specs();
        assert_eq!(specs.len(), 17);
        assert_eq!(config.total_layers(), 154);

        let spans = config.stage_layer_spans();
        assert_eq!(spans.len(), 19);
        assert_eq!(spans[0], 0..4);
        assert_eq!(spans[1], 4..9);
        // ブロック10 (64→96, stride 1) は残差なしで8層
        assert_eq!(spans[11], 90..98);
        assert_eq!(spans[12], 98..107);
        assert_eq!(spans[18], 151..154);
    }

    #[test]
    fn test_frozen_stage_count() {
        let config = MobileNetV2Config::new();
        assert_eq!(config.frozen_stage_count(0), 0);
        // stem + ブロック0〜11
        assert_eq!(config.frozen_stage_count(100), 13);
        assert_eq!(config.frozen_stage_count(1000), 19);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let config = MobileNetV2Config::new().with_width_multiplier(0.25);
        let model = config.init::<TestBackend>(&device);
        assert_eq!(model.num_stages(), 19);

        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        let out = model.forward(x);
        assert_eq!(out.dims(), [2, config.out_channels(), 2, 2]);
    }

    #[test]
    fn test_staged_forward_matches_full() {
        let device = Default::default();
        let model = MobileNetV2Config::new()
            .with_width_multiplier(0.25)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);

        let full = model.forward(x.clone());
        let head = model.forward_stages(x, 0..5);
        let staged = model.forward_stages(head, 5..model.num_stages());

        let a = full.into_data().to_vec::<f32>().unwrap();
        let b = staged.into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_pretrained_round_trip() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone");
        let config = MobileNetV2Config::new().with_width_multiplier(0.25);

        let source = config.init::<TestBackend>(&device);
        source.save_weights(&path).unwrap();

        let loaded = config
            .init::<TestBackend>(&device)
            .load_pretrained(&path.with_extension("mpk"), &device)
            .unwrap();

        let x = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let a = source.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
        let b = loaded.forward(x).into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_pretrained_file_is_error() {
        let device = Default::default();
        let model = MobileNetV2Config::new()
            .with_width_multiplier(0.25)
            .init::<TestBackend>(&device);
        assert!(model
            .load_pretrained(Path::new("/nonexistent/backbone.mpk"), &device)
            .is_err());
    }
}
