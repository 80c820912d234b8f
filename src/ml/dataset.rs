//! 画像データセットとバッチ生成
//!
//! `<split_dir>/<クラス名>/*.png` 形式のディレクトリをラベルセットの順序で読み込み、
//! 正規化済みのバッチを生成します。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder},
    tensor::{backend::Backend, Int, Tensor},
};
use burn_dataset::Dataset;
use tracing::{info, warn};

use crate::error::MangoError;
use crate::ml::augmentation::Augmenter;
use crate::ml::ml_model::{decode_rgb, resize_square, rgb_to_chw};
use crate::model::labels::LabelSet;

/// 対象とする画像拡張子
pub const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// 画像ファイルかどうか（拡張子で判定、大文字小文字は区別しない）
pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy().to_lowercase();
                IMAGE_EXTENSIONS.contains(&ext.as_str())
            })
            .unwrap_or(false)
}

/// ディレクトリ直下の画像ファイル（ファイル名順）
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, MangoError> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct LeafItem {
    pub path: PathBuf,
    pub label: usize,
}

/// 分割済みデータセット（train / val / test のいずれか）
pub struct LeafDataset {
    items: Vec<LeafItem>,
    labels: LabelSet,
    class_counts: Vec<usize>,
}

impl LeafDataset {
    /// ラベルセットの順序でクラスディレクトリを読み込む
    ///
    /// - ディレクトリ自体やクラスディレクトリが無い場合は設定エラー
    /// - 画像が0枚のクラスは警告のみ（件数0として扱う）
    /// - ラベルセットに無いサブディレクトリは警告して無視
    pub fn from_split_dir(split_dir: &Path, labels: &LabelSet) -> Result<Self, MangoError> {
        if !split_dir.is_dir() {
            return Err(MangoError::config(format!(
                "data directory not found: {}",
                split_dir.display()
            )));
        }

        for entry in std::fs::read_dir(split_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path.file_name().map(|n| n.to_string_lossy().to_string());
            if let Some(name) = name {
                if !name.starts_with('.') && labels.index_of(&name).is_none() {
                    warn!("ラベルセットに無いディレクトリを無視します: {}", path.display());
                }
            }
        }

        let mut items = Vec::new();
        let mut class_counts = Vec::with_capacity(labels.len());

        for (class_id, class_name) in labels.iter().enumerate() {
            let class_dir = split_dir.join(class_name);
            if !class_dir.is_dir() {
                return Err(MangoError::config(format!(
                    "class directory missing: {}",
                    class_dir.display()
                )));
            }

            let images = list_images(&class_dir)?;
            if images.is_empty() {
                warn!("クラス '{}' に画像がありません: {}", class_name, class_dir.display());
            }
            class_counts.push(images.len());
            items.extend(images.into_iter().map(|path| LeafItem {
                path,
                label: class_id,
            }));
        }

        Ok(Self {
            items,
            labels: labels.clone(),
            class_counts,
        })
    }

    /// アイテムから直接作成
    pub fn from_items(items: Vec<LeafItem>, labels: &LabelSet) -> Self {
        let mut class_counts = vec![0; labels.len()];
        for item in &items {
            if let Some(count) = class_counts.get_mut(item.label) {
                *count += 1;
            }
        }
        Self {
            items,
            labels: labels.clone(),
            class_counts,
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn items(&self) -> &[LeafItem] {
        &self.items
    }

    /// クラスごとの枚数（ラベルセット順）
    pub fn class_counts(&self) -> &[usize] {
        &self.class_counts
    }

    /// クラスごとの枚数をログ出力
    pub fn log_counts(&self, split: &str) {
        info!("{}: {} 枚", split, self.items.len());
        for (name, count) in self.labels.iter().zip(&self.class_counts) {
            info!("  {}: {} 枚", name, count);
        }
    }
}

impl Dataset<LeafItem> for LeafDataset {
    fn get(&self, index: usize) -> Option<LeafItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct LeafBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    pub labels: Vec<usize>,
    pub paths: Vec<PathBuf>,
}

/// 読み込めない画像を含んでいたバッチ
#[derive(Clone, Debug)]
pub struct BatchFailure {
    pub size: usize,
    pub failures: Vec<(PathBuf, String)>,
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let list = self
            .failures
            .iter()
            .map(|(path, reason)| format!("{} ({})", path.display(), reason))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{} 枚中 {} 枚の読み込みに失敗: {}", self.size, self.failures.len(), list)
    }
}

/// バッチ生成の結果（失敗したバッチは学習・評価でスキップ）
pub type BatchOutcome<B> = Result<LeafBatch<B>, BatchFailure>;

/// バッチャー
#[derive(Clone)]
pub struct LeafBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augmenter: Option<Arc<Augmenter>>,
}

impl<B: Backend> LeafBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            augmenter: None,
        }
    }

    pub fn with_augmenter(mut self, augmenter: Arc<Augmenter>) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    fn load_item(&self, item: &LeafItem) -> Result<Vec<f32>, MangoError> {
        let bytes = std::fs::read(&item.path)?;
        let img = resize_square(&decode_rgb(&bytes)?, self.image_size);
        let img = match &self.augmenter {
            Some(augmenter) => augmenter.augment(&img),
            None => img,
        };
        Ok(rgb_to_chw(&img))
    }
}

impl<B: Backend> Batcher<B, LeafItem, BatchOutcome<B>> for LeafBatcher<B> {
    fn batch(&self, items: Vec<LeafItem>, _device: &B::Device) -> BatchOutcome<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets = Vec::with_capacity(batch_size);
        let mut labels = Vec::with_capacity(batch_size);
        let mut paths = Vec::with_capacity(batch_size);
        let mut failures = Vec::new();

        for item in items {
            match self.load_item(&item) {
                Ok(image_data) => {
                    all_pixels.extend_from_slice(&image_data);
                    targets.push(item.label as i64);
                    labels.push(item.label);
                    paths.push(item.path);
                }
                Err(e) => failures.push((item.path, e.to_string())),
            }
        }

        if !failures.is_empty() {
            return Err(BatchFailure {
                size: batch_size,
                failures,
            });
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        Ok(LeafBatch {
            images,
            targets,
            labels,
            paths,
        })
    }
}

/// 学習用データローダー（シャッフル・拡張あり）
pub fn train_loader<B: Backend>(
    dataset: LeafDataset,
    image_size: usize,
    batch_size: usize,
    num_workers: usize,
    seed: u64,
    augmenter: Option<Arc<Augmenter>>,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, BatchOutcome<B>>> {
    let mut batcher = LeafBatcher::<B>::new(device.clone(), image_size);
    if let Some(augmenter) = augmenter {
        batcher = batcher.with_augmenter(augmenter);
    }

    let builder = DataLoaderBuilder::new(batcher)
        .batch_size(batch_size)
        .shuffle(seed);
    let builder = if num_workers > 1 {
        builder.num_workers(num_workers)
    } else {
        builder
    };
    builder.build(dataset)
}

/// 検証・テスト用データローダー（シャッフルなし・単一スレッドで順序固定）
pub fn eval_loader<B: Backend>(
    dataset: LeafDataset,
    image_size: usize,
    batch_size: usize,
    device: &B::Device,
) -> Arc<dyn DataLoader<B, BatchOutcome<B>>> {
    DataLoaderBuilder::new(LeafBatcher::<B>::new(device.clone(), image_size))
        .batch_size(batch_size)
        .build(dataset)
}
