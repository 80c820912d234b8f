//! データセットの分割
//!
//! クラスごとのフォルダに入った元画像を、シード固定でシャッフルして
//! `train/` `val/` `test/` にコピーします（既定 70/15/15）。

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::MangoError;
use crate::ml::dataset::list_images;

pub const SPLITS: [&str; 3] = ["train", "val", "test"];

/// 分割設定
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionConfig {
    pub train_ratio: f64,
    pub val_ratio: f64,
    pub seed: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            train_ratio: 0.7,
            val_ratio: 0.15,
            seed: 42,
        }
    }
}

impl PartitionConfig {
    pub fn validate(&self) -> Result<(), MangoError> {
        let in_unit = |r: f64| (0.0..=1.0).contains(&r);
        if !in_unit(self.train_ratio) || !in_unit(self.val_ratio) || self.train_ratio + self.val_ratio > 1.0 {
            return Err(MangoError::config(format!(
                "invalid split ratios: train={}, val={}",
                self.train_ratio, self.val_ratio
            )));
        }
        Ok(())
    }

    /// n枚を (train, val, test) 枚数に分ける（切り捨て、残りは test）
    pub fn split_counts(&self, n: usize) -> (usize, usize, usize) {
        // 0.7 * 20 のような丸め誤差で1枚減らないよう微小量を足す
        let portion = |ratio: f64| (n as f64 * ratio + 1e-9).floor() as usize;
        let train = portion(self.train_ratio).min(n);
        let val = portion(self.val_ratio).min(n - train);
        (train, val, n - train - val)
    }
}

/// クラスごとの枚数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SplitCounts {
    pub train: usize,
    pub val: usize,
    pub test: usize,
}

impl SplitCounts {
    pub fn total(&self) -> usize {
        self.train + self.val + self.test
    }

    fn add(&mut self, other: &SplitCounts) {
        self.train += other.train;
        self.val += other.val;
        self.test += other.test;
    }
}

/// 分割結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub classes: Vec<(String, SplitCounts)>,
    pub totals: SplitCounts,
}

impl PartitionReport {
    fn push(&mut self, class: String, counts: SplitCounts) {
        self.totals.add(&counts);
        self.classes.push((class, counts));
    }
}

impl fmt::Display for PartitionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (class, c) in &self.classes {
            writeln!(f, "{}: train={} val={} test={}", class, c.train, c.val, c.test)?;
        }
        write!(
            f,
            "合計: train={} val={} test={} ({}枚)",
            self.totals.train,
            self.totals.val,
            self.totals.test,
            self.totals.total()
        )
    }
}

/// 直下のクラスディレクトリ（隠しディレクトリを除く、名前順）
fn class_dirs(dir: &Path) -> Result<Vec<PathBuf>, MangoError> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| !n.starts_with('.'))
        })
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 元画像を分割してコピー
pub fn split_dataset(
    source_dir: &Path,
    output_dir: &Path,
    config: &PartitionConfig,
) -> Result<PartitionReport, MangoError> {
    config.validate()?;
    if !source_dir.is_dir() {
        return Err(MangoError::config(format!(
            "source directory not found: {}",
            source_dir.display()
        )));
    }

    let classes = class_dirs(source_dir)?;
    if classes.is_empty() {
        return Err(MangoError::config(format!(
            "no class folders in {}",
            source_dir.display()
        )));
    }
    info!("[Partition] クラス: {}", classes.iter().map(|c| dir_name(c)).collect::<Vec<_>>().join(", "));

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut report = PartitionReport::default();

    for class_dir in &classes {
        let class = dir_name(class_dir);
        for split in SPLITS {
            fs::create_dir_all(output_dir.join(split).join(&class))?;
        }

        let mut images = list_images(class_dir)?;
        if images.is_empty() {
            warn!("[Partition] {} に画像がありません", class);
            report.push(class, SplitCounts::default());
            continue;
        }

        images.shuffle(&mut rng);
        let (n_train, n_val, _) = config.split_counts(images.len());
        let (train, rest) = images.split_at(n_train);
        let (val, test) = rest.split_at(n_val);

        for (split, files) in SPLITS.iter().zip([train, val, test]) {
            let target = output_dir.join(split).join(&class);
            for src in files {
                if let Some(name) = src.file_name() {
                    fs::copy(src, target.join(name))?;
                }
            }
        }

        let counts = SplitCounts {
            train: train.len(),
            val: val.len(),
            test: test.len(),
        };
        info!(
            "[Partition] {}: {}枚 -> train={} val={} test={}",
            class,
            images.len(),
            counts.train,
            counts.val,
            counts.test
        );
        report.push(class, counts);
    }

    Ok(report)
}

/// 出力ディレクトリを数え直す
pub fn verify_split(output_dir: &Path) -> Result<PartitionReport, MangoError> {
    let train_dir = output_dir.join("train");
    if !train_dir.is_dir() {
        return Err(MangoError::config(format!(
            "split directory not found: {}",
            train_dir.display()
        )));
    }

    let count = |split: &str, class: &str| -> Result<usize, MangoError> {
        let dir = output_dir.join(split).join(class);
        if dir.is_dir() {
            Ok(list_images(&dir)?.len())
        } else {
            Ok(0)
        }
    };

    let mut report = PartitionReport::default();
    for class_dir in class_dirs(&train_dir)? {
        let class = dir_name(&class_dir);
        let counts = SplitCounts {
            train: count("train", &class)?,
            val: count("val", &class)?,
            test: count("test", &class)?,
        };
        report.push(class, counts);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn make_source(root: &Path, classes: &[(&str, usize)]) {
        for (class, n) in classes {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..*n {
                RgbImage::from_pixel(4, 4, Rgb([i as u8, 0, 0]))
                    .save(dir.join(format!("{:03}.png", i)))
                    .unwrap();
            }
        }
    }

    #[test]
    fn test_split_counts_floor() {
        let config = PartitionConfig::default();
        assert_eq!(config.split_counts(20), (14, 3, 3));
        assert_eq!(config.split_counts(10), (7, 1, 2));
        assert_eq!(config.split_counts(1), (0, 0, 1));
        assert_eq!(config.split_counts(0), (0, 0, 0));
    }

    #[test]
    fn test_split_and_verify() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        make_source(src.path(), &[("Healthy", 20), ("Die Back", 10), ("Gall Midge", 0)]);
        fs::write(src.path().join("Healthy").join("notes.txt"), "skip me").unwrap();

        let report = split_dataset(src.path(), out.path(), &PartitionConfig::default()).unwrap();
        assert_eq!(report.classes.len(), 3);
        assert_eq!(report.totals.total(), 30);
        assert_eq!(report.totals.train, 14 + 7);

        // 空クラスも3分割すべてにフォルダが作られる
        for split in SPLITS {
            assert!(out.path().join(split).join("Gall Midge").is_dir());
        }

        let verified = verify_split(out.path()).unwrap();
        assert_eq!(verified, report);
    }

    #[test]
    fn test_split_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        make_source(src.path(), &[("Healthy", 12)]);

        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        split_dataset(src.path(), a.path(), &PartitionConfig::default()).unwrap();
        split_dataset(src.path(), b.path(), &PartitionConfig::default()).unwrap();

        let names = |root: &Path| list_images(&root.join("test").join("Healthy")).unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_owned())
            .collect::<Vec<_>>();
        assert_eq!(names(a.path()), names(b.path()));
    }

    #[test]
    fn test_missing_source_is_config_error() {
        let out = tempfile::tempdir().unwrap();
        let result = split_dataset(Path::new("no/such/dir"), out.path(), &PartitionConfig::default());
        assert!(matches!(result, Err(MangoError::Config(_))));
    }
}
