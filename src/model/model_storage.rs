//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル順、入力サイズ、分類器構成など）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{Context, Result};
use std::path::Path;
use std::fs::File;
use std::io::Read;
use tar::{Builder, Archive};
use flate2::Compression;
use flate2::write::GzEncoder;
use flate2::read::GzDecoder;

use crate::model::model_metadata::ModelMetadata;

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 1つのtar.gzファイルに以下を含む：
/// - metadata.json : メタデータ
/// - model.bin : モデルの重み
///
/// 拡張子に関係なく `output_path` にそのまま書き込みます（読み込み側は同じパスを開く）。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(output_path)
        .context(format!("Failed to create tar.gz file: {:?}", output_path))?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    // メタデータをJSONとして追加
    let json_str = metadata.to_json_string()?;
    let json_bytes = json_str.as_bytes();

    let mut header = tar::Header::new_gnu();
    header.set_path("metadata.json")?;
    header.set_size(json_bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar_builder.append(&header, json_bytes)
        .context("Failed to add metadata.json to tar")?;

    // モデルバイナリを追加
    let mut header = tar::Header::new_gnu();
    header.set_path("model.bin")?;
    header.set_size(model_binary.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar_builder.append(&header, model_binary)
        .context("Failed to add model.bin to tar")?;

    // tarアーカイブとgzipストリームを完成させる
    let encoder = tar_builder.into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish()
        .context("Failed to finalize gzip stream")?;

    Ok(())
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    // metadata.jsonを探す
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        if path.to_str() == Some("metadata.json") {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;

    let decoder = GzDecoder::new(tar_gz_file);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    // 両方のファイルを読み込む
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;

        match path.to_str() {
            Some("metadata.json") => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some("model.bin") => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("フォーマット: v{}", metadata.format_version);
    println!("クラス ({}個): {}", metadata.labels.len(), metadata.labels.names().join(", "));
    println!("モデル入力サイズ: {}x{}", metadata.image_size, metadata.image_size);
    println!("幅倍率: {}", metadata.classifier.backbone.width_multiplier);
    println!("中間層ユニット数: {}", metadata.classifier.hidden_units);
    println!("学習エポック数: {}", metadata.epochs_run);
    if let Some(acc) = metadata.best_val_accuracy {
        println!("最良検証精度: {:.4}", acc);
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::backbone::MobileNetV2Config;
    use crate::ml::ml_model::MangoClassifierConfig;
    use crate::model::labels::LabelSet;

    fn metadata() -> ModelMetadata {
        let labels = LabelSet::mango();
        let classifier = MangoClassifierConfig::new(labels.len(), MobileNetV2Config::new());
        ModelMetadata::new(labels, 224, classifier, 3, None)
    }

    #[test]
    fn test_save_and_load_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("leaf.tar.gz");
        let binary = vec![1u8, 2, 3, 4, 5];

        save_model_with_metadata(&path, &metadata(), &binary).unwrap();
        assert!(path.exists());

        let (meta, loaded) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded, binary);
        assert_eq!(meta.labels, LabelSet::mango());
        assert_eq!(load_metadata(&path).unwrap().epochs_run, 3);
    }

    #[test]
    fn test_path_without_tar_gz_extension_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mango_disease_model.bin");
        save_model_with_metadata(&path, &metadata(), &[7u8, 8]).unwrap();

        let saved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(saved, vec!["mango_disease_model.bin".to_string()]);

        let (meta, loaded) = load_model_with_metadata(&path).unwrap();
        assert_eq!(loaded, vec![7u8, 8]);
        assert_eq!(meta.epochs_run, 3);
    }

    #[test]
    fn test_missing_archive_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_metadata(&dir.path().join("missing.tar.gz")).is_err());
    }
}
