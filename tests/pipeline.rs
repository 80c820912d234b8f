//! 分割 → 学習 → 保存 → 評価 → 推論 の結合テスト（CPU、小さいモデル）
#![recursion_limit = "256"]

use std::path::Path;

use mango_leaf_lib::backend::{cpu_device, CpuBackend, CpuTrainingBackend};
use mango_leaf_lib::ml::inference::{ImageClassifier, InferenceEngine};
use mango_leaf_lib::ml::training::{train_model, TrainingHistory, TrainingPhase};
use mango_leaf_lib::ml_commands::{run_evaluation, run_split, run_training, HISTORY_CSV, HISTORY_SVG};
use mango_leaf_lib::model::{AppConfig, LabelSet};
use mango_leaf_lib::partition::PartitionConfig;
use mango_leaf_lib::MangoError;

const CLASSES: [(&str, [u8; 3]); 2] = [("Die Back", [120, 70, 20]), ("Healthy", [20, 160, 40])];

fn write_image(path: &Path, color: [u8; 3], variant: u8) {
    let img = image::RgbImage::from_fn(40, 40, |x, y| {
        let shade = ((x + y) as u8 % 8).wrapping_add(variant);
        image::Rgb([
            color[0].saturating_add(shade),
            color[1].saturating_add(shade),
            color[2].saturating_add(shade),
        ])
    });
    img.save(path).unwrap();
}

/// raw/<class>/*.png を作成
fn write_raw_dataset(root: &Path, per_class: usize) {
    for (name, color) in CLASSES {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            write_image(&dir.join(format!("leaf_{:02}.png", i)), color, i as u8);
        }
    }
}

fn tiny_config(data_dir: &Path, model_path: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.labels = LabelSet::new(CLASSES.iter().map(|(n, _)| n.to_string()).collect()).unwrap();
    config.data.data_dir = data_dir.to_string_lossy().into_owned();
    config.data.image_size = 32;
    config.data.batch_size = 4;
    config.model.model_path = model_path.to_string_lossy().into_owned();
    config.model.width_multiplier = 0.25;
    config.model.hidden_units = 8;
    config.training.feature_extraction_epochs = 1;
    config.training.fine_tune_epochs = 1;
    config
}

#[test]
fn split_train_evaluate_and_predict() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raw");
    let processed = dir.path().join("processed");
    write_raw_dataset(&raw, 20);

    let split = run_split(&raw, &processed, &PartitionConfig::default()).unwrap();
    assert_eq!(split.totals.total(), 40);

    let model_path = dir.path().join("models").join("model.tar.gz");
    let config = tiny_config(&processed, &model_path);
    let device = cpu_device();

    let mut seen = Vec::new();
    let summary = run_training::<CpuTrainingBackend>(&config, &device, |record| {
        seen.push((record.epoch, record.phase))
    })
    .unwrap();

    assert_eq!(
        seen,
        vec![(1, TrainingPhase::FeatureExtraction), (2, TrainingPhase::FineTuning)]
    );
    assert!(model_path.exists());
    assert_eq!(summary.history.len(), 2);
    assert_eq!(summary.history.fine_tune_start(), Some(2));

    let models_dir = model_path.parent().unwrap();
    assert_eq!(summary.history_csv, models_dir.join(HISTORY_CSV));
    assert!(summary.history_svg.ends_with(HISTORY_SVG));
    let reloaded = TrainingHistory::read_csv(&summary.history_csv).unwrap();
    assert_eq!(reloaded.len(), 2);

    let test_report = summary.test_report.unwrap();
    assert_eq!(test_report.total, 6);
    assert!(test_report.correct <= test_report.total);

    let engine = InferenceEngine::<CpuBackend>::load(&model_path, &device).unwrap();
    assert_eq!(engine.labels(), &config.labels);
    assert_eq!(engine.image_size(), 32);
    assert_eq!(engine.metadata().epochs_run, 2);

    let test_image = processed.join("test").join("Healthy");
    let first_image = std::fs::read_dir(&test_image).unwrap().next().unwrap().unwrap().path();
    let prediction = engine.predict_path(&first_image).unwrap();
    assert!(config.labels.index_of(&prediction.label).is_some());

    let output = dir.path().join("eval");
    let evaluation = run_evaluation::<CpuBackend>(&config, &device, &output, 4).unwrap();
    assert_eq!(evaluation.report.total, 6);
    assert_eq!(evaluation.samples.len(), 4);
    assert!(evaluation.confusion_matrix_svg.exists());
}

#[test]
fn evaluation_rejects_different_label_order() {
    let dir = tempfile::tempdir().unwrap();
    let raw = dir.path().join("raw");
    let processed = dir.path().join("processed");
    write_raw_dataset(&raw, 10);
    run_split(&raw, &processed, &PartitionConfig::default()).unwrap();

    let model_path = dir.path().join("model.tar.gz");
    let mut config = tiny_config(&processed, &model_path);
    config.training.fine_tune_epochs = 0;
    let device = cpu_device();
    run_training::<CpuTrainingBackend>(&config, &device, |_| {}).unwrap();

    config.labels = LabelSet::new(vec!["Healthy".to_string(), "Die Back".to_string()]).unwrap();
    let err = match run_evaluation::<CpuBackend>(&config, &device, dir.path(), 2) {
        Err(e) => e,
        Ok(_) => panic!("evaluation should reject a reordered label set"),
    };
    assert!(matches!(err.downcast_ref::<MangoError>(), Some(MangoError::Config(_))));
}

#[test]
fn missing_data_root_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = tiny_config(&dir.path().join("nowhere"), &dir.path().join("m.tar.gz"));

    let err = match train_model::<CpuTrainingBackend>(&config, &cpu_device(), |_| {}) {
        Err(e) => e,
        Ok(_) => panic!("training should fail without data"),
    };
    assert!(matches!(err.downcast_ref::<MangoError>(), Some(MangoError::Config(_))));
}

#[test]
fn missing_class_directory_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let processed = dir.path().join("processed");
    for split in ["train", "val"] {
        let class_dir = processed.join(split).join("Healthy");
        std::fs::create_dir_all(&class_dir).unwrap();
        write_image(&class_dir.join("a.png"), [0, 200, 0], 0);
    }

    let config = tiny_config(&processed, &dir.path().join("m.tar.gz"));
    let err = match train_model::<CpuTrainingBackend>(&config, &cpu_device(), |_| {}) {
        Err(e) => e,
        Ok(_) => panic!("training should fail with a missing class directory"),
    };
    assert!(err.to_string().contains("Die Back"));
}
