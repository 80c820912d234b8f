pub mod augmentation;
pub mod backbone;
pub mod dataset;
pub mod evaluation;
pub mod inference;
pub mod ml_model;
pub mod schedule;
pub mod training;

pub use backbone::{MobileNetV2, MobileNetV2Config};
pub use dataset::{eval_loader, train_loader, LeafBatch, LeafBatcher, LeafDataset, LeafItem};
pub use evaluation::{evaluate_dataset, AccuracyGrade, EvaluationReport, EvaluationRun};
pub use inference::{ImageClassifier, InferenceEngine, Prediction};
pub use ml_model::{load_image_chw, preprocess_bytes, MangoClassifier, MangoClassifierConfig, IMAGE_SIZE};
pub use training::{save_trained_model, train_model, EpochRecord, TrainingHistory, TrainingPhase};
