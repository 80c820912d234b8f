//! マンゴー葉の病害分類
//!
//! - `ml`: データ読み込み・拡張、MobileNetV2 転移学習、評価、推論
//! - `model`: 設定、ラベルセット、成果物（tar.gz）の保存・読み込み
//! - `server`: 推論HTTPサービス
//! - `partition`: 元画像の train/val/test 分割

pub mod backend;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod ml;
pub mod ml_commands;
pub mod model;
pub mod partition;
pub mod report;
pub mod server;

pub use error::MangoError;
