//! エラー型の定義
//!
//! 推論・評価・学習で共通のエラー分類を提供します。

use thiserror::Error;

/// マンゴー葉分類のエラー
#[derive(Error, Debug)]
pub enum MangoError {
    /// 設定エラー（データディレクトリ不在、モデルファイル不在、ラベル不一致など）
    #[error("Configuration error: {0}")]
    Config(String),

    /// 画像デコードエラー
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// モデルエラー（形状不一致、重み読み込み失敗、推論失敗）
    #[error("Model error: {0}")]
    Model(String),

    /// モデル未ロード状態での予測
    #[error("Model not loaded")]
    NotLoaded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MangoError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, MangoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            MangoError::config("data/train not found").to_string(),
            "Configuration error: data/train not found"
        );
        assert_eq!(MangoError::NotLoaded.to_string(), "Model not loaded");
        assert!(MangoError::decode("truncated").to_string().contains("truncated"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: MangoError = io.into();
        assert!(matches!(err, MangoError::Io(_)));
    }
}
