//! 推論HTTPサービス
//!
//! 起動時にモデルを1回だけ読み込み、以降は読み取り専用で共有します。
//! 読み込みに失敗してもサービスは起動し、予測要求にはエラーを返します。

pub mod routes;

use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use burn::tensor::backend::Backend;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::ml::inference::{ImageClassifier, InferenceEngine};

/// サービス全体で共有する状態
#[derive(Clone)]
pub struct ServiceContext {
    classifier: Option<Arc<dyn ImageClassifier>>,
    load_error: Option<String>,
}

impl ServiceContext {
    /// 成果物を読み込む（失敗時は未ロード状態）
    pub fn load<B: Backend>(model_path: &Path, device: &B::Device) -> Self {
        match InferenceEngine::<B>::load(model_path, device) {
            Ok(engine) => {
                info!("モデルの読み込みが完了しました。予測を受け付けます");
                Self::with_classifier(Arc::new(engine))
            }
            Err(e) => {
                error!("モデルの読み込みに失敗しました: {:#}", e);
                Self::unloaded(format!("{:#}", e))
            }
        }
    }

    pub fn with_classifier(classifier: Arc<dyn ImageClassifier>) -> Self {
        Self {
            classifier: Some(classifier),
            load_error: None,
        }
    }

    pub fn unloaded(reason: impl Into<String>) -> Self {
        Self {
            classifier: None,
            load_error: Some(reason.into()),
        }
    }

    pub fn classifier(&self) -> Option<&Arc<dyn ImageClassifier>> {
        self.classifier.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }
}

/// ルーターを構築
pub fn router(context: ServiceContext, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .route("/predict", post(routes::predict))
        .route("/model-info", get(routes::model_info))
        .with_state(context)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
