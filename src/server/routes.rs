//! エンドポイント
//!
//! 予測の失敗（未ロード・デコード失敗・推論失敗・ファイル欠落）はすべて
//! HTTP 200 と `{success: false, error}` で返します。

use axum::extract::{multipart::MultipartRejection, Multipart, State};
use axum::Json;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::error::MangoError;
use crate::ml::inference::Prediction;
use crate::server::ServiceContext;

/// ラベル順を保つ確率マップ
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedProbabilities(pub Vec<(String, f32)>);

impl Serialize for OrderedProbabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, p) in &self.0 {
            map.serialize_entry(label, p)?;
        }
        map.end()
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PredictResponse {
    Success {
        success: bool,
        disease: String,
        confidence: f32,
        all_predictions: OrderedProbabilities,
    },
    Failure {
        success: bool,
        error: String,
    },
}

impl PredictResponse {
    fn failure(error: impl Into<String>) -> Self {
        PredictResponse::Failure {
            success: false,
            error: error.into(),
        }
    }
}

impl From<Prediction> for PredictResponse {
    fn from(prediction: Prediction) -> Self {
        PredictResponse::Success {
            success: true,
            disease: prediction.label,
            confidence: prediction.confidence,
            all_predictions: OrderedProbabilities(prediction.probabilities),
        }
    }
}

/// アップロードから `file` フィールドを取り出す
async fn read_upload(mut multipart: Multipart) -> Result<(String, Vec<u8>), String> {
    while let Some(field) = multipart.next_field().await.map_err(|e| e.to_string())? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await.map_err(|e| e.to_string())?;
        return Ok((file_name, bytes.to_vec()));
    }
    Err("No file uploaded: expected multipart field 'file'".to_string())
}

/// POST /predict
pub async fn predict(
    State(context): State<ServiceContext>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Json<PredictResponse> {
    let Some(classifier) = context.classifier().cloned() else {
        return Json(PredictResponse::failure(format!(
            "{}. Please check server logs.",
            MangoError::NotLoaded
        )));
    };

    let multipart = match multipart {
        Ok(multipart) => multipart,
        Err(rejection) => return Json(PredictResponse::failure(rejection.body_text())),
    };

    let (file_name, bytes) = match read_upload(multipart).await {
        Ok(upload) => upload,
        Err(e) => {
            warn!("アップロードの読み取りに失敗: {}", e);
            return Json(PredictResponse::failure(e));
        }
    };
    info!("画像を受信: {} ({} bytes)", file_name, bytes.len());

    if bytes.is_empty() {
        return Json(PredictResponse::failure(
            MangoError::decode("uploaded file is empty").to_string(),
        ));
    }

    let result = tokio::task::spawn_blocking(move || classifier.classify(&bytes)).await;
    match result {
        Ok(Ok(prediction)) => {
            info!("予測: {} ({:.2}%)", prediction.label, prediction.confidence * 100.0);
            Json(PredictResponse::from(prediction))
        }
        Ok(Err(e)) => {
            warn!("予測エラー: {}", e);
            Json(PredictResponse::failure(e.to_string()))
        }
        Err(e) => {
            warn!("予測タスクが異常終了: {}", e);
            Json(PredictResponse::failure(
                MangoError::model(format!("prediction task failed: {}", e)).to_string(),
            ))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub timestamp: String,
}

/// GET /health
pub async fn health(State(context): State<ServiceContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model_loaded: context.is_loaded(),
        timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
    })
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ModelInfoResponse {
    Loaded {
        model_loaded: bool,
        input_shape: [Option<usize>; 4],
        output_shape: [Option<usize>; 2],
        num_classes: usize,
        classes: Vec<String>,
    },
    Unloaded {
        error: String,
    },
}

/// GET /model-info
pub async fn model_info(State(context): State<ServiceContext>) -> Json<ModelInfoResponse> {
    let Some(classifier) = context.classifier() else {
        return Json(ModelInfoResponse::Unloaded {
            error: MangoError::NotLoaded.to_string(),
        });
    };

    Json(ModelInfoResponse::Loaded {
        model_loaded: true,
        input_shape: classifier.input_shape(),
        output_shape: classifier.output_shape(),
        num_classes: classifier.labels().len(),
        classes: classifier.labels().names().to_vec(),
    })
}

#[derive(Debug, Serialize)]
pub struct Endpoints {
    pub health: &'static str,
    pub predict: &'static str,
    pub model_info: &'static str,
}

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub model_loaded: bool,
    pub endpoints: Endpoints,
}

/// GET /
pub async fn root(State(context): State<ServiceContext>) -> Json<RootResponse> {
    Json(RootResponse {
        status: "OK",
        message: "Mango Disease Detection API",
        model_loaded: context.is_loaded(),
        endpoints: Endpoints {
            health: "/health",
            predict: "/predict (POST)",
            model_info: "/model-info",
        },
    })
}
