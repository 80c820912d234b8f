//! 推論HTTPサーバー
//!
//! 起動時に成果物を読み込み、`/predict` `/health` `/model-info` を提供します。
#![recursion_limit = "256"]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use mango_leaf_lib::backend::{cpu_device, effective_device_type, CpuBackend};
#[cfg(feature = "wgpu")]
use mango_leaf_lib::backend::{gpu_device, GpuBackend};
use mango_leaf_lib::logging::{init_logging, LogLevel};
use mango_leaf_lib::model::{AppConfig, DeviceType};
use mango_leaf_lib::server::{router, ServiceContext};

/// Mango Disease Detection API
#[derive(Parser, Debug)]
#[command(name = "mango_leaf")]
#[command(version)]
#[command(about = "HTTP inference service for the mango leaf disease classifier")]
struct Cli {
    /// 設定ファイル
    #[arg(long, env = "MANGO_CONFIG")]
    config: Option<PathBuf>,

    /// モデル成果物（tar.gz）
    #[arg(long, env = "MANGO_MODEL")]
    model: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// CPUバックエンドを使う
    #[arg(long)]
    cpu: bool,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    let mut config = AppConfig::load_or_default(cli.config.unwrap_or_else(AppConfig::default_path));
    if let Some(model) = cli.model {
        config.model.model_path = model.to_string_lossy().into_owned();
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.cpu {
        config.device_type = DeviceType::Cpu;
    }

    let model_path = PathBuf::from(&config.model.model_path);
    info!("Mango Disease Detection API v{}", env!("CARGO_PKG_VERSION"));
    info!("モデル: {}", model_path.display());

    let context = match effective_device_type(&config.device_type) {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => ServiceContext::load::<GpuBackend>(&model_path, &gpu_device()),
        _ => ServiceContext::load::<CpuBackend>(&model_path, &cpu_device()),
    };
    if context.is_loaded() {
        info!("API Ready! モデルを読み込み、予測を受け付けます");
    } else {
        info!("API started: モデル未ロードのため予測はエラーを返します");
    }

    let app = router(context, config.server.max_upload_bytes);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Starting server on http://{}", addr);
    info!("  Health:     http://{}/health", addr);
    info!("  Model Info: http://{}/model-info", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
