//! ログ初期化

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// ログレベル（CLI指定用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// tracingのサブスクライバを初期化
///
/// 2回目以降の呼び出しはエラーを返します（既に登録済みのため）。
pub fn init_logging(level: LogLevel) -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::from(level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("ログの初期化に失敗しました: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }
}
