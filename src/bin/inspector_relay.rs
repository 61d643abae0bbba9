//! inspector-relay - AI 检查器事件中继进程
//!
//! 负责：
//! - 接收页面侧事件并持久化
//! - 推送给检查器 Observer
//! - 可选的外部 Bridge

use std::sync::Arc;

use ai_inspector_relay::relay::{cleanup_stale_relay, is_relay_running, RelayServer};
use ai_inspector_relay::RelayConfig;
use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ai_inspector_relay=debug".parse()?))
        .init();

    tracing::info!("🚀 inspector-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env();

    // 检查是否已有 Relay 运行
    if is_relay_running(&config) {
        tracing::error!("❌ Relay is already running, exiting");
        std::process::exit(1);
    }

    // 清理残留状态
    if let Err(e) = cleanup_stale_relay(&config) {
        tracing::warn!("Failed to cleanup stale state: {}", e);
    }

    let server = Arc::new(RelayServer::new(config)?);
    server.run().await?;

    tracing::info!("👋 inspector-relay exiting");
    Ok(())
}
