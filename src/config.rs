//! Relay 配置

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// 防抖写入延迟（毫秒）
pub const DEFAULT_FLUSH_DELAY_MS: u64 = 300;

/// Bridge 重连基础延迟（毫秒）
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 5_000;

/// Bridge 重连延迟上限（毫秒）
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;

/// Relay 配置
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// 数据目录（默认 ~/.ai-inspector）
    pub data_dir: PathBuf,
    /// 空闲超时（秒），无连接持续该时长后退出
    pub idle_timeout_secs: u64,
    /// 持久化防抖延迟（毫秒）
    pub flush_delay_ms: u64,
    /// 每个 Observer 的推送缓冲条数
    pub observer_buffer: usize,
    /// 外部 Bridge（可选）
    pub bridge: Option<BridgeConfig>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ai-inspector");

        Self {
            data_dir,
            idle_timeout_secs: 30,
            flush_delay_ms: DEFAULT_FLUSH_DELAY_MS,
            observer_buffer: 256,
            bridge: None,
        }
    }
}

impl RelayConfig {
    /// 从环境变量覆盖默认值
    ///
    /// - `AI_INSPECTOR_DATA_DIR`
    /// - `AI_INSPECTOR_IDLE_TIMEOUT`（秒）
    /// - `AI_INSPECTOR_FLUSH_DELAY_MS`
    /// - `AI_INSPECTOR_BRIDGE_URL`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("AI_INSPECTOR_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_u64("AI_INSPECTOR_IDLE_TIMEOUT") {
            config.idle_timeout_secs = secs;
        }
        if let Some(ms) = env_u64("AI_INSPECTOR_FLUSH_DELAY_MS") {
            config.flush_delay_ms = ms;
        }
        if let Ok(url) = std::env::var("AI_INSPECTOR_BRIDGE_URL") {
            if !url.trim().is_empty() {
                config.bridge = Some(BridgeConfig::new(url.trim()));
            }
        }

        config
    }

    /// Socket 路径
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("relay.sock")
    }

    /// PID 文件路径
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("relay.pid")
    }

    /// 快照数据库路径
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db").join("session.db")
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    /// 启动前校验
    pub fn validate(&self) -> Result<()> {
        if self.observer_buffer == 0 {
            return Err(Error::Config("observer_buffer 必须大于 0".into()));
        }
        if let Some(bridge) = &self.bridge {
            bridge.validate()?;
        }
        Ok(())
    }
}

/// Bridge 配置
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// WebSocket 地址，例如 ws://127.0.0.1:3712
    pub url: String,
    /// 重连基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 重连延迟上限（毫秒）
    pub max_delay_ms: u64,
    /// 出站缓冲条数
    pub outbound_buffer: usize,
}

impl BridgeConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            base_delay_ms: DEFAULT_RECONNECT_BASE_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_MS,
            outbound_buffer: 256,
        }
    }

    /// 设置重连延迟区间
    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.base_delay_ms = base_ms;
        self.max_delay_ms = max_ms;
        self
    }

    /// 只支持明文 `ws://`，且退避区间必须有效
    pub fn validate(&self) -> Result<()> {
        if !self.url.starts_with("ws://") {
            return Err(Error::Config(format!("不支持的 Bridge 地址: {}", self.url)));
        }
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(format!(
                "无效的重连区间: {}..{}ms",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if self.outbound_buffer == 0 {
            return Err(Error::Config("outbound_buffer 必须大于 0".into()));
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("忽略无效的环境变量 {}={:?}", name, raw);
            None
        }
    }
}
