//! 外部 WebSocket Bridge
//!
//! 状态机：`Disconnected -> Connecting -> Connected -> Disconnected (...)`。
//! 连接关闭或出错后按指数退避重连（基础延迟翻倍，封顶），成功连接后退避复位。
//! 未连接时 `send` 直接丢弃，不缓冲也不在重连后重放。
//! `disconnect` 取消重连并进入终止态。

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::BridgeConfig;
use crate::protocol::{BridgeInbound, BridgeOutbound};
use crate::types::TargetId;

/// 连续失败达到该次数后降为 debug 日志
const QUIET_AFTER_FAILURES: u32 = 10;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
}

/// 外部请求的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeCall {
    pub tab_id: TargetId,
    pub name: String,
    pub input_arguments: Value,
}

/// 重连延迟：`min(base * 2^attempt, cap)`
pub fn next_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// 指数退避计数器
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            attempt: 0,
            base,
            cap,
        }
    }

    /// 取下一次延迟并递增计数
    pub fn next_delay(&mut self) -> Duration {
        let delay = next_delay(self.attempt, self.base, self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// 连接成功后复位
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// 解析入站消息，格式错误或未知类型返回 None
pub fn parse_bridge_message(text: &str) -> Option<BridgeInbound> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            tracing::trace!("🌉 Dropping malformed bridge payload");
            return None;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("CALL_TOOL") => serde_json::from_value(value).ok(),
        Some(other) => {
            tracing::debug!("🌉 Ignoring unknown bridge message type: {}", other);
            None
        }
        None => None,
    }
}

struct BridgeShared {
    config: BridgeConfig,
    state: watch::Sender<BridgeState>,
    /// 仅在 Connected 期间存在
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    calls: mpsc::Sender<BridgeCall>,
}

/// WebSocket Bridge 连接
pub struct BridgeConnection {
    shared: Arc<BridgeShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeConnection {
    /// 创建连接（尚未连接），同时返回外部工具调用的接收端
    pub fn new(config: BridgeConfig) -> (Arc<Self>, mpsc::Receiver<BridgeCall>) {
        let (state, _) = watch::channel(BridgeState::Disconnected);
        let (calls_tx, calls_rx) = mpsc::channel(64);

        let bridge = Arc::new(Self {
            shared: Arc::new(BridgeShared {
                config,
                state,
                outbound: Mutex::new(None),
                calls: calls_tx,
            }),
            task: Mutex::new(None),
        });
        (bridge, calls_rx)
    }

    /// 开始连接并在断开后自动重连
    ///
    /// 每次调用都会开始新的连接循环并替换旧循环；调用方负责避免并发调用。
    pub fn connect(&self, url: &str) {
        let shared = self.shared.clone();
        let url = url.to_string();
        let handle = tokio::spawn(async move {
            shared.run(url).await;
        });

        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }
    }

    /// 使用配置中的地址连接
    pub fn connect_configured(&self) {
        let url = self.shared.config.url.clone();
        self.connect(&url);
    }

    /// 发送消息，未连接时静默丢弃，返回是否已入队
    pub fn send(&self, message: &BridgeOutbound) -> bool {
        if self.state() != BridgeState::Connected {
            return false;
        }

        let sender = match self.shared.outbound.lock().clone() {
            Some(sender) => sender,
            None => return false,
        };

        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize bridge message: {}", e);
                return false;
            }
        };

        match sender.try_send(json) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("🌉 Dropping outbound message: {}", e);
                false
            }
        }
    }

    /// 断开并停止重连（终止态）
    pub fn disconnect(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        self.shared.outbound.lock().take();
        self.shared.set_state(BridgeState::Disconnected);
        tracing::info!("🌉 Bridge disconnected");
    }

    pub fn state(&self) -> BridgeState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == BridgeState::Connected
    }

    /// 订阅状态变化（连接指示器的数据源）
    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.shared.state.subscribe()
    }
}

impl Drop for BridgeConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

impl BridgeShared {
    fn set_state(&self, state: BridgeState) {
        self.state.send_replace(state);
    }

    async fn run(&self, url: String) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.base_delay_ms),
            Duration::from_millis(self.config.max_delay_ms),
        );
        let mut failures: u32 = 0;

        loop {
            self.set_state(BridgeState::Connecting);

            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _response)) => {
                    tracing::info!("🌉 Connected to bridge server: {}", url);
                    backoff.reset();
                    failures = 0;
                    self.session(ws).await;
                    tracing::info!("🌉 Bridge connection closed, reconnecting...");
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if failures >= QUIET_AFTER_FAILURES {
                        tracing::debug!(failures, "🌉 Bridge connect failed: {}", e);
                    } else {
                        tracing::warn!("🌉 Bridge connect failed: {}", e);
                    }
                }
            }

            self.set_state(BridgeState::Disconnected);

            let delay = backoff.next_delay();
            tracing::debug!(
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "🌉 Scheduling bridge reconnect"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// 单次连接：收发消息直到关闭或出错
    async fn session<S>(&self, ws: tokio_tungstenite::WebSocketStream<S>)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.config.outbound_buffer.max(1));

        *self.outbound.lock() = Some(out_tx);
        self.set_state(BridgeState::Connected);

        loop {
            tokio::select! {
                Some(text) = out_rx.recv() => {
                    if let Err(e) = write.send(Message::text(text)).await {
                        tracing::warn!("🌉 Bridge send failed: {}", e);
                        break;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        // 出错视为关闭的前兆：主动关闭，由外层循环负责重连
                        tracing::warn!("🌉 Bridge error: {}", e);
                        break;
                    }
                },
            }
        }

        self.outbound.lock().take();
        let _ = write.close().await;
    }

    fn handle_inbound(&self, text: &str) {
        let Some(message) = parse_bridge_message(text) else {
            return;
        };

        match message {
            BridgeInbound::CallTool {
                tab_id: Some(tab_id),
                name: Some(name),
                input_arguments,
            } => {
                tracing::debug!("🌉 CALL_TOOL: tab_id={}, name={}", tab_id, name);
                let call = BridgeCall {
                    tab_id,
                    name,
                    input_arguments,
                };
                if let Err(e) = self.calls.try_send(call) {
                    tracing::warn!("🌉 Dropping CALL_TOOL: {}", e);
                }
            }
            BridgeInbound::CallTool { .. } => {
                tracing::debug!("🌉 CALL_TOOL without tabId/name, ignored");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_next_delay_doubles_to_cap() {
        let base = Duration::from_secs(5);
        let cap = Duration::from_secs(60);

        let delays: Vec<u64> = (0..8).map(|a| next_delay(a, base, cap).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60, 60]);
        assert_eq!(next_delay(200, base, cap), cap);
    }

    #[test]
    fn test_backoff_monotonic_and_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1_000));

        let mut last = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            assert!(delay <= Duration::from_millis(1_000));
            last = delay;
        }
        assert_eq!(last, Duration::from_millis(1_000));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_parse_call_tool() {
        let msg = parse_bridge_message(
            r#"{"type":"CALL_TOOL","tabId":4,"name":"search","inputArguments":{"q":"x"}}"#,
        );
        assert_eq!(
            msg,
            Some(BridgeInbound::CallTool {
                tab_id: Some(4),
                name: Some("search".to_string()),
                input_arguments: json!({"q": "x"}),
            })
        );
    }

    #[test]
    fn test_parse_ignores_noise() {
        assert_eq!(parse_bridge_message("{not json"), None);
        assert_eq!(parse_bridge_message(r#"{"type":"PING"}"#), None);
        assert_eq!(parse_bridge_message(r#"{"no_type":true}"#), None);
        assert_eq!(parse_bridge_message(r#"[1,2,3]"#), None);
    }

    #[tokio::test]
    async fn test_send_dropped_when_disconnected() {
        let (bridge, _calls) = BridgeConnection::new(BridgeConfig::new("ws://127.0.0.1:1"));
        assert_eq!(bridge.state(), BridgeState::Disconnected);

        let sent = bridge.send(&BridgeOutbound::ToolsUpdate {
            tab_id: 1,
            tools: vec![],
        });
        assert!(!sent);
    }
}
