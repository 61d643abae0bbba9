//! Relay 服务器
//!
//! Unix Socket 服务，处理 Producer / Observer 连接。
//! 无连接持续 `idle_timeout_secs` 后退出（模拟宿主回收后台进程），退出前强制写入快照。

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::interval;

use super::coordinator::Relay;
use super::pages::PageLinks;
use super::router::{ConnId, MessageSender, Router};
use crate::config::RelayConfig;
use crate::protocol::{self, ConnRole, ObserverRequest, ProducerMessage, Request, Response};
use crate::storage::{SnapshotStorage, SqliteSnapshotStorage};
use crate::store::EventStore;

#[cfg(feature = "bridge")]
use crate::bridge::BridgeConnection;

/// Relay 版本号（跟随 crate 版本）
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Relay 服务
pub struct RelayServer {
    config: RelayConfig,
    relay: Arc<Relay>,
    #[cfg(feature = "bridge")]
    bridge: Option<Arc<BridgeConnection>>,
    next_conn_id: AtomicU64,
    connections: AtomicUsize,
    shutdown: AtomicBool,
}

impl RelayServer {
    /// 创建服务，使用数据目录下的 SQLite 快照
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate().context("配置无效")?;
        fs::create_dir_all(&config.data_dir).context("创建数据目录失败")?;

        let storage = SqliteSnapshotStorage::open(&config.db_path()).context("打开快照数据库失败")?;
        Ok(Self::with_storage(config, Arc::new(storage)))
    }

    /// 使用指定的快照存储创建服务
    ///
    /// 必须在 tokio 运行时内调用（存储会立即开始 hydrate）。
    pub fn with_storage(config: RelayConfig, storage: Arc<dyn SnapshotStorage>) -> Self {
        let store = EventStore::open(storage, config.flush_delay());
        let relay = Relay::new(store, Router::new(), Arc::new(PageLinks::new()));

        #[cfg(feature = "bridge")]
        let (relay, bridge) = match config.bridge.clone() {
            Some(bridge_config) => {
                let (bridge, mut calls) = BridgeConnection::new(bridge_config);
                let relay = Arc::new(relay.with_bridge(bridge.clone()));

                let relay_for_calls = relay.clone();
                tokio::spawn(async move {
                    while let Some(call) = calls.recv().await {
                        relay_for_calls.handle_bridge_call(call);
                    }
                });
                (relay, Some(bridge))
            }
            None => (Arc::new(relay), None),
        };

        #[cfg(not(feature = "bridge"))]
        let relay = Arc::new(relay);

        Self {
            config,
            relay,
            #[cfg(feature = "bridge")]
            bridge,
            next_conn_id: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// 运行服务直到空闲超时或收到中断信号
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.write_pid_file()?;

        // 清理旧的 socket 文件
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).context("绑定 socket 失败")?;
        fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;

        tracing::info!("🚀 Relay 启动: {:?}", socket_path);

        #[cfg(feature = "bridge")]
        if let Some(bridge) = &self.bridge {
            bridge.connect_configured();
        }

        let server_for_idle = self.clone();
        let idle_handle = tokio::spawn(async move {
            server_for_idle.idle_checker().await;
        });

        let mut shutdown_poll = interval(Duration::from_millis(500));

        loop {
            // 只有当 shutdown 信号发出 且 没有活跃连接 时才退出
            if self.shutdown.load(Ordering::Relaxed) && self.connection_count() == 0 {
                break;
            }

            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    tracing::warn!("处理连接失败: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("接受连接失败: {}", e);
                        }
                    }
                }
                _ = shutdown_poll.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("收到中断信号，准备退出...");
                    break;
                }
            }
        }

        idle_handle.abort();
        self.cleanup().await;
        Ok(())
    }

    /// 处理单个连接
    async fn handle_connection(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let conn_id: ConnId = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("📥 新连接: conn_id={}", conn_id);

        // 所有出站消息（响应、推送、页面指令）经同一通道串行写出
        let (tx, mut rx) = mpsc::channel::<String>(self.config.observer_buffer.max(1));
        let write_handle = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.write_all(msg.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        let result = self.read_loop(conn_id, &tx, &mut reader).await;

        // 清理
        self.relay.router().unregister(conn_id);
        self.relay.pages().unlink_conn(conn_id);
        self.connections.fetch_sub(1, Ordering::Relaxed);
        drop(tx);
        // 让已排队的消息写完
        if tokio::time::timeout(Duration::from_secs(1), write_handle).await.is_err() {
            tracing::debug!("写出超时，丢弃剩余消息: conn_id={}", conn_id);
        }
        tracing::debug!("📤 连接关闭: conn_id={}", conn_id);

        result
    }

    async fn read_loop(
        &self,
        conn_id: ConnId,
        tx: &MessageSender,
        reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    ) -> Result<()> {
        let mut role: Option<ConnRole> = None;
        let mut evicted: Option<Arc<Notify>> = None;
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => read?,
                _ = wait_evicted(evicted.as_deref()) => {
                    // 推送已有缺口，关闭连接让 Observer 重连后重新 GET_STATE
                    tracing::info!("📡 Observer 被移除，关闭连接: conn_id={}", conn_id);
                    return Ok(());
                }
            };
            if read == 0 {
                return Ok(());
            }
            // 非 UTF-8 的行只丢弃该行，连接继续
            let text = match std::str::from_utf8(&buf) {
                Ok(text) => text.trim(),
                Err(e) => {
                    tracing::debug!("忽略非 UTF-8 消息: conn_id={}, {}", conn_id, e);
                    continue;
                }
            };
            if text.is_empty() {
                continue;
            }

            // 控制请求（握手 / 心跳 / 状态）
            if let Ok(request) = serde_json::from_str::<Request>(text) {
                let response = self.handle_control(conn_id, tx, &mut role, &mut evicted, request);
                if tx.send(protocol::to_line(&response)?).await.is_err() {
                    return Ok(());
                }
                continue;
            }

            match role {
                Some(ConnRole::Producer) => match serde_json::from_str::<ProducerMessage>(text) {
                    Ok(message) => {
                        if message.is_ours() {
                            if let Some(target) = message.tab_id {
                                self.relay.pages().link(target, conn_id, tx);
                            }
                        }
                        self.relay.handle_producer(message);
                    }
                    Err(e) => tracing::debug!("忽略无法解析的生产者消息: {}", e),
                },
                Some(ConnRole::Observer) => match serde_json::from_str::<ObserverRequest>(text) {
                    Ok(request) => {
                        if let Some(reply) = self.relay.handle_request(conn_id, request).await {
                            self.relay.router().send_to(conn_id, &reply);
                        }
                    }
                    Err(e) => tracing::debug!("忽略无法解析的 Observer 请求: {}", e),
                },
                None => tracing::debug!("握手前的消息被忽略: conn_id={}", conn_id),
            }
        }
    }

    fn handle_control(
        &self,
        conn_id: ConnId,
        tx: &MessageSender,
        role: &mut Option<ConnRole>,
        evicted: &mut Option<Arc<Notify>>,
        request: Request,
    ) -> Response {
        match request {
            Request::Handshake { component, role: requested } => {
                if role.is_some() {
                    return Response::Error {
                        code: 409,
                        message: "already handshaken".to_string(),
                    };
                }
                tracing::info!(
                    "🤝 握手: conn_id={}, component={}, role={:?}",
                    conn_id,
                    component,
                    requested
                );
                if requested == ConnRole::Observer {
                    *evicted = Some(self.relay.router().register(conn_id, tx.clone()));
                }
                *role = Some(requested);
                Response::HandshakeOk {
                    relay_version: RELAY_VERSION.to_string(),
                }
            }

            Request::Heartbeat => Response::Ok,

            Request::Status => {
                let store = self.relay.store();
                let status = serde_json::json!({
                    "relay_version": RELAY_VERSION,
                    "connections": self.connection_count(),
                    "observers": self.relay.router().observer_count(),
                    "targets": store.targets(),
                    "hydrated": store.is_ready(),
                    "bridge_connected": self.bridge_connected(),
                });
                Response::QueryResult { data: status }
            }
        }
    }

    #[cfg(feature = "bridge")]
    fn bridge_connected(&self) -> bool {
        self.bridge.as_ref().is_some_and(|b| b.is_connected())
    }

    #[cfg(not(feature = "bridge"))]
    fn bridge_connected(&self) -> bool {
        false
    }

    /// 空闲检测：无连接累计 `idle_timeout_secs` 秒后请求退出，期间有新连接则撤销
    async fn idle_checker(&self) {
        let mut tick = interval(Duration::from_secs(1));
        let mut idle_for = 0u64;

        loop {
            tick.tick().await;

            if self.connection_count() == 0 {
                idle_for += 1;
                let due = idle_for >= self.config.idle_timeout_secs;
                if due && !self.shutdown.swap(true, Ordering::Relaxed) {
                    tracing::info!("⏰ 空闲 {}s，准备退出", idle_for);
                }
                continue;
            }

            idle_for = 0;
            if self.shutdown.swap(false, Ordering::Relaxed) {
                tracing::info!("🔄 有新连接，取消退出");
            }
        }
    }

    /// 写入 PID 文件
    fn write_pid_file(&self) -> Result<()> {
        let pid = std::process::id();
        let pid_path = self.config.pid_path();
        fs::write(&pid_path, pid.to_string())?;
        fs::set_permissions(&pid_path, fs::Permissions::from_mode(0o600))?;
        tracing::debug!("📝 写入 PID 文件: {} (pid={})", pid_path.display(), pid);
        Ok(())
    }

    /// 退出前：强制写入快照，断开 Bridge，删除 socket / PID 文件
    async fn cleanup(&self) {
        self.relay.store().flush_now().await;

        #[cfg(feature = "bridge")]
        if let Some(bridge) = &self.bridge {
            bridge.disconnect();
        }

        if let Err(e) = cleanup_stale_relay(&self.config) {
            tracing::warn!("清理运行时文件失败: {}", e);
        }
        tracing::info!("🧹 Relay 已停止");
    }
}

async fn wait_evicted(evicted: Option<&Notify>) {
    match evicted {
        Some(evicted) => evicted.notified().await,
        None => std::future::pending().await,
    }
}

/// PID 文件指向的进程是否仍存活
pub fn is_relay_running(config: &RelayConfig) -> bool {
    let pid = fs::read_to_string(config.pid_path())
        .ok()
        .and_then(|raw| raw.trim().parse::<i32>().ok());

    match pid {
        // signal 0 只做存在性检查
        Some(pid) => unsafe { libc::kill(pid, 0) == 0 },
        None => false,
    }
}

/// 删除上一个进程遗留的 socket / PID 文件
pub fn cleanup_stale_relay(config: &RelayConfig) -> Result<()> {
    for path in [config.socket_path(), config.pid_path()] {
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("删除 {:?} 失败", path))?;
            tracing::debug!("🧹 删除残留文件: {:?}", path);
        }
    }
    Ok(())
}
