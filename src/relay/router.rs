//! 订阅者路由
//!
//! 维护 Observer 连接及其绑定的目标，将消息推送给关心该目标的 Observer。
//! 未绑定的 Observer 视为通配接收者，避免连接建立到 GET_STATE 之间的事件丢失。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::protocol::{self, ObserverMessage};
use crate::types::TargetId;

/// 连接 ID
pub type ConnId = u64;

/// 消息发送通道（每条消息为一行 JSONL）
pub type MessageSender = mpsc::Sender<String>;

struct Observer {
    sender: MessageSender,
    /// 绑定后不可变
    target: Option<TargetId>,
    /// 因投递失败被移除时触发，连接据此关闭
    evicted: Arc<Notify>,
}

/// 订阅者路由
pub struct Router {
    observers: RwLock<HashMap<ConnId, Observer>>,
}

impl Router {
    /// 创建新的路由
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 注册 Observer（未绑定），返回其被移除时的通知
    pub fn register(&self, conn_id: ConnId, sender: MessageSender) -> Arc<Notify> {
        let evicted = Arc::new(Notify::new());
        self.observers.write().insert(
            conn_id,
            Observer {
                sender,
                target: None,
                evicted: evicted.clone(),
            },
        );
        tracing::debug!("📡 Observer registered: conn_id={}", conn_id);
        evicted
    }

    /// 绑定 Observer 到目标
    ///
    /// 前置条件：同一连接只能绑定一个目标。以相同目标重复调用无副作用；
    /// 以不同目标调用时保留首次绑定。
    pub fn bind(&self, conn_id: ConnId, target: TargetId) {
        let mut observers = self.observers.write();
        let Some(observer) = observers.get_mut(&conn_id) else {
            return;
        };

        match observer.target {
            None => {
                observer.target = Some(target);
                tracing::debug!("📡 Observer bound: conn_id={}, tab_id={}", conn_id, target);
            }
            Some(bound) if bound != target => {
                tracing::debug!(
                    "📡 Ignoring rebind: conn_id={}, bound={}, requested={}",
                    conn_id,
                    bound,
                    target
                );
            }
            Some(_) => {}
        }
    }

    /// 注销 Observer（可重复调用）
    pub fn unregister(&self, conn_id: ConnId) {
        if self.observers.write().remove(&conn_id).is_some() {
            tracing::debug!("📡 Observer unregistered: conn_id={}", conn_id);
        }
    }

    fn evict(&self, conn_id: ConnId) {
        if let Some(observer) = self.observers.write().remove(&conn_id) {
            observer.evicted.notify_one();
        }
    }

    /// 获取 Observer 绑定的目标
    pub fn target_of(&self, conn_id: ConnId) -> Option<TargetId> {
        self.observers.read().get(&conn_id).and_then(|o| o.target)
    }

    /// 推送给绑定到 `target` 的 Observer 以及所有未绑定的 Observer（非阻塞）
    ///
    /// 投递失败（通道已满或已关闭）的 Observer 视为断开并被移除，不影响其他 Observer。
    /// 被移除的 Observer 需要重新连接并 GET_STATE 以获得完整状态。
    pub fn notify(&self, target: TargetId, message: &ObserverMessage) {
        let line = match protocol::to_line(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize observer message: {}", e);
                return;
            }
        };

        let recipients: Vec<(ConnId, MessageSender)> = {
            let observers = self.observers.read();
            observers
                .iter()
                .filter(|(_, o)| o.target.map_or(true, |t| t == target))
                .map(|(conn_id, o)| (*conn_id, o.sender.clone()))
                .collect()
        };

        if recipients.is_empty() {
            tracing::trace!("📡 No observers: tab_id={}", target);
            return;
        }

        let mut gone = Vec::new();
        for (conn_id, sender) in recipients {
            match sender.try_send(line.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("📡 Channel full, removing observer: conn_id={}", conn_id);
                    gone.push(conn_id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!("📡 Channel closed, removing observer: conn_id={}", conn_id);
                    gone.push(conn_id);
                }
            }
        }

        if !gone.is_empty() {
            let mut observers = self.observers.write();
            for conn_id in gone {
                if let Some(observer) = observers.remove(&conn_id) {
                    observer.evicted.notify_one();
                }
            }
        }
    }

    /// 直接回复单个 Observer，返回是否投递成功
    pub fn send_to(&self, conn_id: ConnId, message: &ObserverMessage) -> bool {
        let sender = match self.observers.read().get(&conn_id) {
            Some(o) => o.sender.clone(),
            None => return false,
        };

        let line = match protocol::to_line(message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize observer message: {}", e);
                return false;
            }
        };

        match sender.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("📡 Channel full, removing observer: conn_id={}", conn_id);
                self.evict(conn_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.evict(conn_id);
                false
            }
        }
    }

    /// 当前 Observer 数
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// 绑定到某目标的 Observer 数
    pub fn bound_count(&self, target: TargetId) -> usize {
        self.observers
            .read()
            .values()
            .filter(|o| o.target == Some(target))
            .count()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
        }
    }
}
