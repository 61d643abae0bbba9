//! 页面回传通道
//!
//! 记录每个目标最近一次发送事件的 Producer 连接，用于把 EXECUTE_TOOL 送回页面。

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc::error::TrySendError;

use super::router::{ConnId, MessageSender};
use crate::protocol::{self, PageCommand};
use crate::types::TargetId;

#[derive(Default)]
pub struct PageLinks {
    links: RwLock<HashMap<TargetId, (ConnId, MessageSender)>>,
}

impl PageLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录目标对应的 Producer 连接（后到者覆盖）
    pub fn link(&self, target: TargetId, conn_id: ConnId, sender: &MessageSender) {
        let mut links = self.links.write();
        let stale = links
            .get(&target)
            .map_or(true, |(linked, _)| *linked != conn_id);
        if stale {
            links.insert(target, (conn_id, sender.clone()));
            tracing::debug!("🔗 Page linked: tab_id={}, conn_id={}", target, conn_id);
        }
    }

    /// 移除某连接的所有目标
    pub fn unlink_conn(&self, conn_id: ConnId) {
        self.links.write().retain(|_, (linked, _)| *linked != conn_id);
    }

    pub fn is_linked(&self, target: TargetId) -> bool {
        self.links.read().contains_key(&target)
    }

    /// 发送页面指令，返回是否投递成功（fire-and-forget）
    pub fn send(&self, command: &PageCommand) -> bool {
        let target = match command {
            PageCommand::ExecuteTool { tab_id, .. } => *tab_id,
        };

        let sender = match self.links.read().get(&target) {
            Some((_, sender)) => sender.clone(),
            None => {
                tracing::warn!("🔗 No page connected for tab_id={}", target);
                return false;
            }
        };

        let line = match protocol::to_line(command) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Failed to serialize page command: {}", e);
                return false;
            }
        };

        match sender.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("🔗 Page channel full, dropping command: tab_id={}", target);
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("🔗 Page channel closed: tab_id={}", target);
                self.links.write().remove(&target);
                false
            }
        }
    }
}
