//! 通信协议定义
//!
//! Relay Socket：Unix Socket + JSONL（每条消息一行 JSON + '\n'）。
//! 连接先发送 `Handshake` 声明角色，之后：
//! - producer 连接发送 [`ProducerMessage`]，接收 [`PageCommand`]
//! - observer 连接发送 [`ObserverRequest`]，接收 [`ObserverMessage`]
//!
//! Bridge：WebSocket 文本帧，JSON 信封 `{ type, ...fields }`。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Event, TargetId, ToolInfo};

/// 本系统事件的来源标记，其他来源的消息整体忽略
pub const SOURCE_TAG: &str = "ai-inspector";

/// 连接角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnRole {
    /// 页面侧事件生产者
    Producer,
    /// 检查器侧订阅者
    Observer,
}

/// 控制请求（任意角色 → Relay）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// 握手
    Handshake {
        /// 组件名称：panel / interceptor / ...
        component: String,
        /// 连接角色
        role: ConnRole,
    },

    /// 心跳（保持连接）
    Heartbeat,

    /// 查询 Relay 状态
    Status,
}

/// 控制响应（Relay → 任意角色）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    /// 成功
    Ok,

    /// 错误
    Error { code: i32, message: String },

    /// 握手成功
    HandshakeOk {
        /// Relay 版本
        relay_version: String,
    },

    /// 查询结果
    QueryResult { data: Value },
}

/// 生产者消息（Producer → Relay）
///
/// `{ source, type, tabId, data }`，事件为 `{ type, ...data }`。
/// 所有字段都宽松解析，由调用方判断是否可用。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerMessage {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, rename = "tabId", skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TargetId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl ProducerMessage {
    /// 来源标记是否属于本系统
    pub fn is_ours(&self) -> bool {
        self.source.as_deref() == Some(SOURCE_TAG)
    }

    /// 转换为存储事件
    pub fn into_event(self) -> Event {
        Event::new(self.event_type, self.data.unwrap_or_default())
    }
}

/// Observer 请求（Observer → Relay）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObserverRequest {
    /// 绑定目标并请求完整状态
    GetState {
        #[serde(default, rename = "tabId")]
        tab_id: Option<TargetId>,
    },

    /// 在页面中执行工具（透传给生产者，无响应）
    ExecuteTool {
        #[serde(default, rename = "tabId")]
        tab_id: Option<TargetId>,
        name: String,
        #[serde(default, rename = "inputArguments")]
        input_arguments: Value,
    },

    /// 清空目标日志，只回复请求方
    ClearEvents {
        #[serde(default, rename = "tabId")]
        tab_id: Option<TargetId>,
    },
}

/// 推送消息（Relay → Observer）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObserverMessage {
    /// 完整快照
    State { events: Vec<Event>, tools: Vec<ToolInfo> },

    /// 单条增量事件
    Event { event: Event },

    /// 工具投影变化
    ToolsUpdate { tools: Vec<ToolInfo> },

    /// 目标已导航，视为投影重置
    PageReload,
}

impl ObserverMessage {
    /// 空状态（CLEAR_EVENTS 的回复）
    pub fn empty_state() -> Self {
        ObserverMessage::State {
            events: Vec::new(),
            tools: Vec::new(),
        }
    }
}

/// 页面指令（Relay → Producer）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageCommand {
    ExecuteTool {
        #[serde(rename = "tabId")]
        tab_id: TargetId,
        name: String,
        #[serde(rename = "inputArgs")]
        input_args: Value,
    },
}

/// Bridge 出站消息（Relay → 外部）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeOutbound {
    Event {
        #[serde(rename = "tabId")]
        tab_id: TargetId,
        event: Event,
    },
    ToolsUpdate {
        #[serde(rename = "tabId")]
        tab_id: TargetId,
        tools: Vec<ToolInfo>,
    },
}

/// Bridge 入站消息（外部 → Relay）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeInbound {
    /// 外部触发的工具调用
    CallTool {
        #[serde(default, rename = "tabId")]
        tab_id: Option<TargetId>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default, rename = "inputArguments")]
        input_arguments: Value,
    },
}

/// 序列化为一行 JSONL
pub fn to_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    serde_json::to_string(message).map(|json| format!("{}\n", json))
}
