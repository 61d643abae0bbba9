//! 核心数据类型

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 被检查目标（浏览器 Tab）的标识
pub type TargetId = u64;

/// 已知的事件类型常量
///
/// 事件类型保持为字符串以向前兼容：未知类型照常存储和转发。
pub mod event_type {
    pub const TOOL_REGISTERED: &str = "TOOL_REGISTERED";
    pub const TOOL_UNREGISTERED: &str = "TOOL_UNREGISTERED";
    pub const CONTEXT_CLEARED: &str = "CONTEXT_CLEARED";
    pub const PAGE_RELOAD: &str = "PAGE_RELOAD";
    pub const TOOL_CALL: &str = "TOOL_CALL";
    pub const TOOL_RESULT_AI: &str = "TOOL_RESULT_AI";
    pub const TOOL_ACTIVATED: &str = "TOOL_ACTIVATED";
    pub const TOOL_CANCEL: &str = "TOOL_CANCEL";
    pub const SESSION_CREATED: &str = "SESSION_CREATED";
    pub const PROMPT_SENT: &str = "PROMPT_SENT";
    pub const PROMPT_RESPONSE: &str = "PROMPT_RESPONSE";
    pub const PROMPT_ERROR: &str = "PROMPT_ERROR";
    pub const STREAM_START: &str = "STREAM_START";
    pub const STREAM_CHUNK: &str = "STREAM_CHUNK";
    pub const STREAM_END: &str = "STREAM_END";
}

/// 事件（只追加，不可变）
///
/// 序列化为扁平 JSON：`{"type": "...", "ts": ..., ...payload}`。
/// 事件身份由其在目标日志中的位置决定。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    /// 创建事件
    pub fn new(event_type: impl Into<String>, fields: Map<String, Value>) -> Self {
        let mut fields = fields;
        // 类型以外层为准，避免序列化出重复的 "type" 键
        fields.remove("type");
        Self {
            event_type: event_type.into(),
            fields,
        }
    }

    /// 创建带当前时间戳的事件（`ts`，毫秒）
    pub fn now(event_type: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("ts".to_string(), Value::from(chrono::Utc::now().timestamp_millis()));
        Self::new(event_type, fields)
    }

    /// 时间戳（毫秒），生产方未提供时为 None
    pub fn timestamp(&self) -> Option<i64> {
        self.fields.get("ts").and_then(Value::as_i64)
    }

    /// 读取负载字段
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }
}

/// 工具描述（投影中的一项）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON Schema 文本
    pub input_schema: String,
}

impl ToolInfo {
    /// 从 `TOOL_REGISTERED.tool` 负载构造
    ///
    /// - `name` 必须是字符串，否则返回 None
    /// - `description` 缺省为空串
    /// - `inputSchema` 为字符串时原样保留，否则编码为 JSON（缺省 `{}`）
    pub fn from_payload(tool: &Value) -> Option<Self> {
        let name = tool.get("name")?.as_str()?.to_string();
        let description = tool
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let input_schema = match tool.get("inputSchema") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "{}".to_string(),
            Some(other) => other.to_string(),
        };

        Some(Self {
            name,
            description,
            input_schema,
        })
    }
}
