//! ai-inspector-relay - AI 检查器事件中继
//!
//! 页面内的 AI / Agent 活动（模型会话、prompt/response 流、动态注册的工具）
//! 由页面侧插桩捕获，经本 Relay 近实时地转发给检查器 UI。
//!
//! # 核心功能
//!
//! - **事件存储**: 按目标（Tab）分区的只追加日志，防抖持久化，启动时 hydrate 合并
//! - **工具投影**: 从日志重放推导当前存活的工具集
//! - **订阅者路由**: 按目标隔离推送，未绑定的 Observer 接收全部事件
//! - **Bridge**: 可选的外部 WebSocket 连接，指数退避自动重连
//!
//! # Feature Flags
//!
//! - `bridge`: 外部 WebSocket Bridge（默认开启）
//!
//! # 架构
//!
//! Relay 进程随时可能被回收。内存状态为权威，快照最多落后一个防抖窗口；
//! 重启后先 hydrate，再对外提供完整状态。

pub mod config;
pub mod error;
pub mod projection;
pub mod protocol;
pub mod relay;
pub mod schedule;
pub mod storage;
pub mod store;
pub mod types;

#[cfg(feature = "bridge")]
pub mod bridge;

// Re-exports
pub use config::{BridgeConfig, RelayConfig};
pub use error::{Error, Result};
pub use projection::{affects_tools, project, ToolSet};
pub use protocol::{ObserverMessage, ObserverRequest, PageCommand, ProducerMessage, SOURCE_TAG};
pub use relay::{Relay, RelayServer, Router};
pub use storage::{MemorySnapshotStorage, SnapshotStorage, SqliteSnapshotStorage};
pub use store::EventStore;
pub use types::{Event, TargetId, ToolInfo};

#[cfg(feature = "bridge")]
pub use bridge::{BridgeCall, BridgeConnection, BridgeState};
