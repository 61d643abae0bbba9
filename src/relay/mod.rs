//! Relay 模块 - 事件中继 + 订阅者路由 + 进程生命周期
//!
//! Relay 负责：
//! - 接收页面侧生产者的事件并写入按目标分区的存储
//! - 将事件和工具投影推送给绑定到该目标的 Observer
//! - 将 EXECUTE_TOOL 送回页面
//! - 空闲超时退出，重启后从快照恢复

mod coordinator;
mod pages;
mod router;
mod server;

pub use coordinator::Relay;
pub use pages::PageLinks;
pub use router::{ConnId, MessageSender, Router};
pub use server::{cleanup_stale_relay, is_relay_running, RelayServer, RELAY_VERSION};
