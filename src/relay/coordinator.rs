//! 事件中继协调器
//!
//! 组合根：接收生产者事件写入存储，按需推送工具投影，处理 Observer 请求。

use std::sync::Arc;

use serde_json::Value;

use super::pages::PageLinks;
use super::router::{ConnId, Router};
use crate::projection;
use crate::protocol::{ObserverMessage, ObserverRequest, PageCommand, ProducerMessage};
use crate::store::EventStore;
use crate::types::{event_type, Event, TargetId};

#[cfg(feature = "bridge")]
use crate::bridge::{BridgeCall, BridgeConnection};
#[cfg(feature = "bridge")]
use crate::protocol::BridgeOutbound;

/// 事件中继
pub struct Relay {
    store: Arc<EventStore>,
    router: Arc<Router>,
    pages: Arc<PageLinks>,
    #[cfg(feature = "bridge")]
    bridge: Option<Arc<BridgeConnection>>,
}

impl Relay {
    pub fn new(store: Arc<EventStore>, router: Arc<Router>, pages: Arc<PageLinks>) -> Self {
        Self {
            store,
            router,
            pages,
            #[cfg(feature = "bridge")]
            bridge: None,
        }
    }

    /// 附加外部 Bridge：事件与投影变化同时转发给它
    #[cfg(feature = "bridge")]
    pub fn with_bridge(mut self, bridge: Arc<BridgeConnection>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn pages(&self) -> &Arc<PageLinks> {
        &self.pages
    }

    /// 处理生产者消息，返回是否被接受
    ///
    /// 来源标记不符或缺少目标的消息静默忽略。
    pub fn handle_producer(&self, message: ProducerMessage) -> bool {
        if !message.is_ours() {
            tracing::trace!("Ignoring message from foreign source: {:?}", message.source);
            return false;
        }
        let Some(target) = message.tab_id else {
            tracing::trace!("Ignoring producer message without tabId: {}", message.event_type);
            return false;
        };

        let event = message.into_event();
        if event.is(event_type::PAGE_RELOAD) {
            self.navigate(target, event);
        } else {
            self.ingest(target, event);
        }
        true
    }

    /// 目标开始导航：记录 PAGE_RELOAD 并通知投影重置
    pub fn handle_navigation(&self, target: TargetId) {
        self.navigate(target, Event::now(event_type::PAGE_RELOAD));
    }

    /// 追加事件并推送：先 EVENT，投影受影响时再 TOOLS_UPDATE
    fn ingest(&self, target: TargetId, event: Event) {
        let affects_tools = projection::affects_tools(&event.event_type);
        self.store.append(target, event.clone());

        #[cfg(feature = "bridge")]
        self.forward(BridgeOutbound::Event {
            tab_id: target,
            event: event.clone(),
        });

        self.router.notify(target, &ObserverMessage::Event { event });

        if affects_tools {
            self.push_tools(target);
        }
    }

    fn navigate(&self, target: TargetId, mut event: Event) {
        if event.timestamp().is_none() {
            event.fields.insert(
                "ts".to_string(),
                Value::from(chrono::Utc::now().timestamp_millis()),
            );
        }
        tracing::debug!("🔄 Navigation: tab_id={}", target);

        self.store.append(target, event.clone());

        #[cfg(feature = "bridge")]
        self.forward(BridgeOutbound::Event {
            tab_id: target,
            event,
        });

        self.router.notify(target, &ObserverMessage::PageReload);
        self.push_tools(target);
    }

    fn push_tools(&self, target: TargetId) {
        let tools = self.store.get_tools(target);

        #[cfg(feature = "bridge")]
        self.forward(BridgeOutbound::ToolsUpdate {
            tab_id: target,
            tools: tools.clone(),
        });

        self.router.notify(target, &ObserverMessage::ToolsUpdate { tools });
    }

    /// 处理 Observer 请求，返回需要直接回复给请求方的消息
    ///
    /// GET_STATE 先绑定再等待 hydrate：等待期间推送的 EVENT 也会包含在随后的 STATE 中，
    /// Observer 收到 STATE 后应以其为准替换本地状态（按日志位置去重）。
    pub async fn handle_request(
        &self,
        conn_id: ConnId,
        request: ObserverRequest,
    ) -> Option<ObserverMessage> {
        match request {
            ObserverRequest::GetState { tab_id } => {
                let target = tab_id?;
                self.router.bind(conn_id, target);
                // 等待 hydrate，避免冷启动时返回空状态
                self.store.ready().await;
                Some(ObserverMessage::State {
                    events: self.store.get_log(target),
                    tools: self.store.get_tools(target),
                })
            }

            ObserverRequest::ExecuteTool {
                tab_id,
                name,
                input_arguments,
            } => {
                let target = tab_id?;
                self.execute_tool(target, name, input_arguments);
                None
            }

            ObserverRequest::ClearEvents { tab_id } => {
                let target = tab_id?;
                self.store.clear(target);
                // 只回复请求方，同目标的其他 Observer 不会收到通知
                Some(ObserverMessage::empty_state())
            }
        }
    }

    /// 将工具调用透传给目标页面（fire-and-forget）
    pub fn execute_tool(&self, target: TargetId, name: String, input_arguments: Value) {
        tracing::debug!("🛠️ EXECUTE_TOOL: tab_id={}, name={}", target, name);
        self.pages.send(&PageCommand::ExecuteTool {
            tab_id: target,
            name,
            input_args: input_arguments,
        });
    }

    /// 处理 Bridge 发起的工具调用
    #[cfg(feature = "bridge")]
    pub fn handle_bridge_call(&self, call: BridgeCall) {
        self.execute_tool(call.tab_id, call.name, call.input_arguments);
    }

    #[cfg(feature = "bridge")]
    fn forward(&self, message: BridgeOutbound) {
        if let Some(bridge) = &self.bridge {
            bridge.send(&message);
        }
    }
}
