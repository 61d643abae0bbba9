//! Relay 服务端到端测试（Unix Socket + JSONL）

use std::sync::Arc;
use std::time::Duration;

use ai_inspector_relay::*;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

struct TestRelay {
    _tmp: TempDir,
    config: RelayConfig,
    storage: Arc<MemorySnapshotStorage>,
    server: Arc<RelayServer>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestRelay {
    async fn start() -> Self {
        Self::start_with(Arc::new(MemorySnapshotStorage::new()), |_| {}).await
    }

    async fn start_with(
        storage: Arc<MemorySnapshotStorage>,
        tweak: impl FnOnce(&mut RelayConfig),
    ) -> Self {
        let tmp = TempDir::new().unwrap();
        let mut config = RelayConfig {
            data_dir: tmp.path().to_path_buf(),
            idle_timeout_secs: 60,
            flush_delay_ms: 20,
            observer_buffer: 64,
            bridge: None,
        };
        tweak(&mut config);

        let server = Arc::new(RelayServer::with_storage(config.clone(), storage.clone()));
        let handle = tokio::spawn(server.clone().run());

        let socket = config.socket_path();
        for _ in 0..100 {
            if socket.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(socket.exists(), "relay socket not created");

        Self {
            _tmp: tmp,
            config,
            storage,
            server,
            handle,
        }
    }

    async fn connect(&self) -> Client {
        let stream = UnixStream::connect(self.config.socket_path()).await.unwrap();
        let (reader, writer) = stream.into_split();
        Client {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn observer(&self) -> Client {
        let mut client = self.connect().await;
        client.handshake("observer").await;
        client
    }

    async fn producer(&self) -> Client {
        let mut client = self.connect().await;
        client.handshake("producer").await;
        client
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn send(&mut self, value: Value) {
        let line = format!("{}\n", value);
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        let mut line = String::new();
        match timeout(wait, self.reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => Some(serde_json::from_str(&line).unwrap()),
            _ => None,
        }
    }

    async fn recv(&mut self) -> Value {
        self.try_recv(RECV_TIMEOUT).await.expect("timed out waiting for message")
    }

    async fn handshake(&mut self, role: &str) -> Value {
        self.send(json!({"type": "Handshake", "component": "test", "role": role}))
            .await;
        let reply = self.recv().await;
        assert_eq!(reply["type"], "HandshakeOk", "unexpected reply: {}", reply);
        reply
    }

    async fn get_state(&mut self, tab_id: u64) -> Value {
        self.send(json!({"type": "GET_STATE", "tabId": tab_id})).await;
        let state = self.recv().await;
        assert_eq!(state["type"], "STATE");
        state
    }

    async fn emit(&mut self, tab_id: u64, event_type: &str, data: Value) {
        self.send(json!({
            "source": "ai-inspector",
            "type": event_type,
            "tabId": tab_id,
            "data": data,
        }))
        .await;
    }
}

fn tool_names(message: &Value) -> Vec<String> {
    message["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

// ==================== 握手 ====================

#[tokio::test]
async fn test_handshake_and_repeat() {
    let relay = TestRelay::start().await;
    let mut client = relay.connect().await;

    let reply = client.handshake("observer").await;
    assert_eq!(reply["relay_version"], env!("CARGO_PKG_VERSION"));

    client
        .send(json!({"type": "Handshake", "component": "test", "role": "producer"}))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["type"], "Error");
    assert_eq!(reply["code"], 409);
}

#[tokio::test]
async fn test_messages_before_handshake_ignored() {
    let relay = TestRelay::start().await;
    let mut client = relay.connect().await;

    client.send(json!({"type": "GET_STATE", "tabId": 1})).await;
    client.handshake("observer").await;

    client.send(json!({"type": "Heartbeat"})).await;
    assert_eq!(client.recv().await["type"], "Ok");
}

// ==================== 事件推送 ====================

#[tokio::test]
async fn test_producer_events_reach_bound_observer() {
    let relay = TestRelay::start().await;
    let mut observer = relay.observer().await;
    let state = observer.get_state(1).await;
    assert_eq!(state["events"], json!([]));
    assert_eq!(state["tools"], json!([]));

    let mut producer = relay.producer().await;
    producer
        .emit(1, "TOOL_REGISTERED", json!({"tool": {"name": "foo", "description": "d"}}))
        .await;

    let event = observer.recv().await;
    assert_eq!(event["type"], "EVENT");
    assert_eq!(event["event"]["type"], "TOOL_REGISTERED");
    assert_eq!(event["event"]["tool"]["name"], "foo");

    let update = observer.recv().await;
    assert_eq!(update["type"], "TOOLS_UPDATE");
    assert_eq!(tool_names(&update), vec!["foo"]);

    // 非工具事件只推送 EVENT
    producer.emit(1, "PROMPT_SENT", json!({"prompt": "hi"})).await;
    assert_eq!(observer.recv().await["event"]["type"], "PROMPT_SENT");
    assert!(observer.try_recv(QUIET).await.is_none());
}

#[tokio::test]
async fn test_observer_only_sees_its_target() {
    let relay = TestRelay::start().await;
    let mut observer = relay.observer().await;
    observer.get_state(2).await;

    let mut producer = relay.producer().await;
    producer.emit(1, "PROMPT_SENT", json!({"seq": 1})).await;
    producer.emit(2, "PROMPT_SENT", json!({"seq": 2})).await;

    let event = observer.recv().await;
    assert_eq!(event["event"]["seq"], 2);
    assert!(observer.try_recv(QUIET).await.is_none());
}

#[tokio::test]
async fn test_unbound_observer_sees_everything() {
    let relay = TestRelay::start().await;
    let mut observer = relay.observer().await;

    let mut producer = relay.producer().await;
    producer.emit(1, "PROMPT_SENT", json!({"seq": 1})).await;
    producer.emit(2, "PROMPT_SENT", json!({"seq": 2})).await;

    assert_eq!(observer.recv().await["event"]["seq"], 1);
    assert_eq!(observer.recv().await["event"]["seq"], 2);
}

#[tokio::test]
async fn test_foreign_and_untargeted_messages_ignored() {
    let relay = TestRelay::start().await;
    let mut observer = relay.observer().await;
    observer.get_state(1).await;

    let mut producer = relay.producer().await;
    producer
        .send(json!({"source": "other", "type": "PROMPT_SENT", "tabId": 1, "data": {"seq": 0}}))
        .await;
    producer
        .send(json!({"source": "ai-inspector", "type": "PROMPT_SENT", "data": {"seq": 0}}))
        .await;
    producer.send(json!("garbage")).await;
    producer.emit(1, "PROMPT_SENT", json!({"seq": 1})).await;

    assert_eq!(observer.recv().await["event"]["seq"], 1);
    assert_eq!(relay.server.relay().store().get_log(1).len(), 1);
}

#[tokio::test]
async fn test_invalid_utf8_line_keeps_connection() {
    let relay = TestRelay::start().await;
    let mut observer = relay.observer().await;
    observer.get_state(1).await;

    let mut producer = relay.producer().await;
    producer.emit(1, "PROMPT_SENT", json!({"seq": 1})).await;
    producer.writer.write_all(b"\xff\xfe garbage\n").await.unwrap();
    producer.emit(1, "PROMPT_SENT", json!({"seq": 2})).await;

    assert_eq!(observer.recv().await["event"]["seq"], 1);
    assert_eq!(observer.recv().await["event"]["seq"], 2);
    assert_eq!(relay.server.relay().store().get_log(1).len(), 2);

    // 连接仍可用
    producer.send(json!({"type": "Heartbeat"})).await;
    assert_eq!(producer.recv().await["type"], "Ok");
}

#[tokio::test]
async fn test_stalled_observer_is_disconnected() {
    let relay = TestRelay::start_with(Arc::new(MemorySnapshotStorage::new()), |config| {
        config.observer_buffer = 1;
    })
    .await;
    let mut stalled = relay.observer().await;
    stalled.get_state(1).await;

    // 不读取推送，直到 socket 缓冲区和通道都被写满
    let mut producer = relay.producer().await;
    let chunk = "x".repeat(64 * 1024);
    for seq in 0..100 {
        producer
            .emit(1, "STREAM_CHUNK", json!({"seq": seq, "chunk": chunk}))
            .await;
    }

    let closed = timeout(Duration::from_secs(10), async {
        let mut line = String::new();
        loop {
            line.clear();
            match stalled.reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "stalled observer was not disconnected");

    producer.send(json!({"type": "Status"})).await;
    let status = producer.recv().await;
    assert_eq!(status["data"]["observers"], 0);
    assert_eq!(relay.server.relay().store().get_log(1).len(), 100);
}

#[tokio::test]
async fn test_page_reload_resets_tools() {
    let relay = TestRelay::start().await;
    let mut observer = relay.observer().await;
    observer.get_state(5).await;

    let mut producer = relay.producer().await;
    producer
        .emit(5, "TOOL_REGISTERED", json!({"tool": {"name": "foo"}}))
        .await;
    observer.recv().await;
    assert_eq!(tool_names(&observer.recv().await), vec!["foo"]);

    producer.emit(5, "PAGE_RELOAD", json!({})).await;
    assert_eq!(observer.recv().await["type"], "PAGE_RELOAD");
    let update = observer.recv().await;
    assert_eq!(update["type"], "TOOLS_UPDATE");
    assert!(tool_names(&update).is_empty());

    let log = relay.server.relay().store().get_log(5);
    assert_eq!(log.len(), 2);
    assert!(log[1].is("PAGE_RELOAD"));
    assert!(log[1].timestamp().is_some());
}

// ==================== Observer 请求 ====================

#[tokio::test]
async fn test_get_state_returns_history() {
    let relay = TestRelay::start().await;
    let mut producer = relay.producer().await;
    let mut first = relay.observer().await;

    producer
        .emit(3, "TOOL_REGISTERED", json!({"tool": {"name": "a"}}))
        .await;
    producer.emit(3, "PROMPT_SENT", json!({})).await;
    // 未绑定的 Observer 收到推送，说明两条事件都已写入
    first.recv().await;
    first.recv().await;
    first.recv().await;

    let mut late = relay.observer().await;
    let state = late.get_state(3).await;
    assert_eq!(state["events"].as_array().unwrap().len(), 2);
    assert_eq!(tool_names(&state), vec!["a"]);
}

#[tokio::test]
async fn test_clear_events_replies_only_to_requester() {
    let relay = TestRelay::start().await;
    let mut a = relay.observer().await;
    let mut b = relay.observer().await;
    a.get_state(4).await;
    b.get_state(4).await;

    let mut producer = relay.producer().await;
    producer.emit(4, "PROMPT_SENT", json!({})).await;
    a.recv().await;
    b.recv().await;

    a.send(json!({"type": "CLEAR_EVENTS", "tabId": 4})).await;
    let reply = a.recv().await;
    assert_eq!(reply, json!({"type": "STATE", "events": [], "tools": []}));
    assert!(b.try_recv(QUIET).await.is_none());

    let state = b.get_state(4).await;
    assert_eq!(state["events"], json!([]));
}

#[tokio::test]
async fn test_execute_tool_reaches_page() {
    let relay = TestRelay::start().await;
    let mut observer = relay.observer().await;
    observer.get_state(6).await;

    let mut producer = relay.producer().await;
    producer.emit(6, "PROMPT_SENT", json!({})).await;
    observer.recv().await;

    observer
        .send(json!({
            "type": "EXECUTE_TOOL",
            "tabId": 6,
            "name": "search",
            "inputArguments": {"q": "rust"},
        }))
        .await;

    let command = producer.recv().await;
    assert_eq!(
        command,
        json!({"action": "EXECUTE_TOOL", "tabId": 6, "name": "search", "inputArgs": {"q": "rust"}})
    );
    // fire-and-forget：Observer 不会收到回复
    assert!(observer.try_recv(QUIET).await.is_none());
}

#[tokio::test]
async fn test_status() {
    let relay = TestRelay::start().await;
    let mut observer = relay.observer().await;
    observer.get_state(8).await;

    let mut producer = relay.producer().await;
    producer.emit(8, "PROMPT_SENT", json!({})).await;
    observer.recv().await;

    producer.send(json!({"type": "Status"})).await;
    let reply = producer.recv().await;
    assert_eq!(reply["type"], "QueryResult");

    let data = &reply["data"];
    assert_eq!(data["hydrated"], true);
    assert_eq!(data["observers"], 1);
    assert_eq!(data["connections"], 2);
    assert_eq!(data["targets"], json!([8]));
    assert_eq!(data["bridge_connected"], false);
}

// ==================== 持久化 / 生命周期 ====================

#[tokio::test]
async fn test_state_survives_relay_restart() {
    let storage = Arc::new(MemorySnapshotStorage::new());

    {
        let relay = TestRelay::start_with(storage.clone(), |_| {}).await;
        let mut observer = relay.observer().await;
        let mut producer = relay.producer().await;
        producer
            .emit(11, "TOOL_REGISTERED", json!({"tool": {"name": "kept"}}))
            .await;
        observer.recv().await;
        observer.recv().await;

        // 等待防抖写入
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(relay.storage.write_count() >= 1);
        relay.handle.abort();
    }

    let relay = TestRelay::start_with(storage, |_| {}).await;
    let mut observer = relay.observer().await;
    let state = observer.get_state(11).await;
    assert_eq!(state["events"].as_array().unwrap().len(), 1);
    assert_eq!(tool_names(&state), vec!["kept"]);
}

#[tokio::test]
async fn test_idle_shutdown_flushes_and_cleans_up() {
    let storage = Arc::new(MemorySnapshotStorage::new());
    let relay = TestRelay::start_with(storage.clone(), |config| {
        config.idle_timeout_secs = 1;
        // 防抖窗口远长于测试：写入只能来自退出前的强制 flush
        config.flush_delay_ms = 60_000;
    })
    .await;

    let store = relay.server.relay().store().clone();
    store.ready().await;
    store.append(12, Event::now("PROMPT_SENT"));

    let TestRelay {
        _tmp,
        config,
        handle,
        ..
    } = relay;

    let result = timeout(Duration::from_secs(5), handle)
        .await
        .expect("relay did not exit on idle");
    result.unwrap().unwrap();

    assert!(!config.socket_path().exists());
    assert!(!config.pid_path().exists());
    assert_eq!(storage.write_count(), 1);
    let persisted: Value = serde_json::from_str(&storage.value().unwrap()).unwrap();
    assert_eq!(persisted["12"][0]["type"], "PROMPT_SENT");
}
