//! 按目标分区的事件存储
//!
//! 内存中的日志提供同步读写；每次变更都会防抖地整体写入快照存储，
//! 使事件在 Relay 进程被回收后仍可恢复。
//!
//! - 启动时异步 hydrate：持久化事件在前，hydrate 完成前到达的内存事件在后
//! - 工具投影随追加增量维护，hydrate 时整段重放重建
//! - 写入失败只记录日志，不重试，不影响调用方
//! - 存储读写在 blocking 线程池执行，不占用 runtime 线程

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::projection::{self, ToolSet};
use crate::schedule::DelayedTask;
use crate::storage::{SnapshotStorage, SNAPSHOT_KEY};
use crate::types::{Event, TargetId, ToolInfo};

/// 事件存储
pub struct EventStore {
    shared: Arc<Shared>,
    flush_delay: Duration,
    flush_task: DelayedTask,
    ready: watch::Receiver<bool>,
}

struct Shared {
    state: Mutex<StoreState>,
    storage: Arc<dyn SnapshotStorage>,
    /// 已写入快照的最新版本，旧版本的写入直接跳过
    written: Arc<Mutex<Option<u64>>>,
}

#[derive(Default)]
struct StoreState {
    events: HashMap<TargetId, Vec<Event>>,
    tools: HashMap<TargetId, ToolSet>,
    /// 每次变更递增
    version: u64,
    hydrated: bool,
    /// hydrate 完成前被 clear 的目标，其持久化事件不再合并
    cleared_early: HashSet<TargetId>,
    /// hydrate 完成前执行过 clear_all
    all_cleared_early: bool,
}

impl EventStore {
    /// 创建存储并在后台开始 hydrate
    ///
    /// 必须在 tokio 运行时内调用。hydrate 失败不会传播，只记录警告。
    pub fn open(storage: Arc<dyn SnapshotStorage>, flush_delay: Duration) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(StoreState::default()),
            storage,
            written: Arc::new(Mutex::new(None)),
        });
        let (ready_tx, ready_rx) = watch::channel(false);

        let hydrating = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = hydrating.hydrate().await {
                tracing::warn!("💾 Hydrate 失败，使用空状态继续: {}", e);
            }
            hydrating.state.lock().hydrated = true;
            let _ = ready_tx.send(true);
        });

        Arc::new(Self {
            shared,
            flush_delay,
            flush_task: DelayedTask::new(),
            ready: ready_rx,
        })
    }

    /// 等待初始 hydrate 完成
    pub async fn ready(&self) {
        let mut ready = self.ready.clone();
        // 发送端已关闭也直接返回：hydrate 任务不会再改变状态
        let _ = ready.wait_for(|done| *done).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// 追加事件（同步生效，随后防抖持久化）
    pub fn append(&self, target: TargetId, event: Event) {
        {
            let mut state = self.shared.state.lock();
            projection::apply(state.tools.entry(target).or_default(), &event);
            state.events.entry(target).or_default().push(event);
            state.version += 1;
        }
        self.schedule_persist();
    }

    /// 获取目标的完整日志，不存在时为空
    pub fn get_log(&self, target: TargetId) -> Vec<Event> {
        self.shared
            .state
            .lock()
            .events
            .get(&target)
            .cloned()
            .unwrap_or_default()
    }

    /// 获取目标当前的工具投影
    pub fn get_tool_projection(&self, target: TargetId) -> ToolSet {
        self.shared
            .state
            .lock()
            .tools
            .get(&target)
            .cloned()
            .unwrap_or_default()
    }

    /// 工具投影的列表形式
    pub fn get_tools(&self, target: TargetId) -> Vec<ToolInfo> {
        self.shared
            .state
            .lock()
            .tools
            .get(&target)
            .map(ToolSet::to_list)
            .unwrap_or_default()
    }

    /// 当前持有非空日志的目标（升序）
    pub fn targets(&self) -> Vec<TargetId> {
        let state = self.shared.state.lock();
        let mut targets: Vec<TargetId> = state
            .events
            .iter()
            .filter(|(_, events)| !events.is_empty())
            .map(|(target, _)| *target)
            .collect();
        targets.sort_unstable();
        targets
    }

    /// 清空单个目标
    pub fn clear(&self, target: TargetId) {
        {
            let mut state = self.shared.state.lock();
            state.events.insert(target, Vec::new());
            state.tools.insert(target, ToolSet::new());
            state.version += 1;
            if !state.hydrated {
                state.cleared_early.insert(target);
            }
        }
        tracing::debug!("💾 Cleared target: tab_id={}", target);
        self.schedule_persist();
    }

    /// 清空所有目标
    pub fn clear_all(&self) {
        {
            let mut state = self.shared.state.lock();
            state.events.clear();
            state.tools.clear();
            state.version += 1;
            if !state.hydrated {
                state.all_cleared_early = true;
            }
        }
        tracing::debug!("💾 Cleared all targets");
        self.schedule_persist();
    }

    /// 是否有待执行的防抖写入
    pub fn has_pending_flush(&self) -> bool {
        self.flush_task.is_pending()
    }

    /// 取消防抖计时并立即写入（退出前调用）
    ///
    /// hydrate 未完成时不写入，避免用部分状态覆盖快照。
    pub async fn flush_now(&self) {
        self.flush_task.cancel();
        if self.is_ready() {
            self.shared.persist().await;
        } else {
            tracing::debug!("💾 Hydrate 未完成，跳过立即写入");
        }
    }

    fn schedule_persist(&self) {
        let shared = self.shared.clone();
        let mut ready = self.ready.clone();
        self.flush_task.schedule(self.flush_delay, async move {
            let _ = ready.wait_for(|done| *done).await;
            shared.persist().await;
        });
    }
}

impl Shared {
    /// 读取快照并与已到达的内存事件合并
    async fn hydrate(&self) -> Result<()> {
        let storage = self.storage.clone();
        let read = tokio::task::spawn_blocking(move || storage.read(SNAPSHOT_KEY))
            .await
            .map_err(|e| Error::Other(e.into()))?;

        let raw = match read? {
            Some(raw) => raw,
            None => {
                tracing::debug!("💾 无持久化快照");
                return Ok(());
            }
        };

        let persisted = parse_snapshot(&raw)?;

        let mut state = self.state.lock();
        if state.all_cleared_early {
            tracing::debug!("💾 Hydrate 前已 clear_all，丢弃持久化快照");
            return Ok(());
        }

        let mut restored = 0usize;
        for (target, events) in persisted {
            if state.cleared_early.contains(&target) {
                continue;
            }
            restored += events.len();

            let arrived = state.events.remove(&target).unwrap_or_default();
            let mut merged = events;
            merged.extend(arrived);

            state.tools.insert(target, projection::project(&merged));
            state.events.insert(target, merged);
        }

        tracing::info!(
            "💾 Hydrate 完成: {} 个目标, {} 条持久化事件",
            state.events.len(),
            restored
        );
        Ok(())
    }

    /// 将所有非空日志整体写入快照
    ///
    /// 在锁内序列化，写入交给 blocking 线程池。被取消的旧 flush 仍可能在后台完成写入，
    /// 版本号保证快照不会回退。
    async fn persist(&self) {
        let (version, json) = {
            let state = self.state.lock();
            let snapshot: BTreeMap<String, &Vec<Event>> = state
                .events
                .iter()
                .filter(|(_, events)| !events.is_empty())
                .map(|(target, events)| (target.to_string(), events))
                .collect();

            match serde_json::to_string(&snapshot) {
                Ok(json) => (state.version, json),
                Err(e) => {
                    tracing::warn!("💾 序列化快照失败: {}", e);
                    return;
                }
            }
        };

        let storage = self.storage.clone();
        let written = self.written.clone();
        let write = tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut written = written.lock();
            if written.is_some_and(|w| w >= version) {
                return Ok(false);
            }
            storage.write(SNAPSHOT_KEY, &json)?;
            *written = Some(version);
            Ok(true)
        });

        match write.await {
            Ok(Ok(true)) => tracing::trace!("💾 快照已写入: version={}", version),
            Ok(Ok(false)) => tracing::trace!("💾 已有更新的快照，跳过: version={}", version),
            Ok(Err(e)) => tracing::warn!("💾 写入快照失败: {}", e),
            Err(e) => tracing::warn!("💾 写入任务失败: {}", e),
        }
    }
}

/// 解析快照：`{"<tabId>": [Event, ...]}`
///
/// 无法解析为目标 ID 的键会被跳过；整体不是对象视为损坏。
fn parse_snapshot(raw: &str) -> Result<Vec<(TargetId, Vec<Event>)>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::CorruptSnapshot("顶层不是对象".into()))?;

    let mut targets = Vec::with_capacity(object.len());
    for (key, events) in object {
        let target: TargetId = match key.parse() {
            Ok(t) => t,
            Err(_) => {
                tracing::warn!("💾 跳过无效的目标键: {:?}", key);
                continue;
            }
        };
        let events: Vec<Event> = serde_json::from_value(events.clone())?;
        targets.push((target, events));
    }
    targets.sort_by_key(|(target, _)| *target);
    Ok(targets)
}
