//! 工具投影
//!
//! 从目标的事件日志推导当前"存活工具集"。投影是日志的纯函数：
//! 逐条增量应用与整段重放必须得到相同结果。

use std::collections::HashMap;

use serde::{Serialize, Serializer};

use crate::types::{event_type, Event, ToolInfo};

/// 墓碑数超过存活数且达到该槽位数时压缩
const COMPACT_MIN_SLOTS: usize = 16;

/// 存活工具集（按名称唯一，保持首次注册顺序）
///
/// 槽位数组保存顺序，名称索引指向槽位；删除只留下墓碑，累积过多时整体压缩，
/// 因此 upsert / remove / get 均为均摊 O(1)。
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    slots: Vec<Option<ToolInfo>>,
    index: HashMap<String, usize>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入或替换同名工具；已存在时保留原位置
    pub fn upsert(&mut self, tool: ToolInfo) {
        match self.index.get(&tool.name) {
            Some(&slot) => self.slots[slot] = Some(tool),
            None => {
                self.index.insert(tool.name.clone(), self.slots.len());
                self.slots.push(Some(tool));
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<ToolInfo> {
        let slot = self.index.remove(name)?;
        let removed = self.slots[slot].take();
        if self.slots.len() >= COMPACT_MIN_SLOTS && self.index.len() * 2 < self.slots.len() {
            self.compact();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }

    pub fn get(&self, name: &str) -> Option<&ToolInfo> {
        self.index.get(name).and_then(|&slot| self.slots[slot].as_ref())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolInfo> {
        self.slots.iter().flatten()
    }

    /// 以列表形式导出（用于 STATE / TOOLS_UPDATE）
    pub fn to_list(&self) -> Vec<ToolInfo> {
        self.iter().cloned().collect()
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        for (slot, tool) in self.slots.iter().flatten().enumerate() {
            if let Some(entry) = self.index.get_mut(&tool.name) {
                *entry = slot;
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// 按存活工具及其顺序比较，与墓碑布局无关
impl PartialEq for ToolSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Eq for ToolSet {}

impl Serialize for ToolSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

/// 该类型的事件是否会改变工具投影
pub fn affects_tools(kind: &str) -> bool {
    matches!(
        kind,
        event_type::TOOL_REGISTERED
            | event_type::TOOL_UNREGISTERED
            | event_type::CONTEXT_CLEARED
            | event_type::PAGE_RELOAD
    )
}

/// 将单个事件应用到投影上
///
/// - `TOOL_REGISTERED` 带 `tool` 负载：按名称 upsert
/// - `TOOL_UNREGISTERED` 带字符串 `name`：删除
/// - `CONTEXT_CLEARED` / `PAGE_RELOAD`：清空
/// - 其他事件不影响投影
pub fn apply(tools: &mut ToolSet, event: &Event) {
    match event.event_type.as_str() {
        event_type::TOOL_REGISTERED => {
            if let Some(tool) = event.get("tool").and_then(ToolInfo::from_payload) {
                tools.upsert(tool);
            }
        }
        event_type::TOOL_UNREGISTERED => {
            if let Some(name) = event.get("name").and_then(|v| v.as_str()) {
                tools.remove(name);
            }
        }
        event_type::CONTEXT_CLEARED | event_type::PAGE_RELOAD => tools.clear(),
        _ => {}
    }
}

/// 整段重放日志得到投影
pub fn project(events: &[Event]) -> ToolSet {
    let mut tools = ToolSet::new();
    for event in events {
        apply(&mut tools, event);
    }
    tools
}
