//! 持久化快照后端
//!
//! 快照是单个带版本的键，值为完整 JSON 文本。每次 flush 都整体覆盖写入，
//! 因此不会出现部分持久化的日志。

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};

/// 快照存储键
pub const SNAPSHOT_KEY: &str = "ai_inspector_events";

/// 快照表
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);
"#;

/// 快照存储抽象
///
/// 实现必须保证 `write` 是原子的：要么完整替换旧值，要么保持不变。
pub trait SnapshotStorage: Send + Sync {
    /// 读取键值，不存在时返回 None
    fn read(&self, key: &str) -> Result<Option<String>>;

    /// 覆盖写入键值
    fn write(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite 快照存储
pub struct SqliteSnapshotStorage {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStorage {
    /// 打开（或创建）数据库文件
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        tracing::info!("快照数据库已连接: {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SnapshotStorage for SqliteSnapshotStorage {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM snapshots WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO snapshots (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now],
        )?;
        Ok(())
    }
}

/// 内存快照存储
///
/// 记录写入次数，并可注入读写失败，用于验证防抖与故障恢复。
#[derive(Default)]
pub struct MemorySnapshotStorage {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    value: Option<String>,
    writes: usize,
    fail_reads: bool,
    fail_writes: bool,
}

impl MemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以已有快照内容初始化
    pub fn with_value(value: impl Into<String>) -> Self {
        let storage = Self::default();
        storage.inner.lock().value = Some(value.into());
        storage
    }

    /// 当前保存的快照
    pub fn value(&self) -> Option<String> {
        self.inner.lock().value.clone()
    }

    /// 成功写入次数
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.inner.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }
}

impl SnapshotStorage for MemorySnapshotStorage {
    fn read(&self, _key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        if inner.fail_reads {
            return Err(Error::Io(std::io::Error::other("injected read failure")));
        }
        Ok(inner.value.clone())
    }

    fn write(&self, _key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Err(Error::Io(std::io::Error::other("injected write failure")));
        }
        inner.value = Some(value.to_string());
        inner.writes += 1;
        Ok(())
    }
}
