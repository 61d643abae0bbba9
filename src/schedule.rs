//! 可取消的延时任务
//!
//! 同一时刻最多只有一个待执行任务：重新调度会取消旧任务并重新计时，
//! 即标准的防抖组合子。

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// 延时任务句柄
#[derive(Default)]
pub struct DelayedTask {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 `delay` 后执行 `task`，取消尚未执行的旧任务
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });

        if let Some(old) = self.handle.lock().replace(handle) {
            old.abort();
        }
    }

    /// 取消待执行的任务，返回是否确实取消了一个任务
    pub fn cancel(&self) -> bool {
        match self.handle.lock().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// 是否有尚未完成的任务
    pub fn is_pending(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
