use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::Result;
use crate::future::Promise;

/// 提交给执行器的一次性任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 单线程执行器契约。
///
/// # 设计意图（Why）
/// - 通道的管线回调、Unsafe 操作与出站缓冲变更只在其绑定的执行器线程上执行，
///   核心依靠这条亲和性保证顺序，而不是在热路径上加锁。
///
/// # 契约说明（What）
/// - `execute`：任务按提交顺序在唯一的工作线程上执行；关闭后提交返回 `runtime.shutdown`；
/// - `in_event_loop`：当前线程是否就是该执行器的工作线程；
/// - `schedule`：延迟执行，返回可取消的 [`ScheduledTask`]；
/// - `as_any`：供传输实现判断执行器族是否兼容。
pub trait EventExecutor: Send + Sync + 'static {
    fn in_event_loop(&self) -> bool;

    fn execute(&self, task: Task) -> Result<()>;

    fn schedule(&self, delay: Duration, task: Task) -> Result<ScheduledTask>;

    fn is_shutting_down(&self) -> bool;

    /// 发起优雅关闭：已排队的任务仍会执行，返回的 Promise 在工作线程退出后完成。
    fn shutdown_gracefully(&self) -> Promise<()>;

    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn EventExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventExecutor")
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// 判断两个执行器句柄是否指向同一实例。
pub fn same_executor(a: &Arc<dyn EventExecutor>, b: &Arc<dyn EventExecutor>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// 延迟任务的取消句柄。
#[derive(Clone, Debug, Default)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 取消任务；若此前已取消返回 `false`。到期后才取消不会撤销已开始的执行。
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
