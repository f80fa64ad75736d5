//! 执行器契约与两种事件循环实现。
//!
//! # 模块定位（Why）
//! - 通道核心只依赖 [`EventExecutor`] 的单线程亲和契约：同一执行器上的任务按提交顺序、
//!   在唯一的线程上执行；
//! - [`SingleThreadEventLoop`] 提供真实线程，[`EmbeddedEventLoop`] 让测试与嵌入场景
//!   在调用线程上逐步驱动事件。
//!
//! # 风险提示（Trade-offs）
//! - 一个事件循环可以服务多个通道；任何在循环线程上阻塞的任务都会拖慢其上的所有通道。

mod embedded;
mod executor;
mod single_thread;

pub use embedded::EmbeddedEventLoop;
pub use executor::{EventExecutor, ScheduledTask, Task, same_executor};
pub use single_thread::SingleThreadEventLoop;
