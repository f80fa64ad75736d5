//! 异步结果原语：写一次的 [`Promise`] 与通道操作使用的 [`ChannelPromise`]。
//!
//! # 模块定位（Why）
//! - 通道核心从不阻塞调用线程，所有“等待”都表达为 Promise 组合与监听器回调；
//! - 需要同步语义的调用方可以在核心之外对 [`ChannelFuture`] 执行 `block_on`。
//!
//! # 使用方式（How）
//! - 通道与管线的便捷方法返回 [`ChannelFuture`]；
//! - 处理器在上下文上传递 [`ChannelPromise`]，内部收尾操作使用 [`VoidPromise`] 避免无人观察的记账开销。

mod channel_promise;
mod promise;

pub use channel_promise::{ChannelPromise, VoidPromise};
pub use promise::{Outcome, Promise};

/// 通道异步操作的结果，成功值为空。
pub type ChannelFuture = Promise<()>;
