//! 消息、出站缓冲与接收缓冲分配。
//!
//! # 模块定位（Why）
//! - [`PipelineMessage`] 是管线中流动的唯一消息载体，所有权即生命周期；
//! - [`OutboundBuffer`] 负责出站消息的排队、刷新切分、部分写记账与水位线背压；
//! - [`RecvBufferAllocator`] 与 [`MessageSizeEstimator`] 是通道配置中可替换的策略对象。

mod estimator;
mod message;
mod outbound;
mod recv;

pub use estimator::{DefaultMessageSizeEstimator, MessageSizeEstimator};
pub use message::PipelineMessage;
pub use outbound::{IgnoreWritability, OutboundBuffer, WritabilityListener};
pub use recv::{
    AdaptiveRecvBufferAllocator, FixedRecvBufferAllocator, RecvBufferAllocator, RecvBufferHandle,
};
