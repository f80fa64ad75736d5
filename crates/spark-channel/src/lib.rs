#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "spark-channel: 单线程事件循环上的通道、双向处理器管线与出站写缓冲核心。"]
#![doc = ""]
#![doc = "== 分层 =="]
#![doc = "1. `future`: 一次性完成的 Promise/Future，监听器按注册顺序执行；"]
#![doc = "2. `buffer`: 出站写缓冲与高低水位可写性，以及接收缓冲容量预测；"]
#![doc = "3. `pipeline`: 头尾哨兵之间的处理器上下文链，入站自头向尾、出站自尾向头传播；"]
#![doc = "4. `channel`: 生命周期状态机，把管线出站操作落到 `transport::Transport` 钩子上；"]
#![doc = "5. `runtime`: 事件循环抽象，提供确定性的内嵌循环与独立线程循环两种实现。"]
#![doc = ""]
#![doc = "== 线程模型 =="]
#![doc = "每个通道同一时间只属于一个事件循环。处理器回调默认在通道的循环线程上执行；"]
#![doc = "从其他线程发起的事件或操作会被打包为任务提交到目标循环。"]

pub mod buffer;
pub mod channel;
pub mod configuration;
pub mod error;
pub mod future;
pub mod observability;
pub mod pipeline;
pub mod runtime;
pub mod transport;

pub use buffer::{MessageSizeEstimator, OutboundBuffer, PipelineMessage};
pub use channel::{Channel, ChannelFactory, ChannelId, TransportChannelFactory, Unsafe};
pub use configuration::{ChannelConfig, ChannelOption, WriteBufferWaterMark};
pub use error::{ConnectError, CoreError, Result, codes};
pub use future::{ChannelFuture, ChannelPromise, Promise, VoidPromise};
pub use pipeline::{
    ChannelHandler, ChannelPipeline, DuplexHandler, Handler, HandlerCapability, HandlerContext,
    HandlerState, InboundHandler, OutboundHandler, UserEvent,
};
pub use runtime::{EmbeddedEventLoop, EventExecutor, SingleThreadEventLoop};
pub use transport::{ChannelMetadata, ConnectProgress, EmbeddedTransport, Transport};
