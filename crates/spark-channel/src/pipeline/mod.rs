//! 处理器管线：入站事件与出站操作的传播链。

mod context;
mod event;
mod handler;
#[allow(clippy::module_inception)]
mod pipeline;
mod sentinel;

pub use context::{HandlerContext, HandlerState};
pub use event::UserEvent;
pub use handler::{
    ChannelHandler, DuplexHandler, Handler, HandlerCapability, InboundHandler, OutboundHandler,
};
pub use pipeline::ChannelPipeline;
