//! 处理器契约。
//!
//! # 设计意图（Why）
//! - 入站与出站是两套独立的回调集合，处理器按需实现其一或两者；
//! - 注册时用 [`Handler`] 的变体声明能力（仅入站 / 仅出站 / 双向），上下文创建时解析一次，
//!   事件传播阶段不再做类型探测。
//!
//! # 契约说明（What）
//! - 所有默认实现都把事件原样转发给下一个具备相应能力的上下文；
//! - 出站回调返回 `Err` 时，上下文会用该错误完成对应操作的 Promise；
//!   无 Promise 的 `read`/`flush` 则进入异常路径；
//! - 未声明 [`ChannelHandler::is_shareable`] 的处理器实例同一时间只能挂在一个上下文上。

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use crate::buffer::PipelineMessage;
use crate::error::{CoreError, Result, codes};
use crate::future::ChannelPromise;

use super::context::HandlerContext;
use super::event::UserEvent;

/// 所有处理器共享的生命周期回调。
pub trait ChannelHandler: Send + Sync + 'static {
    /// 处理器已加入管线并即将开始接收事件。
    fn handler_added(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    /// 处理器已从管线移除，不会再接收事件。
    fn handler_removed(&self, _ctx: &HandlerContext) -> Result<()> {
        Ok(())
    }

    /// 同一实例能否同时挂在多个上下文上。
    fn is_shareable(&self) -> bool {
        false
    }

    /// 用于生成默认名称与日志的类型名。
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// 入站事件回调。
pub trait InboundHandler: ChannelHandler {
    fn channel_registered(&self, ctx: &HandlerContext) {
        ctx.fire_channel_registered();
    }

    fn channel_unregistered(&self, ctx: &HandlerContext) {
        ctx.fire_channel_unregistered();
    }

    fn channel_active(&self, ctx: &HandlerContext) {
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &HandlerContext) {
        ctx.fire_channel_inactive();
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&self, ctx: &HandlerContext) {
        ctx.fire_channel_read_complete();
    }

    fn user_event_triggered(&self, ctx: &HandlerContext, event: UserEvent) {
        ctx.fire_user_event_triggered(event);
    }

    fn channel_writability_changed(&self, ctx: &HandlerContext) {
        ctx.fire_channel_writability_changed();
    }

    fn exception_caught(&self, ctx: &HandlerContext, cause: CoreError) {
        ctx.fire_exception_caught(cause);
    }
}

/// 出站操作回调。
pub trait OutboundHandler: ChannelHandler {
    fn bind(&self, ctx: &HandlerContext, local: SocketAddr, promise: ChannelPromise) -> Result<()> {
        ctx.bind(local, promise);
        Ok(())
    }

    fn connect(
        &self,
        ctx: &HandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.connect(remote, local, promise);
        Ok(())
    }

    fn disconnect(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.disconnect(promise);
        Ok(())
    }

    fn close(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.close(promise);
        Ok(())
    }

    fn deregister(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        ctx.deregister(promise);
        Ok(())
    }

    fn read(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.read();
        Ok(())
    }

    fn write(&self, ctx: &HandlerContext, msg: PipelineMessage, promise: ChannelPromise) -> Result<()> {
        ctx.write(msg, promise);
        Ok(())
    }

    fn flush(&self, ctx: &HandlerContext) -> Result<()> {
        ctx.flush();
        Ok(())
    }
}

/// 同时处理入站与出站的处理器。
pub trait DuplexHandler: InboundHandler + OutboundHandler {}

impl<T> DuplexHandler for T where T: InboundHandler + OutboundHandler {}

/// 处理器具备的能力。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerCapability {
    Inbound,
    Outbound,
    Duplex,
}

impl HandlerCapability {
    pub const fn is_inbound(self) -> bool {
        matches!(self, Self::Inbound | Self::Duplex)
    }

    pub const fn is_outbound(self) -> bool {
        matches!(self, Self::Outbound | Self::Duplex)
    }
}

/// 带能力标签的处理器注册值。
///
/// 变体内的 `Arc` 可以直接由具体类型的 `Arc` 转换得到，调用方保留一份克隆即可在测试中观察处理器状态。
#[derive(Clone)]
pub enum Handler {
    Inbound(Arc<dyn InboundHandler>),
    Outbound(Arc<dyn OutboundHandler>),
    Duplex(Arc<dyn DuplexHandler>),
}

impl Handler {
    pub fn inbound(handler: impl InboundHandler) -> Self {
        Self::Inbound(Arc::new(handler))
    }

    pub fn outbound(handler: impl OutboundHandler) -> Self {
        Self::Outbound(Arc::new(handler))
    }

    pub fn duplex(handler: impl DuplexHandler) -> Self {
        Self::Duplex(Arc::new(handler))
    }

    pub fn capability(&self) -> HandlerCapability {
        match self {
            Self::Inbound(_) => HandlerCapability::Inbound,
            Self::Outbound(_) => HandlerCapability::Outbound,
            Self::Duplex(_) => HandlerCapability::Duplex,
        }
    }

    /// 生命周期回调视图。
    pub fn base(&self) -> &dyn ChannelHandler {
        match self {
            Self::Inbound(handler) => &**handler,
            Self::Outbound(handler) => &**handler,
            Self::Duplex(handler) => &**handler,
        }
    }

    pub(crate) fn inbound_view(&self) -> Option<Arc<dyn InboundHandler>> {
        match self {
            Self::Inbound(handler) => Some(Arc::clone(handler)),
            Self::Duplex(handler) => Some(Arc::clone(handler) as Arc<dyn InboundHandler>),
            Self::Outbound(_) => None,
        }
    }

    pub(crate) fn outbound_view(&self) -> Option<Arc<dyn OutboundHandler>> {
        match self {
            Self::Outbound(handler) => Some(Arc::clone(handler)),
            Self::Duplex(handler) => Some(Arc::clone(handler) as Arc<dyn OutboundHandler>),
            Self::Inbound(_) => None,
        }
    }

    pub fn is_shareable(&self) -> bool {
        self.base().is_shareable()
    }

    pub fn type_name(&self) -> &'static str {
        self.base().type_name()
    }

    /// 去掉模块路径与泛型参数后的类型名。
    pub fn simple_name(&self) -> &'static str {
        simple_type_name(self.type_name())
    }

    /// 处理器实例的地址标识。
    pub fn identity(&self) -> usize {
        match self {
            Self::Inbound(handler) => Arc::as_ptr(handler) as *const () as usize,
            Self::Outbound(handler) => Arc::as_ptr(handler) as *const () as usize,
            Self::Duplex(handler) => Arc::as_ptr(handler) as *const () as usize,
        }
    }

    /// 是否为同一处理器实例。
    pub fn same_instance(&self, other: &Handler) -> bool {
        self.identity() == other.identity()
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("type", &self.simple_name())
            .field("capability", &self.capability())
            .finish()
    }
}

pub(crate) fn simple_type_name(full: &'static str) -> &'static str {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

// 当前挂在某个上下文上的非共享处理器实例。
static EXCLUSIVE_IN_USE: LazyLock<Mutex<HashSet<usize>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// 登记非共享处理器，重复登记返回 `pipeline.handler_not_shareable`。
pub(crate) fn claim(handler: &Handler) -> Result<()> {
    if handler.is_shareable() {
        return Ok(());
    }
    if EXCLUSIVE_IN_USE.lock().insert(handler.identity()) {
        Ok(())
    } else {
        Err(CoreError::new(
            codes::PIPELINE_HANDLER_NOT_SHAREABLE,
            format!(
                "{} 未声明可共享，不能被重复添加",
                handler.simple_name()
            ),
        ))
    }
}

pub(crate) fn release(handler: &Handler) {
    if !handler.is_shareable() {
        EXCLUSIVE_IN_USE.lock().remove(&handler.identity());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;
    impl ChannelHandler for Plain {}
    impl InboundHandler for Plain {}

    struct Generic<T>(std::marker::PhantomData<fn() -> T>);
    impl<T: 'static> ChannelHandler for Generic<T> {}
    impl<T: 'static> OutboundHandler for Generic<T> {}

    #[test]
    fn simple_name_strips_path_and_generics() {
        assert_eq!(Handler::inbound(Plain).simple_name(), "Plain");
        let generic = Handler::outbound(Generic::<Vec<u8>>(std::marker::PhantomData));
        assert_eq!(generic.simple_name(), "Generic");
    }

    #[test]
    fn exclusive_claim_is_released() {
        let handler = Handler::inbound(Plain);
        claim(&handler).expect("首次登记成功");
        let err = claim(&handler).expect_err("重复登记应失败");
        assert_eq!(err.code(), codes::PIPELINE_HANDLER_NOT_SHAREABLE);
        release(&handler);
        claim(&handler).expect("释放后可再次登记");
        release(&handler);
    }
}
