//! 管线两端的哨兵处理器。
//!
//! - 头部：出站操作的终点，把操作交给通道的 Unsafe；入站方向在激活与读完成后按自动读取发起下一次读取。
//! - 尾部：入站事件的终点，释放无人处理的消息并记录告警。

use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::PipelineMessage;
use crate::channel::Channel;
use crate::error::{CoreError, Result};
use crate::future::ChannelPromise;
use crate::observability::TARGET_PIPELINE;

use super::context::HandlerContext;
use super::event::UserEvent;
use super::handler::{ChannelHandler, InboundHandler, OutboundHandler};

pub(crate) const HEAD_NAME: &str = "HeadContext#0";
pub(crate) const TAIL_NAME: &str = "TailContext#0";

pub(crate) struct HeadHandler;

fn bound_channel(ctx: &HandlerContext) -> Result<Arc<Channel>> {
    ctx.channel()
        .ok_or_else(|| CoreError::closed_channel("head", None))
}

fn read_if_auto_read(ctx: &HandlerContext) {
    if let Some(channel) = ctx.channel()
        && channel.config().is_auto_read()
    {
        channel.read();
    }
}

impl ChannelHandler for HeadHandler {
    fn is_shareable(&self) -> bool {
        true
    }
}

impl InboundHandler for HeadHandler {
    fn channel_unregistered(&self, ctx: &HandlerContext) {
        ctx.fire_channel_unregistered();
        if let Some(channel) = ctx.channel()
            && !channel.is_open()
        {
            channel.pipeline().destroy();
        }
    }

    fn channel_active(&self, ctx: &HandlerContext) {
        ctx.fire_channel_active();
        read_if_auto_read(ctx);
    }

    fn channel_read_complete(&self, ctx: &HandlerContext) {
        ctx.fire_channel_read_complete();
        read_if_auto_read(ctx);
    }
}

impl OutboundHandler for HeadHandler {
    fn bind(&self, ctx: &HandlerContext, local: SocketAddr, promise: ChannelPromise) -> Result<()> {
        bound_channel(ctx)?.unsafe_ops().bind(local, promise);
        Ok(())
    }

    fn connect(
        &self,
        ctx: &HandlerContext,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) -> Result<()> {
        bound_channel(ctx)?
            .unsafe_ops()
            .connect(remote, local, promise);
        Ok(())
    }

    fn disconnect(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        bound_channel(ctx)?.unsafe_ops().disconnect(promise);
        Ok(())
    }

    fn close(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        bound_channel(ctx)?.unsafe_ops().close(promise);
        Ok(())
    }

    fn deregister(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        bound_channel(ctx)?.unsafe_ops().deregister(promise);
        Ok(())
    }

    fn read(&self, ctx: &HandlerContext) -> Result<()> {
        bound_channel(ctx)?.unsafe_ops().begin_read();
        Ok(())
    }

    fn write(&self, ctx: &HandlerContext, msg: PipelineMessage, promise: ChannelPromise) -> Result<()> {
        bound_channel(ctx)?.unsafe_ops().write(msg, promise);
        Ok(())
    }

    fn flush(&self, ctx: &HandlerContext) -> Result<()> {
        bound_channel(ctx)?.unsafe_ops().flush();
        Ok(())
    }
}

pub(crate) struct TailHandler;

fn channel_label(ctx: &HandlerContext) -> String {
    ctx.channel()
        .map(|channel| channel.id().as_short_text())
        .unwrap_or_default()
}

impl ChannelHandler for TailHandler {
    fn is_shareable(&self) -> bool {
        true
    }
}

impl InboundHandler for TailHandler {
    fn channel_registered(&self, _ctx: &HandlerContext) {}

    fn channel_unregistered(&self, _ctx: &HandlerContext) {}

    fn channel_active(&self, _ctx: &HandlerContext) {}

    fn channel_inactive(&self, _ctx: &HandlerContext) {}

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
        tracing::debug!(
            target: TARGET_PIPELINE,
            channel = %channel_label(ctx),
            kind = msg.kind(),
            "入站消息到达管线尾部且无人处理，已释放"
        );
    }

    fn channel_read_complete(&self, _ctx: &HandlerContext) {}

    fn user_event_triggered(&self, ctx: &HandlerContext, event: UserEvent) {
        tracing::debug!(
            target: TARGET_PIPELINE,
            channel = %channel_label(ctx),
            event = ?event,
            "用户事件到达管线尾部且无人处理，已丢弃"
        );
    }

    fn channel_writability_changed(&self, _ctx: &HandlerContext) {}

    fn exception_caught(&self, ctx: &HandlerContext, cause: CoreError) {
        tracing::warn!(
            target: TARGET_PIPELINE,
            channel = %channel_label(ctx),
            code = cause.code(),
            error = %cause,
            "异常到达管线尾部且无人处理，请在管线末端添加异常处理器"
        );
    }
}
