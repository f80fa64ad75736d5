//! 处理器上下文：管线链表中的节点。
//!
//! # 设计意图（Why）
//! - 入站事件沿 `next` 方向寻找下一个具备入站能力的节点，出站操作沿 `prev` 方向寻找出站节点；
//! - 链表指针用 `ArcSwapOption` 存放，传播路径只做原子加载，结构修改在管线的互斥锁内完成；
//! - 已摘除的节点保留自己的 `next`/`prev`，正在途中的事件仍能越过它继续传播。
//!
//! # 执行说明（How）
//! - 每次调用处理器前检查目标节点的执行器：不在其线程上时整体打包为任务提交；
//!   提交被拒绝时，入站事件记录告警后丢弃，出站操作以拒绝原因完成 Promise；
//! - 节点尚未完成 `handler_added` 时，不调用其处理器而直接转发。

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;

use crate::buffer::PipelineMessage;
use crate::channel::Channel;
use crate::error::{CoreError, Result, codes};
use crate::future::{ChannelFuture, ChannelPromise, VoidPromise};
use crate::observability::TARGET_PIPELINE;
use crate::runtime::EventExecutor;

use super::event::UserEvent;
use super::handler::{self, Handler, InboundHandler, OutboundHandler};

const INIT: u8 = 0;
const ADD_PENDING: u8 = 1;
const ADD_COMPLETE: u8 = 2;
const REMOVE_COMPLETE: u8 = 3;

/// 上下文的生命周期阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerState {
    /// 已创建，尚未安排 `handler_added`。
    Init,
    /// `handler_added` 已排队（通道未注册或需要切换执行器）。
    AddPending,
    /// `handler_added` 已执行，处理器开始接收事件。
    AddComplete,
    /// 已移除，不再接收事件。
    RemoveComplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContextKind {
    Head,
    Tail,
    User,
}

pub(crate) enum InboundEvent {
    Registered,
    Unregistered,
    Active,
    Inactive,
    Read(PipelineMessage),
    ReadComplete,
    UserEvent(UserEvent),
    WritabilityChanged,
    ExceptionCaught(CoreError),
}

impl InboundEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::Registered => "channel_registered",
            Self::Unregistered => "channel_unregistered",
            Self::Active => "channel_active",
            Self::Inactive => "channel_inactive",
            Self::Read(_) => "channel_read",
            Self::ReadComplete => "channel_read_complete",
            Self::UserEvent(_) => "user_event_triggered",
            Self::WritabilityChanged => "channel_writability_changed",
            Self::ExceptionCaught(_) => "exception_caught",
        }
    }
}

pub(crate) enum OutboundOp {
    Bind(SocketAddr, ChannelPromise),
    Connect(SocketAddr, Option<SocketAddr>, ChannelPromise),
    Disconnect(ChannelPromise),
    Close(ChannelPromise),
    Deregister(ChannelPromise),
    Read,
    Write(PipelineMessage, ChannelPromise),
    Flush,
    WriteAndFlush(PipelineMessage, ChannelPromise),
}

impl OutboundOp {
    fn promise(&self) -> Option<&ChannelPromise> {
        match self {
            Self::Bind(_, promise)
            | Self::Connect(_, _, promise)
            | Self::Disconnect(promise)
            | Self::Close(promise)
            | Self::Deregister(promise)
            | Self::Write(_, promise)
            | Self::WriteAndFlush(_, promise) => Some(promise),
            Self::Read | Self::Flush => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Bind(..) => "bind",
            Self::Connect(..) => "connect",
            Self::Disconnect(_) => "disconnect",
            Self::Close(_) => "close",
            Self::Deregister(_) => "deregister",
            Self::Read => "read",
            Self::Write(..) => "write",
            Self::Flush => "flush",
            Self::WriteAndFlush(..) => "write_and_flush",
        }
    }

    /// 操作无法送达时的收尾：有 Promise 的以 `err` 失败，其余只记录。
    fn abandon(self, err: CoreError) {
        match self.promise() {
            Some(promise) => promise.safe_failure(err),
            None => tracing::debug!(
                target: TARGET_PIPELINE,
                operation = self.name(),
                error = %err,
                "出站操作无法送达，已丢弃"
            ),
        }
    }
}

/// 处理器在管线中的位置与传播入口。
pub struct HandlerContext {
    name: String,
    kind: ContextKind,
    handler: Handler,
    inbound: Option<Arc<dyn InboundHandler>>,
    outbound: Option<Arc<dyn OutboundHandler>>,
    executor: Option<Arc<dyn EventExecutor>>,
    channel: Weak<Channel>,
    state: AtomicU8,
    pub(crate) next: ArcSwapOption<HandlerContext>,
    pub(crate) prev: ArcSwapOption<HandlerContext>,
    self_ref: Weak<HandlerContext>,
}

impl HandlerContext {
    pub(crate) fn new(
        name: String,
        handler: Handler,
        executor: Option<Arc<dyn EventExecutor>>,
        channel: Weak<Channel>,
        kind: ContextKind,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name,
            kind,
            inbound: handler.inbound_view(),
            outbound: handler.outbound_view(),
            handler,
            executor,
            channel,
            state: AtomicU8::new(INIT),
            next: ArcSwapOption::empty(),
            prev: ArcSwapOption::empty(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// 所属通道；通道已释放时返回 `None`。
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    /// 本节点使用的执行器：显式指定的优先，否则为通道当前的事件循环。
    pub fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.executor
            .clone()
            .or_else(|| self.channel.upgrade().and_then(|channel| channel.event_loop()))
    }

    /// 指向自身的强引用，便于处理器保存上下文以便稍后写出。
    pub fn handle(&self) -> Option<Arc<HandlerContext>> {
        self.self_ref.upgrade()
    }

    pub fn state(&self) -> HandlerState {
        match self.state.load(Ordering::Acquire) {
            INIT => HandlerState::Init,
            ADD_PENDING => HandlerState::AddPending,
            ADD_COMPLETE => HandlerState::AddComplete,
            _ => HandlerState::RemoveComplete,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.state.load(Ordering::Acquire) == REMOVE_COMPLETE
    }

    pub fn new_promise(&self) -> ChannelFuture {
        ChannelFuture::new()
    }

    /// 失败时进入管线异常路径的 Void Promise。
    pub fn void_promise(&self) -> ChannelPromise {
        VoidPromise::for_channel(self.channel.clone()).into()
    }

    pub(crate) fn kind(&self) -> ContextKind {
        self.kind
    }

    pub(crate) fn set_add_pending(&self) {
        let _ = self
            .state
            .compare_exchange(INIT, ADD_PENDING, Ordering::AcqRel, Ordering::Acquire);
    }

    /// 进入 `AddComplete`；已移除的节点保持移除状态并返回 `false`。
    pub(crate) fn set_add_complete(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != REMOVE_COMPLETE).then_some(ADD_COMPLETE)
            })
            .is_ok()
    }

    pub(crate) fn set_removed(&self) {
        if self.state.swap(REMOVE_COMPLETE, Ordering::AcqRel) != REMOVE_COMPLETE {
            handler::release(&self.handler);
        }
    }

    pub(crate) fn call_handler_added(&self) -> Result<()> {
        if self.set_add_complete() {
            self.handler.base().handler_added(self)
        } else {
            Ok(())
        }
    }

    /// 只有 `handler_added` 已执行过的处理器才会收到 `handler_removed`；无论结果如何都标记为已移除。
    pub(crate) fn call_handler_removed(&self) -> Result<()> {
        let result = if self.state.load(Ordering::Acquire) == ADD_COMPLETE {
            self.handler.base().handler_removed(self)
        } else {
            Ok(())
        };
        self.set_removed();
        result
    }

    fn invokes_handler(&self) -> bool {
        self.state.load(Ordering::Acquire) == ADD_COMPLETE
    }

    fn find_inbound(&self) -> Option<Arc<HandlerContext>> {
        let mut cursor = self.next.load_full();
        while let Some(ctx) = cursor {
            if ctx.inbound.is_some() {
                return Some(ctx);
            }
            cursor = ctx.next.load_full();
        }
        None
    }

    fn find_outbound(&self) -> Option<Arc<HandlerContext>> {
        let mut cursor = self.prev.load_full();
        while let Some(ctx) = cursor {
            if ctx.outbound.is_some() {
                return Some(ctx);
            }
            cursor = ctx.prev.load_full();
        }
        None
    }

    // ---- 入站 ----

    pub fn fire_channel_registered(&self) {
        self.fire_inbound(InboundEvent::Registered);
    }

    pub fn fire_channel_unregistered(&self) {
        self.fire_inbound(InboundEvent::Unregistered);
    }

    pub fn fire_channel_active(&self) {
        self.fire_inbound(InboundEvent::Active);
    }

    pub fn fire_channel_inactive(&self) {
        self.fire_inbound(InboundEvent::Inactive);
    }

    pub fn fire_channel_read(&self, msg: PipelineMessage) {
        self.fire_inbound(InboundEvent::Read(msg));
    }

    pub fn fire_channel_read_complete(&self) {
        self.fire_inbound(InboundEvent::ReadComplete);
    }

    pub fn fire_user_event_triggered(&self, event: UserEvent) {
        self.fire_inbound(InboundEvent::UserEvent(event));
    }

    pub fn fire_channel_writability_changed(&self) {
        self.fire_inbound(InboundEvent::WritabilityChanged);
    }

    pub fn fire_exception_caught(&self, cause: CoreError) {
        self.fire_inbound(InboundEvent::ExceptionCaught(cause));
    }

    fn fire_inbound(&self, event: InboundEvent) {
        match self.find_inbound() {
            Some(next) => Self::invoke_inbound(next, event),
            None => tracing::debug!(
                target: TARGET_PIPELINE,
                event = event.name(),
                context = %self.name,
                "入站事件后方已无节点，已丢弃"
            ),
        }
    }

    /// 在 `ctx` 上处理入站事件，必要时切换到其执行器。
    pub(crate) fn invoke_inbound(ctx: Arc<HandlerContext>, event: InboundEvent) {
        match ctx.executor() {
            Some(executor) if !executor.in_event_loop() => {
                let event_name = event.name();
                let context = ctx.name.clone();
                let task = Box::new(move || ctx.handle_inbound(event));
                if let Err(err) = executor.execute(task) {
                    tracing::warn!(
                        target: TARGET_PIPELINE,
                        event = event_name,
                        context = %context,
                        error = %err,
                        "执行器拒绝了入站事件，事件已丢弃"
                    );
                }
            }
            _ => ctx.handle_inbound(event),
        }
    }

    fn handle_inbound(&self, event: InboundEvent) {
        let handler = match &self.inbound {
            Some(handler) if self.invokes_handler() => Arc::clone(handler),
            _ => return self.fire_inbound(event),
        };
        match event {
            InboundEvent::Registered => handler.channel_registered(self),
            InboundEvent::Unregistered => handler.channel_unregistered(self),
            InboundEvent::Active => handler.channel_active(self),
            InboundEvent::Inactive => handler.channel_inactive(self),
            InboundEvent::Read(msg) => handler.channel_read(self, msg),
            InboundEvent::ReadComplete => handler.channel_read_complete(self),
            InboundEvent::UserEvent(event) => handler.user_event_triggered(self, event),
            InboundEvent::WritabilityChanged => handler.channel_writability_changed(self),
            InboundEvent::ExceptionCaught(cause) => handler.exception_caught(self, cause),
        }
    }

    // ---- 出站 ----

    pub fn bind(&self, local: SocketAddr, promise: ChannelPromise) {
        self.fire_outbound(OutboundOp::Bind(local, promise));
    }

    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: ChannelPromise) {
        self.fire_outbound(OutboundOp::Connect(remote, local, promise));
    }

    /// 传输不区分断开与关闭时，断开按关闭处理。
    pub fn disconnect(&self, promise: ChannelPromise) {
        let has_disconnect = self
            .channel
            .upgrade()
            .is_none_or(|channel| channel.metadata().has_disconnect());
        if has_disconnect {
            self.fire_outbound(OutboundOp::Disconnect(promise));
        } else {
            self.fire_outbound(OutboundOp::Close(promise));
        }
    }

    pub fn close(&self, promise: ChannelPromise) {
        self.fire_outbound(OutboundOp::Close(promise));
    }

    pub fn deregister(&self, promise: ChannelPromise) {
        self.fire_outbound(OutboundOp::Deregister(promise));
    }

    pub fn read(&self) {
        self.fire_outbound(OutboundOp::Read);
    }

    pub fn write(&self, msg: PipelineMessage, promise: ChannelPromise) {
        self.fire_outbound(OutboundOp::Write(msg, promise));
    }

    pub fn flush(&self) {
        self.fire_outbound(OutboundOp::Flush);
    }

    pub fn write_and_flush(&self, msg: PipelineMessage, promise: ChannelPromise) {
        self.fire_outbound(OutboundOp::WriteAndFlush(msg, promise));
    }

    fn fire_outbound(&self, op: OutboundOp) {
        if op.promise().is_some_and(ChannelPromise::is_cancelled) {
            return;
        }
        match self.find_outbound() {
            Some(prev) => Self::invoke_outbound(prev, op),
            None => op.abandon(CoreError::closed_channel(
                "pipeline outbound",
                None,
            )),
        }
    }

    pub(crate) fn invoke_outbound(ctx: Arc<HandlerContext>, op: OutboundOp) {
        match ctx.executor() {
            None => op.abandon(CoreError::new(
                codes::CHANNEL_NOT_REGISTERED,
                "通道尚未注册到事件循环",
            )),
            Some(executor) if executor.in_event_loop() => ctx.handle_outbound(op),
            Some(executor) => {
                let promise = op.promise().cloned();
                let name = op.name();
                let task = Box::new(move || ctx.handle_outbound(op));
                if let Err(err) = executor.execute(task) {
                    match promise {
                        Some(promise) => promise.safe_failure(err),
                        None => tracing::warn!(
                            target: TARGET_PIPELINE,
                            operation = name,
                            error = %err,
                            "执行器拒绝了出站操作"
                        ),
                    }
                }
            }
        }
    }

    fn handle_outbound(&self, op: OutboundOp) {
        let handler = match &self.outbound {
            Some(handler) if self.invokes_handler() => Arc::clone(handler),
            _ => return self.fire_outbound(op),
        };
        let promise = op.promise().cloned();
        let result = match op {
            OutboundOp::Bind(local, promise) => handler.bind(self, local, promise),
            OutboundOp::Connect(remote, local, promise) => {
                handler.connect(self, remote, local, promise)
            }
            OutboundOp::Disconnect(promise) => handler.disconnect(self, promise),
            OutboundOp::Close(promise) => handler.close(self, promise),
            OutboundOp::Deregister(promise) => handler.deregister(self, promise),
            OutboundOp::Read => handler.read(self),
            OutboundOp::Write(msg, promise) => handler.write(self, msg, promise),
            OutboundOp::Flush => handler.flush(self),
            OutboundOp::WriteAndFlush(msg, promise) => handler
                .write(self, msg, promise)
                .and_then(|()| handler.flush(self)),
        };
        if let Err(err) = result {
            match promise {
                Some(promise) => promise.safe_failure(err),
                None => self.notify_handler_exception(err),
            }
        }
    }

    /// 出站处理器自身报告的错误：若本节点也能处理入站，交给它的 `exception_caught`。
    fn notify_handler_exception(&self, err: CoreError) {
        match &self.inbound {
            Some(handler) if self.invokes_handler() => handler.exception_caught(self, err),
            _ => self.fire_exception_caught(err),
        }
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("name", &self.name)
            .field("handler", &self.handler)
            .field("state", &self.state())
            .finish()
    }
}
