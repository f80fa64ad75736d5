//! 通道管线：头尾哨兵之间的处理器双向链表。
//!
//! # 设计意图（Why）
//! - 事件传播完全无锁：节点间通过 `ArcSwapOption` 指针相连，传播过程中只做原子加载；
//! - 结构修改（增删替换）由一把 `spin::Mutex` 串行化，锁内只改指针，不调用任何处理器回调。
//!
//! # 契约说明（What）
//! - 名称在管线内唯一；未指定名称时生成 `类型名#序号`；
//! - 通道首次注册前添加/移除的处理器，其 `handler_added`/`handler_removed` 会排队，
//!   注册时按入队顺序执行；注册之后的修改立即在节点执行器上回调；
//! - `handler_added` 失败的处理器会被摘除，并以 `pipeline.handler_added_failed` 触发异常事件；
//! - 入站事件从头部开始传播，出站操作从尾部开始传播。
//!
//! # 执行说明（How）
//! - 通道注销且已关闭后，头部调用 [`ChannelPipeline::destroy`]：
//!   先自头向尾依次跳转到各节点的执行器，再自尾向头逐个摘除并回调 `handler_removed`。

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use spin::Mutex;

use crate::buffer::PipelineMessage;
use crate::channel::Channel;
use crate::error::{CoreError, Result, codes};
use crate::future::{ChannelFuture, ChannelPromise};
use crate::observability::TARGET_PIPELINE;
use crate::runtime::{EventExecutor, same_executor};

use super::context::{ContextKind, HandlerContext, InboundEvent};
use super::event::UserEvent;
use super::handler::{self, Handler};
use super::sentinel::{HEAD_NAME, HeadHandler, TAIL_NAME, TailHandler};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Callback {
    Added,
    Removed,
}

#[derive(Default)]
struct MutationState {
    /// 通道是否已完成首次注册；此后不再排队回调。
    registered: bool,
    pending: VecDeque<(Arc<HandlerContext>, Callback)>,
}

enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// 单个通道的处理器管线。
pub struct ChannelPipeline {
    channel: Weak<Channel>,
    head: Arc<HandlerContext>,
    tail: Arc<HandlerContext>,
    mutation: Mutex<MutationState>,
}

impl ChannelPipeline {
    pub(crate) fn new(channel: Weak<Channel>) -> Self {
        let head = HandlerContext::new(
            HEAD_NAME.to_owned(),
            Handler::duplex(HeadHandler),
            None,
            channel.clone(),
            ContextKind::Head,
        );
        let tail = HandlerContext::new(
            TAIL_NAME.to_owned(),
            Handler::inbound(TailHandler),
            None,
            channel.clone(),
            ContextKind::Tail,
        );
        head.next.store(Some(Arc::clone(&tail)));
        tail.prev.store(Some(Arc::clone(&head)));
        head.set_add_complete();
        tail.set_add_complete();
        Self {
            channel,
            head,
            tail,
            mutation: Mutex::new(MutationState::default()),
        }
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    // ---- 结构修改 ----

    pub fn add_first(&self, name: Option<&str>, handler: Handler) -> Result<()> {
        self.add(None, Position::First, name, handler)
    }

    pub fn add_first_on(
        &self,
        executor: Arc<dyn EventExecutor>,
        name: Option<&str>,
        handler: Handler,
    ) -> Result<()> {
        self.add(Some(executor), Position::First, name, handler)
    }

    pub fn add_last(&self, name: Option<&str>, handler: Handler) -> Result<()> {
        self.add(None, Position::Last, name, handler)
    }

    pub fn add_last_on(
        &self,
        executor: Arc<dyn EventExecutor>,
        name: Option<&str>,
        handler: Handler,
    ) -> Result<()> {
        self.add(Some(executor), Position::Last, name, handler)
    }

    pub fn add_before(&self, base: &str, name: Option<&str>, handler: Handler) -> Result<()> {
        self.add(None, Position::Before(base), name, handler)
    }

    pub fn add_before_on(
        &self,
        executor: Arc<dyn EventExecutor>,
        base: &str,
        name: Option<&str>,
        handler: Handler,
    ) -> Result<()> {
        self.add(Some(executor), Position::Before(base), name, handler)
    }

    pub fn add_after(&self, base: &str, name: Option<&str>, handler: Handler) -> Result<()> {
        self.add(None, Position::After(base), name, handler)
    }

    pub fn add_after_on(
        &self,
        executor: Arc<dyn EventExecutor>,
        base: &str,
        name: Option<&str>,
        handler: Handler,
    ) -> Result<()> {
        self.add(Some(executor), Position::After(base), name, handler)
    }

    fn add(
        &self,
        executor: Option<Arc<dyn EventExecutor>>,
        position: Position<'_>,
        name: Option<&str>,
        handler: Handler,
    ) -> Result<()> {
        // 显式指定为通道当前事件循环时不固定，处理器随通道重新注册迁移。
        let executor = executor.filter(|explicit| {
            self.channel
                .upgrade()
                .and_then(|channel| channel.event_loop())
                .is_none_or(|current| !same_executor(explicit, &current))
        });
        let ctx = {
            let mut state = self.mutation.lock();
            let anchor = match position {
                Position::First => Arc::clone(&self.head),
                Position::Last => self.tail.prev.load_full().unwrap_or_else(|| Arc::clone(&self.head)),
                Position::Before(base) => self
                    .find_locked(|ctx| ctx.name() == base)
                    .and_then(|ctx| ctx.prev.load_full())
                    .ok_or_else(|| not_found(base))?,
                Position::After(base) => self
                    .find_locked(|ctx| ctx.name() == base)
                    .ok_or_else(|| not_found(base))?,
            };
            let name = self.resolve_name(name, &handler)?;
            handler::claim(&handler)?;
            let ctx = HandlerContext::new(
                name,
                handler,
                executor,
                self.channel.clone(),
                ContextKind::User,
            );
            link_after(&anchor, &ctx);

            if !state.registered {
                ctx.set_add_pending();
                state.pending.push_back((Arc::clone(&ctx), Callback::Added));
                return Ok(());
            }
            ctx
        };
        self.dispatch_callback(ctx, Callback::Added);
        Ok(())
    }

    /// 按名称移除处理器。
    pub fn remove(&self, name: &str) -> Result<Handler> {
        self.remove_where(name, |ctx| ctx.name() == name)
    }

    /// 按实例移除处理器。
    pub fn remove_handler(&self, handler: &Handler) -> Result<Handler> {
        self.remove_where(handler.simple_name(), |ctx| {
            ctx.handler().same_instance(handler)
        })
    }

    pub fn remove_first(&self) -> Result<Handler> {
        let first = self.first_context().ok_or_else(|| not_found("<first>"))?;
        self.remove_where(first.name(), |ctx| Arc::ptr_eq(&first, ctx))
    }

    pub fn remove_last(&self) -> Result<Handler> {
        let last = self.last_context().ok_or_else(|| not_found("<last>"))?;
        self.remove_where(last.name(), |ctx| Arc::ptr_eq(&last, ctx))
    }

    fn remove_where(
        &self,
        label: &str,
        predicate: impl Fn(&Arc<HandlerContext>) -> bool,
    ) -> Result<Handler> {
        let ctx = {
            let mut state = self.mutation.lock();
            let ctx = self.find_locked(predicate).ok_or_else(|| not_found(label))?;
            unlink(&ctx);
            if !state.registered {
                state.pending.push_back((Arc::clone(&ctx), Callback::Removed));
                return Ok(ctx.handler().clone());
            }
            ctx
        };
        let handler = ctx.handler().clone();
        self.dispatch_callback(ctx, Callback::Removed);
        Ok(handler)
    }

    /// 以新处理器替换 `old_name`，返回被替换的处理器。
    ///
    /// 新节点先收到 `handler_added`，旧节点随后收到 `handler_removed`；
    /// 已经越过旧节点的事件会被转交给新节点。
    pub fn replace(&self, old_name: &str, new_name: Option<&str>, handler: Handler) -> Result<Handler> {
        let (old, new) = {
            let mut state = self.mutation.lock();
            let old = self
                .find_locked(|ctx| ctx.name() == old_name)
                .ok_or_else(|| not_found(old_name))?;
            let name = match new_name {
                Some(name) if name == old_name => name.to_owned(),
                other => self.resolve_name(other, &handler)?,
            };
            handler::claim(&handler)?;
            let new = HandlerContext::new(
                name,
                handler,
                None,
                self.channel.clone(),
                ContextKind::User,
            );
            replace_links(&old, &new);

            if !state.registered {
                new.set_add_pending();
                state.pending.push_back((Arc::clone(&new), Callback::Added));
                state.pending.push_back((Arc::clone(&old), Callback::Removed));
                return Ok(old.handler().clone());
            }
            (old, new)
        };
        let replaced = old.handler().clone();
        let task_old = Arc::clone(&old);
        let task_new = Arc::clone(&new);
        let outcome = self.run_on(&new, move |pipeline| {
            pipeline.call_handler_added0(&task_new);
            pipeline.call_handler_removed0(&task_old);
        });
        if let Err(err) = outcome {
            self.reject_callback(&new, Callback::Added, &err);
            self.reject_callback(&old, Callback::Removed, &err);
        }
        Ok(replaced)
    }

    fn resolve_name(&self, name: Option<&str>, handler: &Handler) -> Result<String> {
        match name {
            Some(name) => {
                if self.find_locked(|ctx| ctx.name() == name).is_some() {
                    return Err(CoreError::new(
                        codes::PIPELINE_DUPLICATE_NAME,
                        format!("处理器名称重复：{name}"),
                    ));
                }
                Ok(name.to_owned())
            }
            None => {
                let base = handler.simple_name();
                let mut index = 0usize;
                loop {
                    let candidate = format!("{base}#{index}");
                    if self.find_locked(|ctx| ctx.name() == candidate).is_none() {
                        return Ok(candidate);
                    }
                    index += 1;
                }
            }
        }
    }

    /// 遍历头尾之间的节点；调用方须持有结构锁。
    fn find_locked(
        &self,
        predicate: impl Fn(&Arc<HandlerContext>) -> bool,
    ) -> Option<Arc<HandlerContext>> {
        let mut cursor = self.head.next.load_full();
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &self.tail) {
                return None;
            }
            if predicate(&ctx) {
                return Some(ctx);
            }
            cursor = ctx.next.load_full();
        }
        None
    }

    // ---- 生命周期回调 ----

    /// 首次注册时执行排队的 `handler_added`/`handler_removed`。
    pub(crate) fn invoke_handler_added_if_needed(&self) {
        let pending = {
            let mut state = self.mutation.lock();
            if state.registered {
                return;
            }
            state.registered = true;
            std::mem::take(&mut state.pending)
        };
        for (ctx, callback) in pending {
            self.dispatch_callback(ctx, callback);
        }
    }

    fn dispatch_callback(&self, ctx: Arc<HandlerContext>, callback: Callback) {
        if callback == Callback::Added && ctx.executor().is_some_and(|e| !e.in_event_loop()) {
            ctx.set_add_pending();
        }
        let task_ctx = Arc::clone(&ctx);
        let outcome = self.run_on(&ctx, move |pipeline| match callback {
            Callback::Added => pipeline.call_handler_added0(&task_ctx),
            Callback::Removed => pipeline.call_handler_removed0(&task_ctx),
        });
        if let Err(err) = outcome {
            self.reject_callback(&ctx, callback, &err);
        }
    }

    fn reject_callback(&self, ctx: &Arc<HandlerContext>, callback: Callback, err: &CoreError) {
        tracing::warn!(
            target: TARGET_PIPELINE,
            context = ctx.name(),
            callback = ?callback,
            error = %err,
            "执行器拒绝了处理器生命周期回调，节点已标记为移除"
        );
        if callback == Callback::Added {
            let _guard = self.mutation.lock();
            self.unlink_if_present(ctx);
        }
        ctx.set_removed();
    }

    /// 在节点执行器上运行 `work`；已在其线程上则同步执行。
    fn run_on<F>(&self, ctx: &Arc<HandlerContext>, work: F) -> Result<()>
    where
        F: FnOnce(&ChannelPipeline) + Send + 'static,
    {
        match ctx.executor() {
            Some(executor) if !executor.in_event_loop() => {
                let channel = self.channel.clone();
                executor.execute(Box::new(move || {
                    if let Some(channel) = channel.upgrade() {
                        work(channel.pipeline());
                    }
                }))
            }
            _ => {
                work(self);
                Ok(())
            }
        }
    }

    fn call_handler_added0(&self, ctx: &Arc<HandlerContext>) {
        let Err(cause) = ctx.call_handler_added() else {
            return;
        };
        let unlinked = {
            let _guard = self.mutation.lock();
            self.unlink_if_present(ctx)
        };
        let type_name = ctx.handler().simple_name();
        let err = match (unlinked, ctx.call_handler_removed()) {
            (true, Ok(())) => CoreError::new(
                codes::PIPELINE_HANDLER_ADDED_FAILED,
                format!("{type_name}.handler_added() 失败，处理器已被移除"),
            ),
            (_, removal) => {
                if let Err(removal) = removal {
                    tracing::warn!(
                        target: TARGET_PIPELINE,
                        context = ctx.name(),
                        error = %removal,
                        "移除 handler_added 失败的处理器时再次出错"
                    );
                }
                CoreError::new(
                    codes::PIPELINE_HANDLER_ADDED_FAILED,
                    format!("{type_name}.handler_added() 失败，且处理器未能被干净地移除"),
                )
            }
        };
        self.fire_exception_caught(err.with_cause(cause));
    }

    fn call_handler_removed0(&self, ctx: &Arc<HandlerContext>) {
        if let Err(cause) = ctx.call_handler_removed() {
            let err = CoreError::new(
                codes::PIPELINE_HANDLER_REMOVED_FAILED,
                format!("{}.handler_removed() 失败", ctx.handler().simple_name()),
            );
            self.fire_exception_caught(err.with_cause(cause));
        }
    }

    /// 仅当节点仍在链上时摘除；调用方须持有结构锁。
    fn unlink_if_present(&self, target: &Arc<HandlerContext>) -> bool {
        if self.find_locked(|ctx| Arc::ptr_eq(ctx, target)).is_some() {
            unlink(target);
            true
        } else {
            false
        }
    }

    /// 通道注销且已关闭后，移除全部用户处理器。
    pub(crate) fn destroy(&self) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if let Some(first) = self.head.next.load_full() {
            destroy_up(channel, first, false);
        }
    }

    fn destroy_step(&self, ctx: &Arc<HandlerContext>) {
        {
            let _guard = self.mutation.lock();
            self.unlink_if_present(ctx);
        }
        self.call_handler_removed0(ctx);
    }

    // ---- 查询 ----

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.context(name).map(|ctx| ctx.handler().clone())
    }

    pub fn context(&self, name: &str) -> Option<Arc<HandlerContext>> {
        let _guard = self.mutation.lock();
        self.find_locked(|ctx| ctx.name() == name)
    }

    pub fn context_of(&self, handler: &Handler) -> Option<Arc<HandlerContext>> {
        let _guard = self.mutation.lock();
        self.find_locked(|ctx| ctx.handler().same_instance(handler))
    }

    pub fn first(&self) -> Option<Handler> {
        self.first_context().map(|ctx| ctx.handler().clone())
    }

    pub fn last(&self) -> Option<Handler> {
        self.last_context().map(|ctx| ctx.handler().clone())
    }

    pub fn first_context(&self) -> Option<Arc<HandlerContext>> {
        self.head
            .next
            .load_full()
            .filter(|ctx| !Arc::ptr_eq(ctx, &self.tail))
    }

    pub fn last_context(&self) -> Option<Arc<HandlerContext>> {
        self.tail
            .prev
            .load_full()
            .filter(|ctx| !Arc::ptr_eq(ctx, &self.head))
    }

    /// 头尾之间处理器的名称，按链表顺序排列。
    pub fn names(&self) -> Vec<String> {
        let _guard = self.mutation.lock();
        let mut names = Vec::new();
        let mut cursor = self.head.next.load_full();
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &self.tail) {
                break;
            }
            names.push(ctx.name().to_owned());
            cursor = ctx.next.load_full();
        }
        names
    }

    pub fn len(&self) -> usize {
        self.names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_context().is_none()
    }

    // ---- 入站事件（自头部开始） ----

    fn fire(&self, event: InboundEvent) -> &Self {
        HandlerContext::invoke_inbound(Arc::clone(&self.head), event);
        self
    }

    pub fn fire_channel_registered(&self) -> &Self {
        self.fire(InboundEvent::Registered)
    }

    pub fn fire_channel_unregistered(&self) -> &Self {
        self.fire(InboundEvent::Unregistered)
    }

    pub fn fire_channel_active(&self) -> &Self {
        self.fire(InboundEvent::Active)
    }

    pub fn fire_channel_inactive(&self) -> &Self {
        self.fire(InboundEvent::Inactive)
    }

    pub fn fire_channel_read(&self, msg: impl Into<PipelineMessage>) -> &Self {
        self.fire(InboundEvent::Read(msg.into()))
    }

    pub fn fire_channel_read_complete(&self) -> &Self {
        self.fire(InboundEvent::ReadComplete)
    }

    pub fn fire_user_event_triggered(&self, event: UserEvent) -> &Self {
        self.fire(InboundEvent::UserEvent(event))
    }

    pub fn fire_channel_writability_changed(&self) -> &Self {
        self.fire(InboundEvent::WritabilityChanged)
    }

    pub fn fire_exception_caught(&self, cause: CoreError) -> &Self {
        self.fire(InboundEvent::ExceptionCaught(cause))
    }

    // ---- 出站操作（自尾部开始） ----

    pub fn bind(&self, local: SocketAddr) -> ChannelFuture {
        let future = ChannelFuture::new();
        self.tail.bind(local, future.clone().into());
        future
    }

    pub fn connect(&self, remote: SocketAddr) -> ChannelFuture {
        self.connect_with_local(remote, None)
    }

    pub fn connect_with_local(&self, remote: SocketAddr, local: Option<SocketAddr>) -> ChannelFuture {
        let future = ChannelFuture::new();
        self.tail.connect(remote, local, future.clone().into());
        future
    }

    pub fn disconnect(&self) -> ChannelFuture {
        let future = ChannelFuture::new();
        self.tail.disconnect(future.clone().into());
        future
    }

    pub fn close(&self) -> ChannelFuture {
        let future = ChannelFuture::new();
        self.close_with(future.clone().into());
        future
    }

    pub fn close_with(&self, promise: ChannelPromise) {
        self.tail.close(promise);
    }

    pub fn deregister(&self) -> ChannelFuture {
        let future = ChannelFuture::new();
        self.tail.deregister(future.clone().into());
        future
    }

    pub fn read(&self) -> &Self {
        self.tail.read();
        self
    }

    pub fn write(&self, msg: impl Into<PipelineMessage>) -> ChannelFuture {
        let future = ChannelFuture::new();
        self.write_with(msg, future.clone().into());
        future
    }

    pub fn write_with(&self, msg: impl Into<PipelineMessage>, promise: ChannelPromise) {
        self.tail.write(msg.into(), promise);
    }

    pub fn flush(&self) -> &Self {
        self.tail.flush();
        self
    }

    pub fn write_and_flush(&self, msg: impl Into<PipelineMessage>) -> ChannelFuture {
        let future = ChannelFuture::new();
        self.write_and_flush_with(msg, future.clone().into());
        future
    }

    pub fn write_and_flush_with(&self, msg: impl Into<PipelineMessage>, promise: ChannelPromise) {
        self.tail.write_and_flush(msg.into(), promise);
    }
}

impl fmt::Debug for ChannelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPipeline")
            .field("handlers", &self.names())
            .finish()
    }
}

impl Drop for ChannelPipeline {
    // 拆开节点间的强引用环，并归还仍在链上的非共享处理器登记。
    fn drop(&mut self) {
        let mut cursor = Some(Arc::clone(&self.head));
        while let Some(ctx) = cursor {
            ctx.prev.store(None);
            if ctx.kind() == ContextKind::User {
                ctx.set_removed();
            }
            cursor = ctx.next.swap(None);
        }
        for (ctx, _) in self.mutation.get_mut().pending.drain(..) {
            ctx.set_removed();
        }
    }
}

fn not_found(name: &str) -> CoreError {
    CoreError::new(
        codes::PIPELINE_HANDLER_NOT_FOUND,
        format!("管线中不存在处理器：{name}"),
    )
}

fn link_after(anchor: &Arc<HandlerContext>, ctx: &Arc<HandlerContext>) {
    let next = anchor.next.load_full();
    ctx.prev.store(Some(Arc::clone(anchor)));
    ctx.next.store(next.clone());
    if let Some(next) = &next {
        next.prev.store(Some(Arc::clone(ctx)));
    }
    anchor.next.store(Some(Arc::clone(ctx)));
}

/// 摘除节点；被摘除的节点保留自身指针，供途中事件继续前进。
fn unlink(ctx: &Arc<HandlerContext>) {
    let prev = ctx.prev.load_full();
    let next = ctx.next.load_full();
    if let Some(prev) = &prev {
        prev.next.store(next.clone());
    }
    if let Some(next) = &next {
        next.prev.store(prev);
    }
}

fn replace_links(old: &Arc<HandlerContext>, new: &Arc<HandlerContext>) {
    let prev = old.prev.load_full();
    let next = old.next.load_full();
    new.prev.store(prev.clone());
    new.next.store(next.clone());
    if let Some(prev) = &prev {
        prev.next.store(Some(Arc::clone(new)));
    }
    if let Some(next) = &next {
        next.prev.store(Some(Arc::clone(new)));
    }
    old.prev.store(Some(Arc::clone(new)));
    old.next.store(Some(Arc::clone(new)));
}

fn destroy_up(channel: Arc<Channel>, start: Arc<HandlerContext>, mut in_event_loop: bool) {
    let mut ctx = start;
    loop {
        if ctx.kind() == ContextKind::Tail {
            if let Some(last) = ctx.prev.load_full() {
                destroy_down(channel, last, in_event_loop);
            }
            return;
        }
        if !in_event_loop
            && let Some(executor) = ctx.executor()
            && !executor.in_event_loop()
        {
            let task_channel = Arc::clone(&channel);
            let task_ctx = Arc::clone(&ctx);
            let submitted =
                executor.execute(Box::new(move || destroy_up(task_channel, task_ctx, true)));
            if submitted.is_ok() {
                return;
            }
        }
        in_event_loop = false;
        let Some(next) = ctx.next.load_full() else {
            return;
        };
        ctx = next;
    }
}

fn destroy_down(channel: Arc<Channel>, start: Arc<HandlerContext>, mut in_event_loop: bool) {
    let mut ctx = start;
    loop {
        if ctx.kind() == ContextKind::Head {
            return;
        }
        if !in_event_loop
            && let Some(executor) = ctx.executor()
            && !executor.in_event_loop()
        {
            let task_channel = Arc::clone(&channel);
            let task_ctx = Arc::clone(&ctx);
            let submitted =
                executor.execute(Box::new(move || destroy_down(task_channel, task_ctx, true)));
            if submitted.is_ok() {
                return;
            }
        }
        let prev = ctx.prev.load_full();
        channel.pipeline().destroy_step(&ctx);
        in_event_loop = false;
        let Some(prev) = prev else {
            return;
        };
        ctx = prev;
    }
}
