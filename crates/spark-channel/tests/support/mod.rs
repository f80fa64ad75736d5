//! 集成测试共用的记录型处理器与通道构造工具。

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use spark_channel::buffer::PipelineMessage;
use spark_channel::error::Result;
use spark_channel::future::ChannelPromise;
use spark_channel::pipeline::{
    ChannelHandler, HandlerContext, InboundHandler, OutboundHandler, UserEvent,
};
use spark_channel::runtime::EmbeddedEventLoop;
use spark_channel::transport::EmbeddedTransport;
use spark_channel::{Channel, CoreError, EventExecutor};

pub const LOCAL: &str = "127.0.0.1:7000";
pub const REMOTE: &str = "127.0.0.1:9000";

pub fn addr(text: &str) -> SocketAddr {
    text.parse().expect("测试地址应合法")
}

/// 多个处理器共享的事件日志。
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().expect("日志锁不应中毒").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().expect("日志锁不应中毒").clone()
    }

    pub fn clear(&self) {
        self.0.lock().expect("日志锁不应中毒").clear();
    }

    /// 只保留以 `prefix:` 开头的条目，并去掉前缀。
    pub fn of(&self, prefix: &str) -> Vec<String> {
        let marker = format!("{prefix}:");
        self.entries()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix(&marker).map(str::to_owned))
            .collect()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|recorded| *recorded == entry).count()
    }
}

/// 记录所有回调并原样转发的双向处理器。
pub struct Recorder {
    label: &'static str,
    log: EventLog,
    shareable: bool,
}

impl Recorder {
    pub fn new(label: &'static str, log: &EventLog) -> Self {
        Self {
            label,
            log: log.clone(),
            shareable: false,
        }
    }

    pub fn shareable(mut self) -> Self {
        self.shareable = true;
        self
    }

    fn record(&self, what: impl AsRef<str>) {
        self.log.push(format!("{}:{}", self.label, what.as_ref()));
    }
}

impl ChannelHandler for Recorder {
    fn handler_added(&self, _ctx: &HandlerContext) -> Result<()> {
        self.record("added");
        Ok(())
    }

    fn handler_removed(&self, _ctx: &HandlerContext) -> Result<()> {
        self.record("removed");
        Ok(())
    }

    fn is_shareable(&self) -> bool {
        self.shareable
    }
}

impl InboundHandler for Recorder {
    fn channel_registered(&self, ctx: &HandlerContext) {
        self.record("registered");
        ctx.fire_channel_registered();
    }

    fn channel_unregistered(&self, ctx: &HandlerContext) {
        self.record("unregistered");
        ctx.fire_channel_unregistered();
    }

    fn channel_active(&self, ctx: &HandlerContext) {
        self.record("active");
        ctx.fire_channel_active();
    }

    fn channel_inactive(&self, ctx: &HandlerContext) {
        self.record("inactive");
        ctx.fire_channel_inactive();
    }

    fn channel_read(&self, ctx: &HandlerContext, msg: PipelineMessage) {
        match msg.as_bytes() {
            Some(bytes) => self.record(format!("read:{}", String::from_utf8_lossy(bytes))),
            None => self.record("read:user"),
        }
        ctx.fire_channel_read(msg);
    }

    fn channel_read_complete(&self, ctx: &HandlerContext) {
        self.record("read_complete");
        ctx.fire_channel_read_complete();
    }

    fn user_event_triggered(&self, ctx: &HandlerContext, event: UserEvent) {
        if event.is_output_shutdown() {
            self.record("event:output_shutdown");
        } else {
            self.record("event:application");
        }
        ctx.fire_user_event_triggered(event);
    }

    fn channel_writability_changed(&self, ctx: &HandlerContext) {
        let writable = ctx.channel().is_some_and(|channel| channel.is_writable());
        self.record(format!("writable:{writable}"));
        ctx.fire_channel_writability_changed();
    }

    fn exception_caught(&self, ctx: &HandlerContext, cause: CoreError) {
        self.record(format!("exception:{}", cause.code()));
        ctx.fire_exception_caught(cause);
    }
}

impl OutboundHandler for Recorder {
    fn bind(&self, ctx: &HandlerContext, local: SocketAddr, promise: ChannelPromise) -> Result<()> {
        self.record("bind");
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
        self.record("connect");
        ctx.connect(remote, local, promise);
        Ok(())
    }

    fn disconnect(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        self.record("disconnect");
        ctx.disconnect(promise);
        Ok(())
    }

    fn close(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        self.record("close");
        ctx.close(promise);
        Ok(())
    }

    fn deregister(&self, ctx: &HandlerContext, promise: ChannelPromise) -> Result<()> {
        self.record("deregister");
        ctx.deregister(promise);
        Ok(())
    }

    fn read(&self, ctx: &HandlerContext) -> Result<()> {
        self.record("read_request");
        ctx.read();
        Ok(())
    }

    fn write(&self, ctx: &HandlerContext, msg: PipelineMessage, promise: ChannelPromise) -> Result<()> {
        self.record("write");
        ctx.write(msg, promise);
        Ok(())
    }

    fn flush(&self, ctx: &HandlerContext) -> Result<()> {
        self.record("flush");
        ctx.flush();
        Ok(())
    }
}

/// 吞掉异常并记录错误码，避免尾部告警干扰断言。
pub struct ExceptionSink {
    log: EventLog,
}

impl ExceptionSink {
    pub fn new(log: &EventLog) -> Self {
        Self { log: log.clone() }
    }
}

impl ChannelHandler for ExceptionSink {}

impl InboundHandler for ExceptionSink {
    fn exception_caught(&self, _ctx: &HandlerContext, cause: CoreError) {
        self.log.push(format!("sink:{}", cause.code()));
    }
}

/// 在内嵌事件循环上注册好的通道。
pub struct Harness {
    pub channel: Arc<Channel>,
    pub transport: EmbeddedTransport,
    pub event_loop: Arc<EmbeddedEventLoop>,
}

impl Harness {
    /// 未注册的通道，便于先装配管线。
    pub fn unregistered(transport: EmbeddedTransport) -> Self {
        Self {
            channel: Channel::new(transport.clone()),
            transport,
            event_loop: EmbeddedEventLoop::new(),
        }
    }

    pub fn register(&self) {
        let registered = self
            .channel
            .register(Arc::clone(&self.event_loop) as Arc<dyn EventExecutor>);
        self.event_loop.run_pending_tasks();
        assert!(registered.is_success(), "注册应成功: {:?}", registered.cause());
    }

    /// 已注册、已连接的通道。
    pub fn connected() -> Self {
        let harness = Self::unregistered(EmbeddedTransport::connected(addr(LOCAL), addr(REMOTE)));
        harness.register();
        harness
    }

    pub fn run(&self) -> usize {
        self.event_loop.run_pending_tasks()
    }
}
