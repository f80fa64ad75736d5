use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};

use crate::buffer::{OutboundBuffer, PipelineMessage, WritabilityListener};
use crate::configuration::ChannelConfig;
use crate::error::{CoreError, codes};
use crate::future::{ChannelFuture, ChannelPromise, VoidPromise};
use crate::observability::TARGET_CHANNEL;
use crate::pipeline::ChannelPipeline;
use crate::runtime::{EventExecutor, ScheduledTask};
use crate::transport::{ChannelMetadata, Transport};

use super::ChannelId;

/// 生命周期标志位。
pub(super) struct LifecycleFlags {
    /// `register` 已被受理（含尚在排队的 `register0`）。
    pub(super) registration_claimed: AtomicBool,
    pub(super) registered: AtomicBool,
    pub(super) never_registered: AtomicBool,
    pub(super) close_initiated: AtomicBool,
    pub(super) in_flush0: AtomicBool,
    pub(super) output_shutdown: AtomicBool,
}

impl LifecycleFlags {
    fn new() -> Self {
        Self {
            registration_claimed: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            never_registered: AtomicBool::new(true),
            close_initiated: AtomicBool::new(false),
            in_flush0: AtomicBool::new(false),
            output_shutdown: AtomicBool::new(false),
        }
    }
}

/// 进行中的异步连接。
pub(super) struct PendingConnect {
    pub(super) promise: ChannelPromise,
    pub(super) remote: SocketAddr,
    pub(super) was_active: bool,
    pub(super) timeout: Option<ScheduledTask>,
}

/// 网络通道：传输、配置、管线与出站缓冲的组合体。
///
/// # 设计意图（Why）
/// - 通道本身只编排生命周期：何时调用传输钩子、按什么顺序触发管线事件、如何完成 Promise；
///   具体 I/O 全部委托给 [`Transport`]；
/// - 对外 API 都是非阻塞的，返回 [`ChannelFuture`]；出站操作从管线尾部开始传播。
///
/// # 契约说明（What）
/// - 生命周期：未注册 → 已注册 → 激活 → 未激活 → 已注销，`close` 幂等且只执行一次传输关闭；
/// - 每个通道同一时间只绑定一个事件循环；所有 Unsafe 操作都应在该循环线程上调用；
/// - `close_future` 在传输关闭后完成，且总是以成功完成。
///
/// # 风险提示（Trade-offs）
/// - 通道由 `Arc` 共享；管线节点只持有弱引用，通道释放后残留的上下文操作会以 `channel.closed` 失败。
pub struct Channel {
    id: ChannelId,
    parent: Option<Arc<Channel>>,
    pub(super) transport: Box<dyn Transport>,
    config: Arc<ChannelConfig>,
    pipeline: ChannelPipeline,
    pub(super) event_loop: RwLock<Option<Arc<dyn EventExecutor>>>,
    pub(super) outbound: ArcSwapOption<OutboundBuffer>,
    pub(super) close_future: ChannelFuture,
    /// 首次关闭的传输结果；后续 `close` 调用的 Promise 镜像该结果。
    pub(super) close_outcome: ChannelFuture,
    pub(super) flags: LifecycleFlags,
    pub(super) initial_close_cause: Mutex<Option<CoreError>>,
    pub(super) pending_connect: Mutex<Option<PendingConnect>>,
    local_address: Mutex<Option<SocketAddr>>,
    remote_address: Mutex<Option<SocketAddr>>,
    self_ref: Weak<Channel>,
}

impl Channel {
    pub fn new(transport: impl Transport) -> Arc<Self> {
        Self::build(None, Box::new(transport))
    }

    /// 由父通道（通常是服务端监听通道）派生的子通道。
    pub fn with_parent(parent: &Arc<Channel>, transport: impl Transport) -> Arc<Self> {
        Self::build(Some(Arc::clone(parent)), Box::new(transport))
    }

    pub fn from_boxed(transport: Box<dyn Transport>) -> Arc<Self> {
        Self::build(None, transport)
    }

    fn build(parent: Option<Arc<Channel>>, transport: Box<dyn Transport>) -> Arc<Self> {
        let channel = Arc::new_cyclic(|weak: &Weak<Channel>| {
            let config = Arc::new(ChannelConfig::for_channel(weak.clone()));
            let listener: Arc<dyn WritabilityListener> = Arc::new(PipelineWritability {
                channel: weak.clone(),
            });
            let outbound = OutboundBuffer::new(Arc::clone(&config), listener);
            Self {
                id: ChannelId::new_instance(),
                parent,
                transport,
                config,
                pipeline: ChannelPipeline::new(weak.clone()),
                event_loop: RwLock::new(None),
                outbound: ArcSwapOption::new(Some(Arc::new(outbound))),
                close_future: ChannelFuture::new(),
                close_outcome: ChannelFuture::new(),
                flags: LifecycleFlags::new(),
                initial_close_cause: Mutex::new(None),
                pending_connect: Mutex::new(None),
                local_address: Mutex::new(None),
                remote_address: Mutex::new(None),
                self_ref: weak.clone(),
            }
        });
        tracing::debug!(target: TARGET_CHANNEL, channel = %channel.id, "通道已创建");
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<Channel>> {
        self.parent.as_ref()
    }

    pub fn config(&self) -> &Arc<ChannelConfig> {
        &self.config
    }

    pub fn pipeline(&self) -> &ChannelPipeline {
        &self.pipeline
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    pub fn metadata(&self) -> ChannelMetadata {
        self.transport.metadata()
    }

    /// 当前绑定的事件循环；注册之前为 `None`。
    pub fn event_loop(&self) -> Option<Arc<dyn EventExecutor>> {
        self.event_loop.read().clone()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_active(&self) -> bool {
        self.transport.is_active()
    }

    pub fn is_registered(&self) -> bool {
        self.flags.registered.load(Ordering::Acquire)
    }

    /// 出站缓冲存在且可写。
    pub fn is_writable(&self) -> bool {
        self.outbound
            .load_full()
            .is_some_and(|buffer| buffer.is_writable())
    }

    pub fn bytes_before_unwritable(&self) -> usize {
        self.outbound
            .load_full()
            .map_or(0, |buffer| buffer.bytes_before_unwritable())
    }

    pub fn bytes_before_writable(&self) -> usize {
        self.outbound
            .load_full()
            .map_or(0, |buffer| buffer.bytes_before_writable())
    }

    /// 出站缓冲；关闭或输出半关闭后为 `None`。
    pub fn outbound_buffer(&self) -> Option<Arc<OutboundBuffer>> {
        self.outbound.load_full()
    }

    /// 本端地址，首次取得后缓存。
    pub fn local_address(&self) -> Option<SocketAddr> {
        cached_address(&self.local_address, || self.transport.local_address())
    }

    /// 对端地址，首次取得后缓存；断开连接时清除。
    pub fn remote_address(&self) -> Option<SocketAddr> {
        cached_address(&self.remote_address, || self.transport.remote_address())
    }

    pub(super) fn invalidate_remote_address(&self) {
        *self.remote_address.lock() = None;
    }

    /// 传输关闭后完成，总是成功。
    pub fn close_future(&self) -> ChannelFuture {
        self.close_future.clone()
    }

    pub fn new_promise(&self) -> ChannelFuture {
        ChannelFuture::new()
    }

    /// 失败时进入管线异常路径的 Void Promise。
    pub fn void_promise(&self) -> ChannelPromise {
        VoidPromise::for_channel(self.self_ref.clone()).into()
    }

    pub(crate) fn strong(&self) -> Option<Arc<Channel>> {
        self.self_ref.upgrade()
    }

    pub(crate) fn in_event_loop(&self) -> bool {
        self.event_loop()
            .is_some_and(|event_loop| event_loop.in_event_loop())
    }

    /// 把任务排到事件循环队尾；通道未注册或循环已拒绝时返回错误。
    pub(crate) fn invoke_later<F>(&self, task: F) -> Result<(), CoreError>
    where
        F: FnOnce(&Channel) + Send + 'static,
    {
        let (Some(event_loop), Some(channel)) = (self.event_loop(), self.strong()) else {
            return Err(CoreError::new(
                codes::CHANNEL_NOT_REGISTERED,
                "通道尚未注册到事件循环",
            ));
        };
        event_loop
            .execute(Box::new(move || task(&channel)))
            .inspect_err(|err| {
                tracing::warn!(
                    target: TARGET_CHANNEL,
                    channel = %self.id,
                    error = %err,
                    "事件循环拒绝了延后任务"
                );
            })
    }

    // ---- 便捷操作 ----

    /// 注册到事件循环。
    pub fn register(&self, event_loop: Arc<dyn EventExecutor>) -> ChannelFuture {
        let future = ChannelFuture::new();
        self.unsafe_ops().register(event_loop, future.clone().into());
        future
    }

    pub fn bind(&self, local: SocketAddr) -> ChannelFuture {
        self.pipeline.bind(local)
    }

    pub fn connect(&self, remote: SocketAddr) -> ChannelFuture {
        self.pipeline.connect(remote)
    }

    pub fn connect_with_local(&self, remote: SocketAddr, local: SocketAddr) -> ChannelFuture {
        self.pipeline.connect_with_local(remote, Some(local))
    }

    pub fn disconnect(&self) -> ChannelFuture {
        self.pipeline.disconnect()
    }

    pub fn close(&self) -> ChannelFuture {
        self.pipeline.close()
    }

    pub fn deregister(&self) -> ChannelFuture {
        self.pipeline.deregister()
    }

    pub fn read(&self) {
        self.pipeline.read();
    }

    pub fn write(&self, msg: impl Into<PipelineMessage>) -> ChannelFuture {
        self.pipeline.write(msg)
    }

    pub fn flush(&self) {
        self.pipeline.flush();
    }

    pub fn write_and_flush(&self, msg: impl Into<PipelineMessage>) -> ChannelFuture {
        self.pipeline.write_and_flush(msg)
    }

    /// 关闭输出方向（半关闭），在事件循环上执行。
    pub fn shutdown_output(&self) -> ChannelFuture {
        let future = ChannelFuture::new();
        let promise: ChannelPromise = future.clone().into();
        if self.in_event_loop() {
            self.unsafe_ops().shutdown_output(promise);
            return future;
        }
        let task_promise = promise.clone();
        if let Err(err) =
            self.invoke_later(move |channel| channel.unsafe_ops().shutdown_output(task_promise))
        {
            promise.safe_failure(err);
        }
        future
    }
}

fn cached_address(
    cache: &Mutex<Option<SocketAddr>>,
    query: impl FnOnce() -> Option<SocketAddr>,
) -> Option<SocketAddr> {
    let mut cached = cache.lock();
    if cached.is_none() {
        *cached = query();
    }
    *cached
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id.as_short_text();
        match (self.local_address(), self.remote_address()) {
            (Some(local), Some(remote)) => {
                let arrow = if self.is_active() { "-" } else { "!" };
                write!(f, "[id: 0x{id}, L:{local} {arrow} R:{remote}]")
            }
            (Some(local), None) => write!(f, "[id: 0x{id}, L:{local}]"),
            (None, _) => write!(f, "[id: 0x{id}]"),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.id.cmp(&other.id)
    }
}

/// 把出站缓冲的可写性翻转转换为管线事件。
struct PipelineWritability {
    channel: Weak<Channel>,
}

impl WritabilityListener for PipelineWritability {
    fn writability_changed(&self, invoke_later: bool) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if invoke_later {
            let _ = channel.invoke_later(|channel| {
                channel.pipeline().fire_channel_writability_changed();
            });
        } else {
            channel.pipeline().fire_channel_writability_changed();
        }
    }
}
