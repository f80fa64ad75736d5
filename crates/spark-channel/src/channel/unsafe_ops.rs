//! 通道的内部状态机：头部哨兵把出站操作交到这里，由这里调用传输钩子并完成 Promise。
//!
//! # 契约说明（What）
//! - 除 `register` 外，所有操作都必须在通道绑定的事件循环线程上调用；
//! - 进入操作时先把 Promise 锁定为不可取消，已被取消的操作直接放弃；
//! - 激活、未激活、注销事件总是经由事件循环延后触发，保证发起操作的调用栈先完整退出。
//!
//! # 执行说明（How）
//! - `close` 只在第一次调用时真正执行：摘下出站缓冲、关闭传输、失败缓冲中的条目，
//!   再依次触发 `channel_inactive` 与 `channel_unregistered`；
//!   之后的调用镜像第一次关闭的结果；
//! - 在 `flush0` 内部（例如写失败回调里）发起的关闭，把未激活与注销事件排到 `flush0` 退出之后；
//! - 写失败时按 `auto_close` 决定直接关闭，或先尝试半关闭输出、失败再关闭。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use crate::buffer::{OutboundBuffer, PipelineMessage};
use crate::error::{ConnectError, CoreError, codes};
use crate::future::{ChannelFuture, ChannelPromise, VoidPromise};
use crate::observability::TARGET_CHANNEL;
use crate::pipeline::UserEvent;
use crate::runtime::EventExecutor;
use crate::transport::ConnectProgress;

use super::Channel;
use super::channel::PendingConnect;

/// 通道状态机视图，由 [`Channel::unsafe_ops`] 获得。
///
/// 名称沿用“不安全”的含义：这些操作绕过管线直接驱动传输，应用代码应通过管线发起操作。
pub struct Unsafe<'a> {
    channel: &'a Channel,
}

struct CloseJob {
    buffer: Option<Arc<OutboundBuffer>>,
    cause: CoreError,
    close_cause: CoreError,
    notify: bool,
    was_active: bool,
}

impl Channel {
    pub fn unsafe_ops(&self) -> Unsafe<'_> {
        Unsafe { channel: self }
    }
}

impl Unsafe<'_> {
    pub fn outbound_buffer(&self) -> Option<Arc<OutboundBuffer>> {
        self.channel.outbound.load_full()
    }

    /// 把通道注册到 `event_loop`。可以在任意线程调用，实际注册在循环线程上完成。
    pub fn register(&self, event_loop: Arc<dyn EventExecutor>, promise: ChannelPromise) {
        let channel = self.channel;
        if channel
            .flags
            .registration_claimed
            .swap(true, Ordering::AcqRel)
        {
            promise.safe_failure(CoreError::new(
                codes::CHANNEL_ALREADY_REGISTERED,
                "通道已注册到事件循环",
            ));
            return;
        }
        if !channel.transport.is_compatible(event_loop.as_ref()) {
            channel
                .flags
                .registration_claimed
                .store(false, Ordering::Release);
            promise.safe_failure(CoreError::new(
                codes::CHANNEL_INCOMPATIBLE_EVENT_LOOP,
                "事件循环与通道的传输类型不兼容",
            ));
            return;
        }

        *channel.event_loop.write() = Some(Arc::clone(&event_loop));
        if event_loop.in_event_loop() {
            self.register0(promise);
            return;
        }
        let Some(strong) = channel.strong() else {
            promise.safe_failure(CoreError::closed_channel("register", None));
            return;
        };
        let task_promise = promise.clone();
        let submitted =
            event_loop.execute(Box::new(move || strong.unsafe_ops().register0(task_promise)));
        if let Err(err) = submitted {
            tracing::warn!(
                target: TARGET_CHANNEL,
                channel = %channel.id(),
                error = %err,
                "事件循环拒绝了注册任务，强制关闭通道"
            );
            self.close_forcibly();
            channel.close_future.try_success(());
            promise.safe_failure(err);
        }
    }

    fn register0(&self, promise: ChannelPromise) {
        let channel = self.channel;
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            channel
                .flags
                .registration_claimed
                .store(false, Ordering::Release);
            return;
        }
        let first_registration = channel.flags.never_registered.load(Ordering::Acquire);
        if let Err(err) = channel.transport.do_register(channel) {
            self.close_forcibly();
            channel.close_future.try_success(());
            promise.safe_failure(CoreError::from_io("注册通道失败", err));
            return;
        }
        channel.flags.never_registered.store(false, Ordering::Release);
        channel.flags.registered.store(true, Ordering::Release);
        tracing::debug!(target: TARGET_CHANNEL, channel = %channel.id(), "通道已注册");

        // 先执行排队的 handler_added，保证处理器在收到任何事件之前已就绪。
        channel.pipeline().invoke_handler_added_if_needed();
        promise.safe_success();
        channel.pipeline().fire_channel_registered();

        if channel.is_active() {
            if first_registration {
                channel.pipeline().fire_channel_active();
            } else if channel.config().is_auto_read() {
                self.begin_read();
            }
        }
    }

    pub fn bind(&self, local: SocketAddr, promise: ChannelPromise) {
        self.assert_event_loop();
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let channel = self.channel;
        let was_active = channel.is_active();
        if let Err(err) = channel.transport.do_bind(local) {
            let cause = CoreError::new(codes::TRANSPORT_IO, format!("绑定 {local} 失败: {err}"))
                .with_cause(err);
            promise.safe_failure(cause);
            self.close_if_closed();
            return;
        }
        if !was_active && channel.is_active() {
            let _ = channel.invoke_later(|channel| {
                channel.pipeline().fire_channel_active();
            });
        }
        promise.safe_success();
    }

    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: ChannelPromise) {
        self.assert_event_loop();
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let channel = self.channel;
        if channel.pending_connect.lock().is_some() {
            promise.safe_failure(CoreError::new(
                codes::CHANNEL_CONNECTION_PENDING,
                "已有连接尝试正在进行",
            ));
            return;
        }
        let was_active = channel.is_active();
        match channel.transport.do_connect(remote, local) {
            Ok(ConnectProgress::Connected) => self.fulfill_connect(promise, was_active),
            Ok(ConnectProgress::Pending) => {
                let timeout = self.arm_connect_timeout();
                *channel.pending_connect.lock() = Some(PendingConnect {
                    promise,
                    remote,
                    was_active,
                    timeout,
                });
            }
            Err(err) => {
                promise.safe_failure(ConnectError::classify(err, remote).into());
                self.close_if_closed();
            }
        }
    }

    fn arm_connect_timeout(&self) -> Option<crate::runtime::ScheduledTask> {
        let channel = self.channel;
        let timeout = channel.config().connect_timeout();
        if timeout.is_zero() {
            return None;
        }
        let event_loop = channel.event_loop()?;
        let weak = Arc::downgrade(&channel.strong()?);
        event_loop
            .schedule(
                timeout,
                Box::new(move || {
                    if let Some(channel) = weak.upgrade() {
                        channel.unsafe_ops().connect_timed_out();
                    }
                }),
            )
            .ok()
    }

    /// 传输报告异步连接结束。
    pub fn finish_connect(&self, result: io::Result<()>) {
        self.assert_event_loop();
        let pending = self.channel.pending_connect.lock().take();
        let Some(pending) = pending else {
            return;
        };
        if let Some(timeout) = &pending.timeout {
            timeout.cancel();
        }
        match result {
            Ok(()) => self.fulfill_connect(pending.promise, pending.was_active),
            Err(err) => {
                pending
                    .promise
                    .try_failure(ConnectError::classify(err, pending.remote).into());
                self.close_if_closed();
            }
        }
    }

    fn connect_timed_out(&self) {
        let pending = self.channel.pending_connect.lock().take();
        let Some(pending) = pending else {
            return;
        };
        tracing::debug!(
            target: TARGET_CHANNEL,
            channel = %self.channel.id(),
            remote = %pending.remote,
            "连接超时"
        );
        let cause: CoreError = ConnectError::TimedOut {
            remote: pending.remote,
        }
        .into();
        if pending.promise.try_failure(cause) {
            self.close(VoidPromise::silent().into());
        }
    }

    fn fulfill_connect(&self, promise: ChannelPromise, was_active: bool) {
        let channel = self.channel;
        let active = channel.is_active();
        let promised = promise.try_success();
        if !was_active && active {
            let _ = channel.invoke_later(|channel| {
                channel.pipeline().fire_channel_active();
            });
        }
        // 调用方已经放弃（Promise 在别处被完成）时，连接没有使用者。
        if !promised && !promise.is_void() {
            self.close(VoidPromise::silent().into());
        }
    }

    fn fail_pending_connect(&self) {
        let pending = self.channel.pending_connect.lock().take();
        if let Some(pending) = pending {
            if let Some(timeout) = &pending.timeout {
                timeout.cancel();
            }
            pending
                .promise
                .try_failure(CoreError::closed_channel("connect", None));
        }
    }

    pub fn disconnect(&self, promise: ChannelPromise) {
        self.assert_event_loop();
        if !promise.set_uncancellable() {
            return;
        }
        let channel = self.channel;
        let was_active = channel.is_active();
        if let Err(err) = channel.transport.do_disconnect() {
            promise.safe_failure(CoreError::from_io("断开连接失败", err));
            self.close_if_closed();
            return;
        }
        channel.invalidate_remote_address();
        if was_active && !channel.is_active() {
            let _ = channel.invoke_later(|channel| {
                channel.pipeline().fire_channel_inactive();
            });
        }
        promise.safe_success();
        self.close_if_closed();
    }

    pub fn close(&self, promise: ChannelPromise) {
        self.assert_event_loop();
        let cause = CoreError::closed_channel("close", None);
        self.close_with(promise, cause.clone(), cause, false);
    }

    fn close_with(
        &self,
        promise: ChannelPromise,
        cause: CoreError,
        close_cause: CoreError,
        notify: bool,
    ) {
        if !promise.set_uncancellable() {
            return;
        }
        let channel = self.channel;
        if channel.flags.close_initiated.swap(true, Ordering::AcqRel) {
            if !promise.is_void() {
                promise.follow(&channel.close_outcome);
            }
            return;
        }

        let was_active = channel.is_active();
        let buffer = channel.outbound.swap(None);
        promise.follow(&channel.close_outcome);
        self.fail_pending_connect();

        let job = CloseJob {
            buffer,
            cause,
            close_cause,
            notify,
            was_active,
        };
        match channel.transport.prepare_to_close() {
            Some(executor) => self.offload(
                executor,
                |channel| channel.unsafe_ops().do_close0(),
                move |channel| channel.unsafe_ops().finish_close(job),
            ),
            None => {
                self.do_close0();
                self.finish_close(job);
            }
        }
    }

    fn do_close0(&self) {
        let channel = self.channel;
        let result = channel.transport.do_close();
        channel.close_future.try_success(());
        match result {
            Ok(()) => {
                tracing::debug!(target: TARGET_CHANNEL, channel = %channel.id(), "通道已关闭");
                channel.close_outcome.try_success(());
            }
            Err(err) => {
                channel
                    .close_outcome
                    .try_failure(CoreError::from_io("关闭通道失败", err));
            }
        }
    }

    fn finish_close(&self, job: CloseJob) {
        if let Some(buffer) = job.buffer {
            buffer.fail_flushed(job.cause, job.notify);
            buffer.close(job.close_cause);
        }
        let was_active = job.was_active;
        if self.channel.flags.in_flush0.load(Ordering::Acquire) {
            let deferred = self.channel.invoke_later(move |channel| {
                channel.unsafe_ops().fire_inactive_and_deregister(was_active);
            });
            if deferred.is_ok() {
                return;
            }
        }
        self.fire_inactive_and_deregister(was_active);
    }

    fn fire_inactive_and_deregister(&self, was_active: bool) {
        let fire_inactive = was_active && !self.channel.is_active();
        self.deregister_with(VoidPromise::silent().into(), fire_inactive);
    }

    /// 关闭传输且不触发任何事件，用于注册失败等无法走正常关闭流程的场景。
    pub fn close_forcibly(&self) {
        if let Err(err) = self.channel.transport.do_close() {
            tracing::warn!(
                target: TARGET_CHANNEL,
                channel = %self.channel.id(),
                error = %err,
                "强制关闭通道失败"
            );
        }
    }

    pub fn deregister(&self, promise: ChannelPromise) {
        self.assert_event_loop();
        self.deregister_with(promise, false);
    }

    fn deregister_with(&self, promise: ChannelPromise, fire_inactive: bool) {
        if !promise.set_uncancellable() {
            return;
        }
        let channel = self.channel;
        if !channel.is_registered() {
            promise.safe_success();
            return;
        }
        // 注销总是延后执行：调用方可能仍处于某个处理器回调中。
        let task_promise = promise.clone();
        let scheduled = channel.invoke_later(move |channel| {
            channel
                .unsafe_ops()
                .deregister_now(task_promise, fire_inactive);
        });
        if let Err(err) = scheduled {
            promise.safe_failure(err);
        }
    }

    fn deregister_now(&self, promise: ChannelPromise, fire_inactive: bool) {
        let channel = self.channel;
        if let Err(err) = channel.transport.do_deregister() {
            tracing::warn!(
                target: TARGET_CHANNEL,
                channel = %channel.id(),
                error = %err,
                "注销通道时发生异常"
            );
        }
        if fire_inactive {
            channel.pipeline().fire_channel_inactive();
        }
        if channel.flags.registered.swap(false, Ordering::AcqRel) {
            channel
                .flags
                .registration_claimed
                .store(false, Ordering::Release);
            tracing::debug!(target: TARGET_CHANNEL, channel = %channel.id(), "通道已注销");
            channel.pipeline().fire_channel_unregistered();
        }
        promise.safe_success();
    }

    /// 关闭输出方向：失败所有待写条目并触发 [`UserEvent::OutputShutdown`]。
    pub fn shutdown_output(&self, promise: ChannelPromise) {
        self.assert_event_loop();
        self.shutdown_output_with(promise, None);
    }

    fn shutdown_output_with(&self, promise: ChannelPromise, cause: Option<CoreError>) {
        if !promise.set_uncancellable() {
            return;
        }
        let channel = self.channel;
        let Some(buffer) = channel.outbound.swap(None) else {
            promise.safe_failure(self.closed_error("shutdown_output"));
            return;
        };
        channel.flags.output_shutdown.store(true, Ordering::Release);
        let shutdown_cause = {
            let err = CoreError::new(codes::CHANNEL_OUTPUT_SHUTDOWN, "通道输出方向已关闭");
            match cause {
                Some(cause) => err.with_cause(cause),
                None => err,
            }
        };
        match channel.transport.prepare_to_close() {
            Some(executor) => self.offload(
                executor,
                move |channel| channel.unsafe_ops().do_shutdown_output0(&promise),
                move |channel| {
                    channel
                        .unsafe_ops()
                        .close_outbound_for_shutdown(buffer, shutdown_cause);
                },
            ),
            None => {
                self.do_shutdown_output0(&promise);
                self.close_outbound_for_shutdown(buffer, shutdown_cause);
            }
        }
    }

    fn do_shutdown_output0(&self, promise: &ChannelPromise) {
        match self.channel.transport.do_shutdown_output() {
            Ok(()) => promise.safe_success(),
            Err(err) => promise.safe_failure(CoreError::from_io("关闭输出方向失败", err)),
        }
    }

    fn close_outbound_for_shutdown(&self, buffer: Arc<OutboundBuffer>, cause: CoreError) {
        buffer.fail_flushed(cause.clone(), false);
        buffer.close(cause);
        self.channel
            .pipeline()
            .fire_user_event_triggered(UserEvent::OutputShutdown);
    }

    /// 在关闭执行器上运行 `work`，再回到事件循环运行 `finish`；任一执行器拒绝时改为就地执行。
    fn offload<W, F>(&self, executor: Arc<dyn EventExecutor>, work: W, finish: F)
    where
        W: FnOnce(&Channel) + Send + 'static,
        F: FnOnce(&Channel) + Send + 'static,
    {
        let Some(channel) = self.channel.strong() else {
            work(self.channel);
            finish(self.channel);
            return;
        };
        let work_slot = Arc::new(Mutex::new(Some(work)));
        let finish_slot = Arc::new(Mutex::new(Some(finish)));
        let task_work = Arc::clone(&work_slot);
        let task_finish = Arc::clone(&finish_slot);
        let submitted = executor.execute(Box::new(move || {
            let work = task_work.lock().take();
            if let Some(work) = work {
                work(&channel);
            }
            let later = Arc::clone(&task_finish);
            let scheduled = channel.invoke_later(move |channel| {
                let finish = later.lock().take();
                if let Some(finish) = finish {
                    finish(channel);
                }
            });
            if scheduled.is_err() {
                let finish = task_finish.lock().take();
                if let Some(finish) = finish {
                    finish(&channel);
                }
            }
        }));
        if let Err(err) = submitted {
            tracing::warn!(
                target: TARGET_CHANNEL,
                channel = %self.channel.id(),
                error = %err,
                "关闭执行器拒绝了任务，改在当前线程执行"
            );
            let work = work_slot.lock().take();
            if let Some(work) = work {
                work(self.channel);
            }
            let finish = finish_slot.lock().take();
            if let Some(finish) = finish {
                finish(self.channel);
            }
        }
    }

    /// 在传输允许时发起一次读取；失败会触发异常事件并关闭通道。
    pub fn begin_read(&self) {
        self.assert_event_loop();
        let channel = self.channel;
        if !channel.is_active() {
            return;
        }
        if let Err(err) = channel.transport.do_begin_read() {
            let cause = CoreError::from_io("发起读取失败", err);
            let _ = channel.invoke_later(move |channel| {
                channel.pipeline().fire_exception_caught(cause);
            });
            self.close(VoidPromise::silent().into());
        }
    }

    /// 记入出站缓冲；缓冲已撤下（关闭或半关闭）时立即失败。
    pub fn write(&self, msg: PipelineMessage, promise: ChannelPromise) {
        self.assert_event_loop();
        let channel = self.channel;
        let Some(buffer) = channel.outbound.load_full() else {
            drop(msg);
            promise.safe_failure(self.closed_error("write"));
            return;
        };
        let msg = match channel.transport.filter_outbound_message(msg) {
            Ok(msg) => msg,
            Err(err) => {
                promise.safe_failure(err);
                return;
            }
        };
        let size = channel.config().message_size_estimator().size(&msg);
        buffer.add_message(msg, size, promise);
    }

    pub fn flush(&self) {
        self.assert_event_loop();
        let Some(buffer) = self.channel.outbound.load_full() else {
            return;
        };
        buffer.add_flush();
        self.flush0();
    }

    fn flush0(&self) {
        let channel = self.channel;
        if channel.flags.in_flush0.load(Ordering::Acquire) {
            return;
        }
        let Some(buffer) = channel.outbound.load_full() else {
            return;
        };
        if buffer.is_empty() {
            return;
        }
        channel.flags.in_flush0.store(true, Ordering::Release);
        if !channel.is_active() {
            if channel.is_open() {
                buffer.fail_flushed(
                    CoreError::new(codes::CHANNEL_NOT_YET_CONNECTED, "通道尚未连接"),
                    true,
                );
            } else {
                buffer.fail_flushed(self.closed_error("flush0"), false);
            }
        } else if let Err(err) = channel.transport.do_write(&buffer, channel.config()) {
            self.handle_write_error(err);
        }
        channel.flags.in_flush0.store(false, Ordering::Release);
    }

    fn handle_write_error(&self, err: io::Error) {
        let channel = self.channel;
        let cause = CoreError::from_io("写出数据失败", err);
        if channel.config().is_auto_close() {
            *channel.initial_close_cause.lock() = Some(cause.clone());
            let close_cause = CoreError::closed_channel("flush0", Some(&cause));
            self.close_with(VoidPromise::silent().into(), cause, close_cause, false);
            return;
        }

        // 半关闭失败时退化为完整关闭。
        let fallback = ChannelFuture::new();
        let weak = channel.strong().map(|strong| Arc::downgrade(&strong));
        let write_cause = cause.clone();
        fallback.add_listener(move |done| {
            let (Some(shutdown_err), Some(channel)) =
                (done.cause(), weak.and_then(|weak| weak.upgrade()))
            else {
                return;
            };
            let close = move |channel: &Channel| {
                *channel.initial_close_cause.lock() = Some(write_cause.clone());
                let close_cause = CoreError::closed_channel("flush0", Some(&write_cause));
                channel.unsafe_ops().close_with(
                    VoidPromise::silent().into(),
                    shutdown_err,
                    close_cause,
                    false,
                );
            };
            if channel.in_event_loop() {
                close(&channel);
            } else {
                let _ = channel.invoke_later(close);
            }
        });
        self.shutdown_output_with(fallback.into(), Some(cause));
    }

    fn ensure_open(&self, promise: &ChannelPromise) -> bool {
        if self.channel.is_open() {
            return true;
        }
        promise.safe_failure(self.closed_error("ensure_open"));
        false
    }

    fn close_if_closed(&self) {
        if !self.channel.is_open() {
            self.close(VoidPromise::silent().into());
        }
    }

    fn closed_error(&self, operation: &'static str) -> CoreError {
        let channel = self.channel;
        if channel.flags.output_shutdown.load(Ordering::Acquire) && channel.is_open() {
            return CoreError::new(codes::CHANNEL_OUTPUT_SHUTDOWN, "通道输出方向已关闭");
        }
        let initial = channel.initial_close_cause.lock().clone();
        CoreError::closed_channel(operation, initial.as_ref())
    }

    fn assert_event_loop(&self) {
        debug_assert!(
            !self.channel.is_registered() || self.channel.in_event_loop(),
            "Unsafe 操作必须在通道的事件循环线程上调用"
        );
    }
}
