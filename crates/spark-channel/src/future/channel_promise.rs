use std::fmt;
use std::sync::{Arc, Weak};

use crate::channel::Channel;
use crate::error::CoreError;
use crate::observability::TARGET_CHANNEL;

use super::{ChannelFuture, Outcome, Promise};

/// 通道操作携带的完成信号。
///
/// # 契约说明（What）
/// - `Tracked`：普通 Promise，调用方可以观察结果；
/// - `Void`：即发即弃，不保存结果也不接受监听器，失败时可选择转为管线异常事件。
///
/// 两种形态都可以廉价克隆，克隆体指向同一个结果单元。
#[derive(Clone)]
pub enum ChannelPromise {
    Tracked(ChannelFuture),
    Void(VoidPromise),
}

impl ChannelPromise {
    /// 新建可观察的 Promise。
    pub fn new() -> Self {
        Self::Tracked(Promise::new())
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void(_))
    }

    /// 可观察的 Future；Void 形态返回 `None`。
    pub fn future(&self) -> Option<&ChannelFuture> {
        match self {
            Self::Tracked(promise) => Some(promise),
            Self::Void(_) => None,
        }
    }

    pub fn try_success(&self) -> bool {
        match self {
            Self::Tracked(promise) => promise.try_success(()),
            Self::Void(_) => false,
        }
    }

    pub fn try_failure(&self, err: CoreError) -> bool {
        match self {
            Self::Tracked(promise) => promise.try_failure(err),
            Self::Void(void) => {
                void.fail(err);
                false
            }
        }
    }

    pub fn set_uncancellable(&self) -> bool {
        match self {
            Self::Tracked(promise) => promise.set_uncancellable(),
            Self::Void(_) => true,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Self::Tracked(promise) => promise.is_done(),
            Self::Void(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Tracked(promise) => promise.is_cancelled(),
            Self::Void(_) => false,
        }
    }

    /// 标记成功；若 Promise 已完成则记录告警。
    pub(crate) fn safe_success(&self) {
        if let Self::Tracked(promise) = self
            && !promise.try_success(())
        {
            tracing::warn!(
                target: TARGET_CHANNEL,
                promise = ?promise,
                "Promise 已完成，无法再标记为成功"
            );
        }
    }

    /// 标记失败；若 Promise 已完成则记录告警。Void 形态按其策略处理失败。
    pub(crate) fn safe_failure(&self, err: CoreError) {
        match self {
            Self::Tracked(promise) => {
                if !promise.try_failure(err.clone()) {
                    tracing::warn!(
                        target: TARGET_CHANNEL,
                        promise = ?promise,
                        error = %err,
                        "Promise 已完成，无法再标记为失败"
                    );
                }
            }
            Self::Void(void) => void.fail(err),
        }
    }

    /// 将另一个 Future 的结果镜像到本 Promise。
    pub(crate) fn follow(&self, source: &ChannelFuture) {
        let target = self.clone();
        source.add_listener(move |done| match done.outcome() {
            Some(Outcome::Success(())) => target.safe_success(),
            Some(Outcome::Failure(err)) => target.safe_failure(err),
            Some(Outcome::Cancelled) => {
                if let Self::Tracked(promise) = &target {
                    promise.cancel();
                }
            }
            None => {}
        });
    }
}

impl Default for ChannelPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ChannelFuture> for ChannelPromise {
    fn from(promise: ChannelFuture) -> Self {
        Self::Tracked(promise)
    }
}

impl fmt::Debug for ChannelPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracked(promise) => fmt::Debug::fmt(promise, f),
            Self::Void(void) => fmt::Debug::fmt(void, f),
        }
    }
}

/// 即发即弃的 Promise。
///
/// 失败时若 `fire_exception` 打开且通道仍处于注册状态，会把错误作为异常事件送入管线。
#[derive(Clone)]
pub struct VoidPromise {
    channel: Weak<Channel>,
    fire_exception: bool,
}

impl VoidPromise {
    /// 失败会进入管线异常路径的 Void Promise。
    pub fn new(channel: &Arc<Channel>) -> Self {
        Self {
            channel: Arc::downgrade(channel),
            fire_exception: true,
        }
    }

    /// 完全静默的 Void Promise，用于通道内部的收尾操作。
    pub fn silent() -> Self {
        Self {
            channel: Weak::new(),
            fire_exception: false,
        }
    }

    pub(crate) fn for_channel(channel: Weak<Channel>) -> Self {
        Self {
            channel,
            fire_exception: true,
        }
    }

    fn fail(&self, err: CoreError) {
        if !self.fire_exception {
            return;
        }
        if let Some(channel) = self.channel.upgrade()
            && channel.is_registered()
        {
            channel.pipeline().fire_exception_caught(err);
        }
    }
}

impl From<VoidPromise> for ChannelPromise {
    fn from(void: VoidPromise) -> Self {
        Self::Void(void)
    }
}

impl fmt::Debug for VoidPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoidPromise")
            .field("fire_exception", &self.fire_exception)
            .finish()
    }
}
