use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::{CoreError, Result, codes};

type Listener<V> = Box<dyn FnOnce(&Promise<V>) + Send + 'static>;

/// Promise 的最终结果。
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<V> {
    Success(V),
    Failure(CoreError),
    Cancelled,
}

impl<V> Outcome<V> {
    /// 转换为 `Result`，取消被映射为 `promise.cancelled`。
    pub fn into_result(self) -> Result<V> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(err) => Err(err),
            Outcome::Cancelled => Err(cancelled_error()),
        }
    }
}

fn cancelled_error() -> CoreError {
    CoreError::new(codes::PROMISE_CANCELLED, "操作已被取消")
}

struct State<V> {
    outcome: Option<Outcome<V>>,
    uncancellable: bool,
    listeners: Vec<Listener<V>>,
    wakers: Vec<Waker>,
}

/// 写一次的异步结果单元。
///
/// # 设计意图（Why）
/// - 通道上的每个异步操作都通过 Promise 汇报结果，调用方既可以注册监听器，
///   也可以直接 `.await`（`Promise` 实现了 [`Future`]）。
///
/// # 契约说明（What）
/// - 状态只会从 *Pending* 迁移一次到 *Success* / *Failure* / *Cancelled*，此后不可变；
/// - `try_*` 在已完成时返回 `false` 且不改变原结果，`set_*` 在已完成时返回
///   `promise.already_complete` 错误；
/// - 完成后注册的监听器在 `add_listener` 调用内部同步执行；
/// - `set_uncancellable` 之后 `cancel` 恒为 `false`。
///
/// # 执行说明（How）
/// - 内部状态由 `parking_lot::Mutex` 保护；监听器与 waker 在释放锁之后依次触发，
///   监听器内部可以安全地再次访问同一个 Promise。
pub struct Promise<V = ()> {
    inner: Arc<Mutex<State<V>>>,
}

impl<V> Clone for Promise<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + 'static> Default for Promise<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + 'static> Promise<V> {
    /// 创建处于 Pending 状态的 Promise。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State {
                outcome: None,
                uncancellable: false,
                listeners: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    /// 创建已成功的 Promise。
    pub fn succeeded(value: V) -> Self {
        let promise = Self::new();
        promise.complete(Outcome::Success(value));
        promise
    }

    /// 创建已失败的 Promise。
    pub fn failed(err: CoreError) -> Self {
        let promise = Self::new();
        promise.complete(Outcome::Failure(err));
        promise
    }

    pub fn try_success(&self, value: V) -> bool {
        self.complete(Outcome::Success(value))
    }

    pub fn set_success(&self, value: V) -> Result<()> {
        if self.try_success(value) {
            Ok(())
        } else {
            Err(already_complete())
        }
    }

    pub fn try_failure(&self, err: CoreError) -> bool {
        self.complete(Outcome::Failure(err))
    }

    pub fn set_failure(&self, err: CoreError) -> Result<()> {
        if self.try_failure(err) {
            Ok(())
        } else {
            Err(already_complete())
        }
    }

    /// 取消尚未完成且未被锁定的 Promise。
    pub fn cancel(&self) -> bool {
        {
            let state = self.inner.lock();
            if state.outcome.is_some() || state.uncancellable {
                return false;
            }
        }
        self.complete(Outcome::Cancelled)
    }

    /// 锁定为不可取消。
    ///
    /// 返回 `true` 表示之后不会再被取消：要么仍在进行中并已锁定，要么已经以非取消方式完成。
    pub fn set_uncancellable(&self) -> bool {
        let mut state = self.inner.lock();
        match state.outcome {
            None => {
                state.uncancellable = true;
                true
            }
            Some(Outcome::Cancelled) => false,
            Some(_) => true,
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.lock().outcome, Some(Outcome::Success(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.lock().outcome, Some(Outcome::Cancelled))
    }

    pub fn is_cancellable(&self) -> bool {
        let state = self.inner.lock();
        state.outcome.is_none() && !state.uncancellable
    }

    /// 失败或取消的原因；成功或未完成时返回 `None`。
    pub fn cause(&self) -> Option<CoreError> {
        match &self.inner.lock().outcome {
            Some(Outcome::Failure(err)) => Some(err.clone()),
            Some(Outcome::Cancelled) => Some(cancelled_error()),
            _ => None,
        }
    }

    /// 注册完成监听器；若已完成则在当前调用内立即执行。
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Promise<V>) + Send + 'static,
    {
        {
            let mut state = self.inner.lock();
            if state.outcome.is_none() {
                state.listeners.push(Box::new(listener));
                return;
            }
        }
        listener(self);
    }

    /// 判断两个句柄是否指向同一个 Promise。
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn complete(&self, outcome: Outcome<V>) -> bool {
        let (listeners, wakers) = {
            let mut state = self.inner.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
            )
        };
        for waker in wakers {
            waker.wake();
        }
        for listener in listeners {
            listener(self);
        }
        true
    }
}

impl<V: Clone + Send + 'static> Promise<V> {
    /// 成功时的结果副本。
    pub fn get_now(&self) -> Option<V> {
        match &self.inner.lock().outcome {
            Some(Outcome::Success(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// 最终结果副本；未完成时返回 `None`。
    pub fn outcome(&self) -> Option<Outcome<V>> {
        self.inner.lock().outcome.clone()
    }

    /// 完成后将结果同步到另一个 Promise。
    pub fn cascade_to(&self, target: Promise<V>) {
        self.add_listener(move |source| match source.outcome() {
            Some(Outcome::Success(value)) => {
                target.try_success(value);
            }
            Some(Outcome::Failure(err)) => {
                target.try_failure(err);
            }
            Some(Outcome::Cancelled) => {
                target.cancel();
            }
            None => {}
        });
    }
}

impl<V: Clone + Send + 'static> Future for Promise<V> {
    type Output = Result<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.lock();
        match &state.outcome {
            Some(outcome) => Poll::Ready(outcome.clone().into_result()),
            None => {
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<V> fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        let status = match &state.outcome {
            None if state.uncancellable => "pending(uncancellable)",
            None => "pending",
            Some(Outcome::Success(_)) => "success",
            Some(Outcome::Failure(_)) => "failure",
            Some(Outcome::Cancelled) => "cancelled",
        };
        f.debug_struct("Promise").field("status", &status).finish()
    }
}

fn already_complete() -> CoreError {
    CoreError::new(codes::PROMISE_ALREADY_COMPLETE, "Promise 已完成，结果不可再次设置")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_run_in_registration_order() {
        let promise = Promise::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for idx in 0..3 {
            let order = Arc::clone(&order);
            promise.add_listener(move |_| order.lock().push(idx));
        }
        assert!(promise.try_success(7));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn listener_may_touch_same_promise() {
        let promise = Promise::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in = Arc::clone(&seen);
        promise.add_listener(move |p| {
            let nested = Arc::clone(&seen_in);
            p.add_listener(move |inner| {
                nested.store(inner.get_now().unwrap_or(0) as usize, Ordering::SeqCst);
            });
        });
        promise.try_success(42);
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn cascade_mirrors_failure() {
        let source = Promise::<()>::new();
        let target = Promise::<()>::new();
        source.cascade_to(target.clone());
        source.try_failure(CoreError::new(codes::TRANSPORT_IO, "x"));
        assert_eq!(target.cause().map(|e| e.code()), Some(codes::TRANSPORT_IO));
    }
}
