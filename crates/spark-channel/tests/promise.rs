//! Promise 与 ChannelPromise 的完成语义。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::executor::block_on;
use spark_channel::future::{ChannelPromise, Outcome, Promise, VoidPromise};
use spark_channel::runtime::{EventExecutor, SingleThreadEventLoop};
use spark_channel::{CoreError, codes};

use support::{EventLog, ExceptionSink, Harness};

#[test]
fn completes_exactly_once() {
    let promise = Promise::<u32>::new();
    assert!(promise.try_success(7));
    assert!(!promise.try_success(8), "第二次完成必须被拒绝");
    assert!(!promise.try_failure(CoreError::new(codes::TRANSPORT_IO, "late")));
    assert_eq!(promise.get_now(), Some(7));

    let err = promise
        .set_success(9)
        .expect_err("set_success 在已完成时应返回错误");
    assert_eq!(err.code(), codes::PROMISE_ALREADY_COMPLETE);
}

#[test]
fn late_listener_runs_inline() {
    let promise = Promise::<()>::failed(CoreError::new(codes::TRANSPORT_IO, "boom"));
    let calls = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&calls);
    promise.add_listener(move |done| {
        assert_eq!(done.cause().map(|err| err.code()), Some(codes::TRANSPORT_IO));
        observed.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1, "已完成的 Promise 应立即执行监听器");
}

#[test]
fn uncancellable_promise_ignores_cancel() {
    let promise = Promise::<()>::new();
    assert!(promise.is_cancellable());
    assert!(promise.set_uncancellable());
    assert!(!promise.cancel());
    assert!(!promise.is_cancellable());
    assert!(promise.try_success(()));

    let cancelled = Promise::<()>::new();
    assert!(cancelled.cancel());
    assert!(!cancelled.set_uncancellable(), "已取消的 Promise 不能再锁定");
    assert_eq!(
        cancelled.cause().map(|err| err.code()),
        Some(codes::PROMISE_CANCELLED)
    );
    assert_eq!(cancelled.outcome(), Some(Outcome::Cancelled));
}

#[test]
fn await_resolves_after_completion_on_another_thread() {
    let event_loop = SingleThreadEventLoop::new("promise-await").expect("事件循环应能启动");
    let promise = Promise::<String>::new();
    let completer = promise.clone();
    event_loop
        .schedule(
            Duration::from_millis(10),
            Box::new(move || {
                completer.try_success("done".to_owned());
            }),
        )
        .expect("定时任务应被接受");

    let value = block_on(promise).expect("Promise 应以成功完成");
    assert_eq!(value, "done");
    block_on(event_loop.shutdown_gracefully()).expect("事件循环应正常关闭");
}

#[test]
fn cascade_forwards_cancellation() {
    let source = Promise::<()>::new();
    let target = Promise::<()>::new();
    source.cascade_to(target.clone());
    assert!(source.cancel());
    assert!(target.is_cancelled());
}

#[test]
fn void_promise_is_inert() {
    let promise: ChannelPromise = VoidPromise::silent().into();
    assert!(promise.is_void());
    assert!(promise.future().is_none());
    assert!(!promise.try_success(), "Void Promise 不记录结果");
    assert!(!promise.is_done());
    assert!(promise.set_uncancellable());
}

#[test]
fn channel_void_promise_reports_failure_to_pipeline() {
    let log = EventLog::default();
    let harness = Harness::connected();
    harness
        .channel
        .pipeline()
        .add_last(None, spark_channel::Handler::inbound(ExceptionSink::new(&log)))
        .expect("添加异常收集器应成功");

    let promise = harness.channel.void_promise();
    assert!(!promise.try_failure(CoreError::new(codes::TRANSPORT_IO, "lost")));
    harness.run();
    assert_eq!(log.entries(), vec![format!("sink:{}", codes::TRANSPORT_IO)]);
}
