//! 通道生命周期：注册、绑定、连接、写出、半关闭与关闭。

mod support;

use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use futures::executor::block_on;
use spark_channel::configuration::WriteBufferWaterMark;
use spark_channel::future::ChannelFuture;
use spark_channel::pipeline::Handler;
use spark_channel::runtime::{EmbeddedEventLoop, EventExecutor, SingleThreadEventLoop};
use spark_channel::transport::{EmbeddedTransport, FaultPoint, TransportCall};
use spark_channel::{Channel, ConnectError, codes};

use support::{EventLog, ExceptionSink, Harness, LOCAL, REMOTE, Recorder, addr};

fn recorded(harness: &Harness, log: &EventLog) {
    harness
        .channel
        .pipeline()
        .add_last(Some("r"), Handler::duplex(Recorder::new("r", log)))
        .expect("添加记录处理器");
}

fn code_of(future: &ChannelFuture) -> Option<&'static str> {
    future.cause().map(|err| err.code())
}

#[test]
fn register_then_bind_activates_on_next_tick() {
    let log = EventLog::default();
    let harness = Harness::unregistered(EmbeddedTransport::new());
    recorded(&harness, &log);
    harness.register();
    assert_eq!(log.of("r"), vec!["added", "registered"]);
    assert!(harness.channel.is_registered());
    assert!(!harness.channel.is_active());

    let bound = harness.channel.bind(addr(LOCAL));
    assert!(bound.is_success());
    assert_eq!(log.of("r").last().map(String::as_str), Some("bind"));

    harness.run();
    assert_eq!(
        log.of("r"),
        vec!["added", "registered", "bind", "active", "read_request"]
    );
    assert_eq!(
        harness.transport.calls(),
        vec![
            TransportCall::Register,
            TransportCall::Bind(addr(LOCAL)),
            TransportCall::BeginRead,
        ]
    );
    assert_eq!(harness.channel.local_address(), Some(addr(LOCAL)));
}

/// 绑定、三次写入一次刷新、关闭：完整生命周期中每个事件恰好一次，写出合并为一个批次。
#[test]
fn bind_write_batch_and_close_end_to_end() {
    let log = EventLog::default();
    let harness = Harness::unregistered(EmbeddedTransport::new());
    recorded(&harness, &log);
    harness.register();

    assert!(harness.channel.bind(addr(LOCAL)).is_success());
    assert_eq!(log.count("r:active"), 0, "激活事件在下一轮任务中触发");
    harness.run();
    assert_eq!(log.count("r:active"), 1);

    let writes: Vec<_> = ["one", "two", "three"]
        .into_iter()
        .map(|msg| harness.channel.write(msg))
        .collect();
    assert!(writes.iter().all(|written| !written.is_done()));
    harness.channel.flush();
    assert!(writes.iter().all(ChannelFuture::is_success));

    let batches = harness.transport.take_batches();
    let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3], "三条消息应在同一次写出中交给传输");
    assert_eq!(
        harness.transport.count(&TransportCall::Write { messages: 3 }),
        1
    );
    assert_eq!(&harness.transport.wire()[..], b"onetwothree");

    assert!(harness.channel.close().is_success());
    harness.run();
    let tail: Vec<String> = log
        .of("r")
        .into_iter()
        .filter(|entry| entry == "inactive" || entry == "unregistered")
        .collect();
    assert_eq!(tail, vec!["inactive", "unregistered"]);
    assert_eq!(log.count("r:active"), 1);
}

#[test]
fn accepted_connection_fires_active_on_registration() {
    let log = EventLog::default();
    let harness = Harness::unregistered(EmbeddedTransport::connected(addr(LOCAL), addr(REMOTE)));
    recorded(&harness, &log);
    harness.register();
    assert_eq!(
        log.of("r"),
        vec!["added", "registered", "active", "read_request"]
    );
    assert_eq!(
        harness.channel.to_string(),
        format!(
            "[id: 0x{}, L:{LOCAL} - R:{REMOTE}]",
            harness.channel.id().as_short_text()
        )
    );
}

#[test]
fn registration_is_exclusive_and_checked() {
    let harness = Harness::connected();
    let again = harness
        .channel
        .register(EmbeddedEventLoop::new() as Arc<dyn EventExecutor>);
    assert_eq!(code_of(&again), Some(codes::CHANNEL_ALREADY_REGISTERED));

    let picky = Harness::unregistered(EmbeddedTransport::new().embedded_loop_only());
    let threaded = SingleThreadEventLoop::new("incompatible").expect("事件循环应能启动");
    let rejected = picky
        .channel
        .register(threaded.clone() as Arc<dyn EventExecutor>);
    assert_eq!(code_of(&rejected), Some(codes::CHANNEL_INCOMPATIBLE_EVENT_LOOP));
    assert!(!picky.channel.is_registered());
    picky.register();
    block_on(threaded.shutdown_gracefully()).expect("事件循环应正常关闭");
}

#[test]
fn failed_registration_closes_channel() {
    let harness = Harness::unregistered(EmbeddedTransport::new());
    harness
        .transport
        .fail_next(FaultPoint::Register, io::ErrorKind::PermissionDenied);
    let registered = harness
        .channel
        .register(Arc::clone(&harness.event_loop) as Arc<dyn EventExecutor>);
    assert_eq!(code_of(&registered), Some(codes::TRANSPORT_IO));
    assert!(!harness.channel.is_open());
    assert!(harness.channel.close_future().is_success());
}

#[test]
fn bind_failure_keeps_channel_open() {
    let harness = Harness::unregistered(EmbeddedTransport::new());
    harness.register();
    harness
        .transport
        .fail_next(FaultPoint::Bind, io::ErrorKind::AddrInUse);
    let bound = harness.channel.bind(addr(LOCAL));
    assert_eq!(code_of(&bound), Some(codes::TRANSPORT_IO));
    assert!(harness.channel.is_open());
    assert!(!harness.channel.is_active());
}

#[test]
fn immediate_connect_activates_channel() {
    let log = EventLog::default();
    let harness = Harness::unregistered(EmbeddedTransport::new());
    recorded(&harness, &log);
    harness.register();

    let connected = harness.channel.connect(addr(REMOTE));
    assert!(connected.is_success());
    harness.run();
    assert!(log.of("r").contains(&"active".to_owned()));
    assert_eq!(harness.channel.remote_address(), Some(addr(REMOTE)));
}

#[test]
fn refused_connect_reports_classified_error() {
    let harness = Harness::unregistered(EmbeddedTransport::new());
    harness.register();
    harness
        .transport
        .fail_next(FaultPoint::Connect, io::ErrorKind::ConnectionRefused);

    let connected = harness.channel.connect(addr(REMOTE));
    let err = connected.cause().expect("连接应失败");
    assert_eq!(err.code(), codes::TRANSPORT_CONNECTION_REFUSED);
    assert!(matches!(
        err.connect_error(),
        Some(ConnectError::Refused { remote, .. }) if *remote == addr(REMOTE)
    ));
    assert!(harness.channel.is_open(), "传输仍然打开时不关闭通道");
}

#[test]
fn pending_connect_times_out_and_closes() {
    let harness = Harness::unregistered(EmbeddedTransport::new());
    harness.register();
    harness.transport.defer_connect();
    harness
        .channel
        .config()
        .set_connect_timeout(Duration::from_millis(250));

    let connected = harness.channel.connect(addr(REMOTE));
    assert!(!connected.is_done());
    assert!(!connected.cancel(), "进行中的连接不可取消");
    assert_eq!(
        harness.event_loop.next_scheduled_delay(),
        Some(Duration::from_millis(250))
    );

    harness.event_loop.advance_time(Duration::from_millis(250));
    harness.run();
    assert_eq!(code_of(&connected), Some(codes::TRANSPORT_CONNECT_TIMEOUT));
    assert!(!harness.channel.is_open());
    assert_eq!(harness.transport.count(&TransportCall::Close), 1);
}

#[test]
fn pending_connect_completes_and_disarms_timer() {
    let log = EventLog::default();
    let harness = Harness::unregistered(EmbeddedTransport::new());
    recorded(&harness, &log);
    harness.register();
    harness.transport.defer_connect();

    let connected = harness.channel.connect(addr(REMOTE));
    let second = harness.channel.connect(addr(REMOTE));
    assert_eq!(code_of(&second), Some(codes::CHANNEL_CONNECTION_PENDING));

    harness.transport.set_active(true);
    harness.channel.unsafe_ops().finish_connect(Ok(()));
    assert!(connected.is_success());
    assert_eq!(harness.event_loop.next_scheduled_delay(), None);

    harness.run();
    assert!(log.of("r").contains(&"active".to_owned()));
}

#[test]
fn close_fails_pending_connect() {
    let harness = Harness::unregistered(EmbeddedTransport::new());
    harness.register();
    harness.transport.defer_connect();

    let connected = harness.channel.connect(addr(REMOTE));
    let closed = harness.channel.close();
    assert!(closed.is_success());
    assert_eq!(code_of(&connected), Some(codes::CHANNEL_CLOSED));
    assert_eq!(harness.event_loop.next_scheduled_delay(), None);
}

#[test]
fn close_is_idempotent_and_ordered() {
    let log = EventLog::default();
    let harness = Harness::unregistered(EmbeddedTransport::connected(addr(LOCAL), addr(REMOTE)));
    recorded(&harness, &log);
    harness.register();
    log.clear();

    let first = harness.channel.close();
    let second = harness.channel.close();
    harness.run();
    let third = harness.channel.close();

    for future in [&first, &second, &third] {
        assert!(future.is_success());
    }
    assert_eq!(harness.transport.count(&TransportCall::Close), 1);
    assert_eq!(
        log.of("r"),
        vec!["close", "close", "inactive", "unregistered", "removed"]
    );
    assert!(harness.channel.close_future().is_success());
    assert!(!harness.channel.is_registered());
}

#[test]
fn close_failure_is_mirrored_to_later_calls() {
    let harness = Harness::connected();
    harness
        .transport
        .fail_next(FaultPoint::Close, io::ErrorKind::Other);

    let first = harness.channel.close();
    let second = harness.channel.close();
    assert_eq!(code_of(&first), Some(codes::TRANSPORT_IO));
    assert_eq!(code_of(&second), Some(codes::TRANSPORT_IO));
    assert!(harness.channel.close_future().is_success(), "close_future 总是成功");
    assert!(!harness.channel.is_open());
}

#[test]
fn writes_after_close_fail_immediately() {
    let harness = Harness::connected();
    let pending = harness.channel.write("queued");
    harness.channel.close();
    assert_eq!(code_of(&pending), Some(codes::CHANNEL_CLOSED));

    let late = harness.channel.write_and_flush("late");
    assert_eq!(code_of(&late), Some(codes::CHANNEL_CLOSED));
    assert!(harness.transport.wire().is_empty());
}

#[test]
fn flush_on_inactive_channel_fails_with_not_yet_connected() {
    let harness = Harness::unregistered(EmbeddedTransport::new());
    harness.register();
    let written = harness.channel.write_and_flush("early");
    assert_eq!(code_of(&written), Some(codes::CHANNEL_NOT_YET_CONNECTED));
}

/// 写完成监听器在 flush 过程中关闭通道：剩余写入失败，未激活与注销事件推迟到 flush 退出之后。
#[test]
fn close_from_within_flush_defers_inactive() {
    let log = EventLog::default();
    let harness = Harness::connected();
    recorded(&harness, &log);
    log.clear();

    let first = harness.channel.write("first");
    let weak: Weak<Channel> = Arc::downgrade(&harness.channel);
    let closed_in_listener: Arc<Mutex<Option<ChannelFuture>>> = Arc::default();
    let slot = Arc::clone(&closed_in_listener);
    let inactive_seen = log.clone();
    first.add_listener(move |done| {
        assert!(done.is_success());
        assert!(
            !inactive_seen.entries().iter().any(|entry| entry == "r:inactive"),
            "监听器执行时不应已触发未激活事件"
        );
        if let Some(channel) = weak.upgrade() {
            *slot.lock().expect("锁不应中毒") = Some(channel.close());
        }
    });
    let second = harness.channel.write("second");
    harness.channel.flush();

    assert!(first.is_success());
    assert_eq!(code_of(&second), Some(codes::CHANNEL_CLOSED));
    assert_eq!(&harness.transport.wire()[..], b"first");
    assert_eq!(
        harness.transport.count(&TransportCall::Write { messages: 1 }),
        1
    );
    let close = closed_in_listener
        .lock()
        .expect("锁不应中毒")
        .take()
        .expect("监听器应发起关闭");
    assert!(close.is_success());
    assert!(
        !log.of("r").contains(&"inactive".to_owned()),
        "flush 返回前不触发未激活事件"
    );

    harness.run();
    let tail: Vec<String> = log
        .of("r")
        .into_iter()
        .filter(|entry| entry == "inactive" || entry == "unregistered")
        .collect();
    assert_eq!(tail, vec!["inactive", "unregistered"]);
}

#[test]
fn write_error_with_auto_close_closes_channel() {
    let log = EventLog::default();
    let harness = Harness::connected();
    recorded(&harness, &log);
    harness
        .transport
        .fail_next(FaultPoint::Write, io::ErrorKind::BrokenPipe);

    let written = harness.channel.write_and_flush("doomed");
    assert_eq!(code_of(&written), Some(codes::TRANSPORT_IO));
    assert!(!harness.channel.is_open());

    let late = harness.channel.write("late");
    let err = late.cause().expect("关闭后写入应失败");
    assert_eq!(err.code(), codes::CHANNEL_CLOSED);
    assert!(err.cause().is_some(), "关闭错误应携带首次关闭原因");

    harness.run();
    assert!(log.of("r").contains(&"unregistered".to_owned()));
}

#[test]
fn write_error_without_auto_close_half_closes() {
    let log = EventLog::default();
    let harness = Harness::connected();
    recorded(&harness, &log);
    harness.channel.config().set_auto_close(false);
    harness
        .transport
        .fail_next(FaultPoint::Write, io::ErrorKind::BrokenPipe);

    let written = harness.channel.write_and_flush("doomed");
    assert_eq!(code_of(&written), Some(codes::CHANNEL_OUTPUT_SHUTDOWN));
    assert!(harness.transport.is_output_shutdown());
    assert!(harness.channel.is_open(), "半关闭后通道保持打开");
    assert!(log.of("r").contains(&"event:output_shutdown".to_owned()));

    let late = harness.channel.write("late");
    assert_eq!(code_of(&late), Some(codes::CHANNEL_OUTPUT_SHUTDOWN));
}

#[test]
fn failed_half_close_falls_back_to_close() {
    let log = EventLog::default();
    let harness = Harness::connected();
    recorded(&harness, &log);
    harness.channel.config().set_auto_close(false);
    harness
        .transport
        .fail_next(FaultPoint::Write, io::ErrorKind::BrokenPipe);
    harness
        .transport
        .fail_next(FaultPoint::ShutdownOutput, io::ErrorKind::Unsupported);

    let written = harness.channel.write_and_flush("doomed");
    assert!(written.is_done());
    assert!(!harness.channel.is_open());
    assert_eq!(harness.transport.count(&TransportCall::Close), 1);

    harness.run();
    let entries = log.of("r");
    assert!(entries.contains(&"inactive".to_owned()));
    assert!(entries.contains(&"unregistered".to_owned()));
}

#[test]
fn explicit_shutdown_output_fires_user_event() {
    let log = EventLog::default();
    let harness = Harness::connected();
    recorded(&harness, &log);

    let pending = harness.channel.write("unflushed");
    let shutdown = harness.channel.shutdown_output();
    assert!(shutdown.is_success());
    assert_eq!(code_of(&pending), Some(codes::CHANNEL_OUTPUT_SHUTDOWN));
    assert!(log.of("r").contains(&"event:output_shutdown".to_owned()));

    let again = harness.channel.shutdown_output();
    assert_eq!(code_of(&again), Some(codes::CHANNEL_OUTPUT_SHUTDOWN));
}

#[test]
fn partial_write_keeps_remaining_bytes() {
    let harness = Harness::connected();
    harness.transport.limit_write(Some(3));

    let written = harness.channel.write_and_flush("hello");
    assert!(!written.is_done());
    assert_eq!(&harness.transport.wire()[..], b"hel");
    assert_eq!(harness.channel.bytes_before_writable(), 0);

    harness.transport.limit_write(None);
    harness.channel.flush();
    assert!(written.is_success());
    assert_eq!(&harness.transport.wire()[..], b"hello");
}

#[test]
fn water_marks_drive_writability_events() {
    let log = EventLog::default();
    let harness = Harness::connected();
    recorded(&harness, &log);
    harness
        .channel
        .config()
        .set_write_buffer_water_mark(WriteBufferWaterMark::new(4, 8).expect("水位合法"));
    log.clear();

    harness.channel.write("0123456789");
    assert!(!harness.channel.is_writable());
    assert_eq!(log.of("r"), vec!["write", "writable:false"]);

    harness.channel.flush();
    assert!(harness.channel.is_writable());
    assert_eq!(
        log.of("r"),
        vec!["write", "writable:false", "flush", "writable:true"]
    );
}

#[test]
fn disconnect_without_support_closes() {
    let log = EventLog::default();
    let harness = Harness::connected();
    recorded(&harness, &log);
    log.clear();

    let disconnected = harness.channel.disconnect();
    assert!(disconnected.is_success());
    assert_eq!(log.of("r"), vec!["close"]);
    assert!(!harness.channel.is_open());
}

#[test]
fn disconnect_with_support_keeps_channel_open() {
    let log = EventLog::default();
    let harness = Harness::unregistered(
        EmbeddedTransport::connected(addr(LOCAL), addr(REMOTE)).with_disconnect(),
    );
    recorded(&harness, &log);
    harness.register();
    assert_eq!(harness.channel.remote_address(), Some(addr(REMOTE)));
    log.clear();

    let disconnected = harness.channel.disconnect();
    assert!(disconnected.is_success());
    harness.run();
    assert_eq!(log.of("r"), vec!["disconnect", "inactive"]);
    assert!(harness.channel.is_open());
    assert_eq!(harness.channel.remote_address(), None);
}

#[test]
fn deregister_and_register_elsewhere() {
    let log = EventLog::default();
    let harness = Harness::unregistered(EmbeddedTransport::connected(addr(LOCAL), addr(REMOTE)));
    recorded(&harness, &log);
    harness.register();
    let reads_before = harness.transport.count(&TransportCall::BeginRead);
    log.clear();

    let deregistered = harness.channel.deregister();
    harness.run();
    assert!(deregistered.is_success());
    assert!(!harness.channel.is_registered());
    assert_eq!(log.of("r"), vec!["deregister", "unregistered"]);
    assert!(harness.channel.is_open());

    let other = EmbeddedEventLoop::new();
    let registered = harness
        .channel
        .register(Arc::clone(&other) as Arc<dyn EventExecutor>);
    assert!(registered.is_success());
    assert_eq!(
        log.of("r"),
        vec!["deregister", "unregistered", "registered"]
    );
    assert_eq!(
        harness.transport.count(&TransportCall::BeginRead),
        reads_before + 1,
        "再次注册不重复触发 active，只恢复读取"
    );
}

#[test]
fn auto_read_toggle_reaches_transport() {
    let harness = Harness::connected();
    let reads = harness.transport.count(&TransportCall::BeginRead);

    harness.channel.config().set_auto_read(false);
    assert_eq!(harness.transport.count(&TransportCall::AutoReadCleared), 1);

    harness.channel.config().set_auto_read(true);
    assert_eq!(harness.transport.count(&TransportCall::BeginRead), reads + 1);
}

#[test]
fn read_failure_reports_and_closes() {
    let log = EventLog::default();
    let harness = Harness::connected();
    harness
        .channel
        .pipeline()
        .add_last(Some("sink"), Handler::inbound(ExceptionSink::new(&log)))
        .expect("添加异常收集器");
    harness
        .transport
        .fail_next(FaultPoint::BeginRead, io::ErrorKind::ConnectionReset);

    harness.channel.read();
    assert!(!harness.channel.is_open());
    harness.run();
    assert_eq!(log.entries(), vec![format!("sink:{}", codes::TRANSPORT_IO)]);
}

#[test]
fn close_executor_runs_transport_close_off_loop() {
    let log = EventLog::default();
    let harness = Harness::connected();
    recorded(&harness, &log);
    let closer = SingleThreadEventLoop::new("closer").expect("事件循环应能启动");
    harness
        .transport
        .set_close_executor(Some(closer.clone() as Arc<dyn EventExecutor>));
    log.clear();

    let closed = harness.channel.close();
    block_on(closed).expect("关闭应成功");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !log.of("r").contains(&"unregistered".to_owned()) {
        assert!(Instant::now() < deadline, "收尾任务应回到通道的事件循环");
        harness.run();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(
        log.of("r"),
        vec!["close", "inactive", "unregistered", "removed"]
    );
    block_on(closer.shutdown_gracefully()).expect("事件循环应正常关闭");
}

#[test]
fn child_channel_keeps_parent() {
    let parent = Harness::connected();
    let child = Channel::with_parent(
        &parent.channel,
        EmbeddedTransport::connected(addr(LOCAL), addr(REMOTE)),
    );
    assert_eq!(child.parent().map(|p| p.id()), Some(parent.channel.id()));
    assert_ne!(child.id(), parent.channel.id());
}
