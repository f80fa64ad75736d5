//! 内存传输：记录每一次钩子调用，并支持按需注入故障。
//!
//! 主要服务于测试与示例：克隆体共享同一份状态，测试可以在通道持有传输的同时观察和操纵它。

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::buffer::{OutboundBuffer, PipelineMessage};
use crate::channel::Channel;
use crate::configuration::ChannelConfig;
use crate::runtime::{EmbeddedEventLoop, EventExecutor};

use super::{ChannelMetadata, ConnectProgress, Transport};

/// 被记录的钩子调用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportCall {
    Register,
    Bind(SocketAddr),
    Connect(SocketAddr),
    Disconnect,
    Close,
    ShutdownOutput,
    Deregister,
    BeginRead,
    Write { messages: usize },
    AutoReadCleared,
}

/// 可注入故障的钩子。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Register,
    Bind,
    Connect,
    Disconnect,
    Close,
    ShutdownOutput,
    BeginRead,
    Write,
}

#[derive(Default)]
struct Shared {
    open: AtomicBool,
    active: AtomicBool,
    output_shutdown: AtomicBool,
    has_disconnect: AtomicBool,
    defer_connect: AtomicBool,
    embedded_only: AtomicBool,
    local: Mutex<Option<SocketAddr>>,
    remote: Mutex<Option<SocketAddr>>,
    calls: Mutex<Vec<TransportCall>>,
    faults: Mutex<HashMap<FaultPoint, io::ErrorKind>>,
    batches: Mutex<Vec<Vec<PipelineMessage>>>,
    wire: Mutex<BytesMut>,
    write_limit: Mutex<Option<usize>>,
    close_executor: Mutex<Option<Arc<dyn EventExecutor>>>,
}

/// 内存传输句柄。
#[derive(Clone, Default)]
pub struct EmbeddedTransport {
    shared: Arc<Shared>,
}

impl EmbeddedTransport {
    /// 已打开、尚未激活的传输。
    pub fn new() -> Self {
        let transport = Self::default();
        transport.shared.open.store(true, Ordering::Release);
        transport
    }

    /// 已连接的传输，模拟服务端接受的子连接。
    pub fn connected(local: SocketAddr, remote: SocketAddr) -> Self {
        let transport = Self::new();
        transport.shared.active.store(true, Ordering::Release);
        *transport.shared.local.lock() = Some(local);
        *transport.shared.remote.lock() = Some(remote);
        transport
    }

    /// 声明支持断开后重连。
    pub fn with_disconnect(self) -> Self {
        self.shared.has_disconnect.store(true, Ordering::Release);
        self
    }

    /// 只接受 [`EmbeddedEventLoop`]。
    pub fn embedded_loop_only(self) -> Self {
        self.shared.embedded_only.store(true, Ordering::Release);
        self
    }

    /// 之后的 `do_connect` 返回 `Pending`。
    pub fn defer_connect(&self) {
        self.shared.defer_connect.store(true, Ordering::Release);
    }

    /// 下一次调用 `point` 对应的钩子时返回 `kind` 错误（一次性）。
    pub fn fail_next(&self, point: FaultPoint, kind: io::ErrorKind) {
        self.shared.faults.lock().insert(point, kind);
    }

    /// 每次 `do_write` 最多写出的字节数，超出部分留在缓冲中。
    pub fn limit_write(&self, max_bytes: Option<usize>) {
        *self.shared.write_limit.lock() = max_bytes;
    }

    /// 由 `prepare_to_close` 返回的关闭执行器。
    pub fn set_close_executor(&self, executor: Option<Arc<dyn EventExecutor>>) {
        *self.shared.close_executor.lock() = executor;
    }

    /// 直接改变激活状态，模拟异步连接完成或对端断开。
    pub fn set_active(&self, active: bool) {
        self.shared.active.store(active, Ordering::Release);
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.shared.calls.lock().clone()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        self.shared
            .calls
            .lock()
            .iter()
            .filter(|recorded| *recorded == call)
            .count()
    }

    /// 取走每次 `do_write` 完整写出的消息批次。
    pub fn take_batches(&self) -> Vec<Vec<PipelineMessage>> {
        std::mem::take(&mut *self.shared.batches.lock())
    }

    /// 到目前为止写到“线上”的全部字节。
    pub fn wire(&self) -> BytesMut {
        self.shared.wire.lock().clone()
    }

    pub fn is_output_shutdown(&self) -> bool {
        self.shared.output_shutdown.load(Ordering::Acquire)
    }

    fn record(&self, call: TransportCall) {
        self.shared.calls.lock().push(call);
    }

    fn check_fault(&self, point: FaultPoint) -> io::Result<()> {
        match self.shared.faults.lock().remove(&point) {
            Some(kind) => Err(io::Error::new(kind, format!("injected {point:?} failure"))),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for EmbeddedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddedTransport")
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .field("local", &self.local_address())
            .field("remote", &self.remote_address())
            .finish()
    }
}

impl Transport for EmbeddedTransport {
    fn metadata(&self) -> ChannelMetadata {
        ChannelMetadata::new(self.shared.has_disconnect.load(Ordering::Acquire))
    }

    fn is_compatible(&self, executor: &dyn EventExecutor) -> bool {
        !self.shared.embedded_only.load(Ordering::Acquire)
            || executor.as_any().is::<EmbeddedEventLoop>()
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.is_open() && self.shared.active.load(Ordering::Acquire)
    }

    fn local_address(&self) -> Option<SocketAddr> {
        *self.shared.local.lock()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        *self.shared.remote.lock()
    }

    fn do_register(&self, _channel: &Channel) -> io::Result<()> {
        self.record(TransportCall::Register);
        self.check_fault(FaultPoint::Register)
    }

    fn do_bind(&self, local: SocketAddr) -> io::Result<()> {
        self.record(TransportCall::Bind(local));
        self.check_fault(FaultPoint::Bind)?;
        *self.shared.local.lock() = Some(local);
        self.shared.active.store(true, Ordering::Release);
        Ok(())
    }

    fn do_connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> io::Result<ConnectProgress> {
        self.record(TransportCall::Connect(remote));
        self.check_fault(FaultPoint::Connect)?;
        if let Some(local) = local {
            *self.shared.local.lock() = Some(local);
        }
        *self.shared.remote.lock() = Some(remote);
        if self.shared.defer_connect.load(Ordering::Acquire) {
            return Ok(ConnectProgress::Pending);
        }
        self.shared.active.store(true, Ordering::Release);
        Ok(ConnectProgress::Connected)
    }

    fn do_disconnect(&self) -> io::Result<()> {
        self.record(TransportCall::Disconnect);
        self.check_fault(FaultPoint::Disconnect)?;
        self.shared.active.store(false, Ordering::Release);
        *self.shared.remote.lock() = None;
        Ok(())
    }

    fn do_close(&self) -> io::Result<()> {
        self.record(TransportCall::Close);
        // 故障只影响返回值，资源照常释放。
        self.shared.open.store(false, Ordering::Release);
        self.shared.active.store(false, Ordering::Release);
        self.check_fault(FaultPoint::Close)
    }

    fn do_shutdown_output(&self) -> io::Result<()> {
        self.record(TransportCall::ShutdownOutput);
        self.check_fault(FaultPoint::ShutdownOutput)?;
        self.shared.output_shutdown.store(true, Ordering::Release);
        Ok(())
    }

    fn do_deregister(&self) -> io::Result<()> {
        self.record(TransportCall::Deregister);
        Ok(())
    }

    fn do_begin_read(&self) -> io::Result<()> {
        self.record(TransportCall::BeginRead);
        self.check_fault(FaultPoint::BeginRead)
    }

    fn do_write(&self, buffer: &OutboundBuffer, config: &ChannelConfig) -> io::Result<()> {
        if let Err(err) = self.check_fault(FaultPoint::Write) {
            self.record(TransportCall::Write { messages: 0 });
            return Err(err);
        }
        let max_messages = config.max_messages_per_write() as usize;
        let mut budget = *self.shared.write_limit.lock();
        let mut batch = Vec::new();
        while batch.len() < max_messages {
            let Some(remaining) = buffer.with_current(PipelineMessage::readable_bytes) else {
                break;
            };
            if let (Some(len), Some(limit)) = (remaining, budget)
                && len > limit
            {
                if limit > 0
                    && let Some(bytes) = buffer.current_bytes()
                {
                    self.shared.wire.lock().extend_from_slice(&bytes[..limit]);
                    buffer.remove_bytes(limit as u64);
                }
                break;
            }
            let Some(msg) = buffer.remove_and_take() else {
                break;
            };
            if let Some(bytes) = msg.as_bytes() {
                self.shared.wire.lock().extend_from_slice(bytes);
                if let Some(limit) = budget.as_mut() {
                    *limit -= bytes.len();
                }
            }
            batch.push(msg);
        }
        self.record(TransportCall::Write {
            messages: batch.len(),
        });
        self.shared.batches.lock().push(batch);
        Ok(())
    }

    fn prepare_to_close(&self) -> Option<Arc<dyn EventExecutor>> {
        self.shared.close_executor.lock().clone()
    }

    fn auto_read_cleared(&self) {
        self.record(TransportCall::AutoReadCleared);
    }
}
