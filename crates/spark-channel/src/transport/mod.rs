//! 传输原语：通道状态机与具体 I/O 之间的接缝。
//!
//! # 设计意图（Why）
//! - 通道负责生命周期、事件顺序与 Promise 完成，传输只负责“把这件事做了”并报告 I/O 结果；
//! - 所有 `do_*` 钩子都在通道的事件循环线程上被调用（关闭执行器路径下的 `do_close`/`do_shutdown_output` 除外）。
//!
//! # 契约说明（What）
//! - `do_*` 返回 `io::Error` 即表示失败，通道会将其包装为 [`CoreError`](crate::CoreError) 并按规则收尾；
//! - `do_connect` 返回 [`ConnectProgress::Pending`] 时，传输须在连接结束后调用
//!   [`Unsafe::finish_connect`](crate::channel::Unsafe::finish_connect)；
//! - `do_write` 通过 [`OutboundBuffer`] 的 `remove*` 系列方法报告写出进度，没写完的条目保留在缓冲中。

mod embedded;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::{OutboundBuffer, PipelineMessage};
use crate::channel::Channel;
use crate::configuration::ChannelConfig;
use crate::error::Result;
use crate::runtime::EventExecutor;

pub use embedded::{EmbeddedTransport, FaultPoint, TransportCall};

/// 传输的静态能力描述。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelMetadata {
    has_disconnect: bool,
}

impl ChannelMetadata {
    pub const fn new(has_disconnect: bool) -> Self {
        Self { has_disconnect }
    }

    /// 断开后能否再次连接；为 `false` 时 `disconnect` 等同于 `close`。
    pub const fn has_disconnect(&self) -> bool {
        self.has_disconnect
    }
}

impl Default for ChannelMetadata {
    fn default() -> Self {
        Self::new(false)
    }
}

/// `do_connect` 的即时结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectProgress {
    /// 已连接。
    Connected,
    /// 连接仍在进行，完成后由传输调用 `finish_connect`。
    Pending,
}

/// 具体传输需要实现的钩子。
pub trait Transport: Send + Sync + 'static {
    fn metadata(&self) -> ChannelMetadata {
        ChannelMetadata::default()
    }

    /// 能否注册到给定执行器。
    fn is_compatible(&self, _executor: &dyn EventExecutor) -> bool {
        true
    }

    fn is_open(&self) -> bool;

    fn is_active(&self) -> bool;

    fn local_address(&self) -> Option<SocketAddr>;

    fn remote_address(&self) -> Option<SocketAddr>;

    fn do_register(&self, _channel: &Channel) -> io::Result<()> {
        Ok(())
    }

    fn do_bind(&self, local: SocketAddr) -> io::Result<()>;

    fn do_connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> io::Result<ConnectProgress>;

    fn do_disconnect(&self) -> io::Result<()>;

    fn do_close(&self) -> io::Result<()>;

    /// 只关闭输出方向；默认按不支持半关闭处理。
    fn do_shutdown_output(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport does not support half-closure",
        ))
    }

    fn do_deregister(&self) -> io::Result<()> {
        Ok(())
    }

    fn do_begin_read(&self) -> io::Result<()>;

    /// 写出已刷新的条目。
    fn do_write(&self, buffer: &OutboundBuffer, config: &ChannelConfig) -> io::Result<()>;

    /// 入缓冲前的消息校验或转换，拒绝时以返回的错误完成写 Promise。
    fn filter_outbound_message(&self, msg: PipelineMessage) -> Result<PipelineMessage> {
        Ok(msg)
    }

    /// 返回非空执行器时，`do_close`/`do_shutdown_output` 改在该执行器上运行，其余收尾回到事件循环。
    fn prepare_to_close(&self) -> Option<Arc<dyn EventExecutor>> {
        None
    }

    /// 自动读取被关闭，传输可以撤销读兴趣。
    fn auto_read_cleared(&self) {}
}
