//! 通道核心的统一错误模型。
//!
//! # 设计意图（Why）
//! - 通道、管线与出站缓冲的所有失败最终都会落到某个 Promise 或管线异常事件上，
//!   同一个失败往往需要同时通知多个监听器，因此错误对象必须可以廉价克隆。
//! - 错误码遵循 `<领域>.<语义>` 约定，便于在日志中检索并按领域聚合。
//!
//! # 契约说明（What）
//! - [`CoreError`] 携带稳定错误码、面向排障人员的消息与可选的底层原因；
//! - [`ConnectError`] 将连接阶段的底层 I/O 错误与目标地址绑定，作为 [`CoreError`] 的 cause 暴露。

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error as ThisError;

/// 共享的底层错误原因。
pub type ErrorCause = Arc<dyn Error + Send + Sync + 'static>;

/// 通道核心使用的统一结果别名。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;

/// 通道核心的错误类型。
///
/// # 契约说明（What）
/// - `code`：稳定错误码，取值见 [`codes`]；
/// - `message`：自然语言描述，不包含敏感信息；
/// - `cause`：可选的底层原因，以 `Arc` 共享，保证 [`Clone`] 不会丢失链路。
///
/// # 风险提示（Trade-offs）
/// - 克隆只复制引用计数，底层原因对象在多个 Promise 间共享，调用方不应依赖其可变性。
#[derive(Clone)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带底层原因，返回新的错误对象。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 附带已共享的底层原因。
    pub fn with_shared_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 判断错误码是否与给定值一致。
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    /// 若底层原因是 [`ConnectError`]，返回其引用。
    pub fn connect_error(&self) -> Option<&ConnectError> {
        self.cause
            .as_deref()
            .and_then(|cause| cause.downcast_ref::<ConnectError>())
    }

    /// 将传输层 I/O 错误包装为 `transport.io`。
    pub fn from_io(context: &'static str, err: io::Error) -> Self {
        Self::new(codes::TRANSPORT_IO, format!("{context}: {err}")).with_cause(err)
    }

    /// 通道已关闭时使用的标准错误，`initial` 为首次关闭的原因（若存在）。
    pub(crate) fn closed_channel(operation: &'static str, initial: Option<&CoreError>) -> Self {
        let err = Self::new(
            codes::CHANNEL_CLOSED,
            format!("通道已关闭，无法执行 {operation}"),
        );
        match initial {
            Some(cause) => err.with_cause(cause.clone()),
            None => err,
        }
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreError")
            .field("code", &self.code)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}

impl PartialEq for CoreError {
    /// 以错误码与消息判等；底层原因只比较是否同一实例。
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.message == other.message
            && match (&self.cause, &other.cause) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

/// 连接阶段的传输错误，携带目标地址以便排障。
///
/// # 契约说明（What）
/// - 由 [`ConnectError::classify`] 根据 [`io::ErrorKind`] 划分为拒绝、不可达与一般套接字错误；
/// - 连接超时由通道自身产生，不包含底层 I/O 错误。
#[derive(Debug, ThisError)]
pub enum ConnectError {
    #[error("连接被拒绝: {remote}")]
    Refused {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("目标主机不可达: {remote}")]
    HostUnreachable {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("套接字错误 ({remote}): {source}")]
    Socket {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("连接超时: {remote}")]
    TimedOut { remote: SocketAddr },
}

impl ConnectError {
    /// 按错误族划分底层错误并附加目标地址。
    pub fn classify(source: io::Error, remote: SocketAddr) -> Self {
        match source.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused { remote, source },
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                Self::HostUnreachable { remote, source }
            }
            _ => Self::Socket { remote, source },
        }
    }

    /// 尝试连接的远端地址。
    pub fn remote(&self) -> SocketAddr {
        match self {
            Self::Refused { remote, .. }
            | Self::HostUnreachable { remote, .. }
            | Self::Socket { remote, .. }
            | Self::TimedOut { remote } => *remote,
        }
    }

    /// 与错误族对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Refused { .. } => codes::TRANSPORT_CONNECTION_REFUSED,
            Self::HostUnreachable { .. } => codes::TRANSPORT_HOST_UNREACHABLE,
            Self::Socket { .. } => codes::TRANSPORT_IO,
            Self::TimedOut { .. } => codes::TRANSPORT_CONNECT_TIMEOUT,
        }
    }
}

impl From<ConnectError> for CoreError {
    fn from(err: ConnectError) -> Self {
        CoreError::new(err.code(), err.to_string()).with_cause(err)
    }
}

/// 稳定错误码集合。
///
/// 错误码一经发布不得改名，新增语义时追加常量。
pub mod codes {
    /// 通道已关闭或正在关闭。
    pub const CHANNEL_CLOSED: &str = "channel.closed";
    /// 通道已打开但尚未激活。
    pub const CHANNEL_NOT_YET_CONNECTED: &str = "channel.not_yet_connected";
    /// 通道已经注册到事件循环。
    pub const CHANNEL_ALREADY_REGISTERED: &str = "channel.already_registered";
    /// 通道尚未注册到事件循环。
    pub const CHANNEL_NOT_REGISTERED: &str = "channel.not_registered";
    /// 事件循环与通道的传输族不兼容。
    pub const CHANNEL_INCOMPATIBLE_EVENT_LOOP: &str = "channel.incompatible_event_loop";
    /// 输出方向已半关闭。
    pub const CHANNEL_OUTPUT_SHUTDOWN: &str = "channel.output_shutdown";
    /// 已有连接请求正在进行。
    pub const CHANNEL_CONNECTION_PENDING: &str = "channel.connection_pending";
    /// 传输层 I/O 错误。
    pub const TRANSPORT_IO: &str = "transport.io";
    /// 连接被拒绝。
    pub const TRANSPORT_CONNECTION_REFUSED: &str = "transport.connection_refused";
    /// 目标主机不可达。
    pub const TRANSPORT_HOST_UNREACHABLE: &str = "transport.host_unreachable";
    /// 连接超时。
    pub const TRANSPORT_CONNECT_TIMEOUT: &str = "transport.connect_timeout";
    /// 传输不支持的出站消息类型。
    pub const TRANSPORT_UNSUPPORTED_MESSAGE: &str = "transport.unsupported_message";
    /// 处理器名称重复。
    pub const PIPELINE_DUPLICATE_NAME: &str = "pipeline.duplicate_name";
    /// 处理器不存在。
    pub const PIPELINE_HANDLER_NOT_FOUND: &str = "pipeline.handler_not_found";
    /// 非共享处理器被重复添加。
    pub const PIPELINE_HANDLER_NOT_SHAREABLE: &str = "pipeline.handler_not_shareable";
    /// `handler_added` 回调失败。
    pub const PIPELINE_HANDLER_ADDED_FAILED: &str = "pipeline.handler_added_failed";
    /// `handler_removed` 回调失败。
    pub const PIPELINE_HANDLER_REMOVED_FAILED: &str = "pipeline.handler_removed_failed";
    /// Promise 已完成，不能再次设置结果。
    pub const PROMISE_ALREADY_COMPLETE: &str = "promise.already_complete";
    /// Promise 已被取消。
    pub const PROMISE_CANCELLED: &str = "promise.cancelled";
    /// 执行器已关闭，拒绝新任务。
    pub const RUNTIME_SHUTDOWN: &str = "runtime.shutdown";
    /// 配置值非法。
    pub const CONFIG_INVALID: &str = "config.invalid";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_contains_code_and_message() {
        let err = CoreError::new(codes::CHANNEL_CLOSED, "boom");
        assert_eq!(err.to_string(), "[channel.closed] boom");
        assert!(err.is(codes::CHANNEL_CLOSED));
    }

    #[test]
    fn clone_shares_cause() {
        let err = CoreError::new(codes::TRANSPORT_IO, "write")
            .with_cause(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        let copy = err.clone();
        assert_eq!(err, copy, "克隆后的错误应共享同一原因实例");
        assert!(copy.source().is_some());
    }

    #[test]
    fn connect_error_classification_keeps_remote() {
        let remote: SocketAddr = "10.0.0.1:80".parse().expect("地址合法");
        let refused = ConnectError::classify(io::ErrorKind::ConnectionRefused.into(), remote);
        assert_eq!(refused.code(), codes::TRANSPORT_CONNECTION_REFUSED);
        let unreachable = ConnectError::classify(io::ErrorKind::HostUnreachable.into(), remote);
        assert_eq!(unreachable.code(), codes::TRANSPORT_HOST_UNREACHABLE);
        let other = ConnectError::classify(io::ErrorKind::Other.into(), remote);
        assert_eq!(other.code(), codes::TRANSPORT_IO);

        let core: CoreError = refused.into();
        assert_eq!(core.connect_error().map(ConnectError::remote), Some(remote));
        assert!(core.message().contains("10.0.0.1:80"));
    }
}
