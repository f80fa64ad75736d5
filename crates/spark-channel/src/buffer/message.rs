use std::any::Any;
use std::fmt;

use bytes::Bytes;

/// 在管线中流动的消息。
///
/// # 设计意图（Why）
/// - 消息的生命周期以所有权表达：入队到出站缓冲后由缓冲持有，直到对应 Promise 完成；
///   离开作用域即释放，不需要手动 retain/release；
/// - 字节数据使用 [`Bytes`]，切片与克隆只增加引用计数，适合 gather 写与部分写推进。
///
/// # 契约说明（What）
/// - `Buffer`：可直接写入传输的字节；
/// - `User`：任意业务对象，需要由某个出站处理器编码为 `Buffer` 后才能被字节型传输消费。
pub enum PipelineMessage {
    Buffer(Bytes),
    User(Box<dyn Any + Send>),
}

impl PipelineMessage {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::Buffer(bytes.into())
    }

    pub fn from_user<T: Any + Send>(value: T) -> Self {
        Self::User(Box::new(value))
    }

    /// 字节消息的可读长度；业务对象返回 `None`。
    pub fn readable_bytes(&self) -> Option<usize> {
        match self {
            Self::Buffer(bytes) => Some(bytes.len()),
            Self::User(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Buffer(bytes) => Some(bytes),
            Self::User(_) => None,
        }
    }

    pub fn into_bytes(self) -> Result<Bytes, Self> {
        match self {
            Self::Buffer(bytes) => Ok(bytes),
            other => Err(other),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::User(value) => value.downcast_ref::<T>(),
            Self::Buffer(_) => None,
        }
    }

    /// 取出业务对象；类型不符时原样返还消息。
    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        match self {
            Self::User(value) => match value.downcast::<T>() {
                Ok(typed) => Ok(*typed),
                Err(value) => Err(Self::User(value)),
            },
            other => Err(other),
        }
    }

    /// 用于日志的消息种类描述。
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::User(_) => "user",
        }
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(bytes) => f.debug_tuple("Buffer").field(&bytes.len()).finish(),
            Self::User(_) => f.write_str("User(..)"),
        }
    }
}

impl From<Bytes> for PipelineMessage {
    fn from(bytes: Bytes) -> Self {
        Self::Buffer(bytes)
    }
}

impl From<Vec<u8>> for PipelineMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for PipelineMessage {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Buffer(Bytes::from_static(bytes))
    }
}

impl From<&'static str> for PipelineMessage {
    fn from(text: &'static str) -> Self {
        Self::Buffer(Bytes::from_static(text.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_returns_message_on_mismatch() {
        let msg = PipelineMessage::from_user(7_u32);
        let msg = msg.downcast::<String>().expect_err("类型不符应返还消息");
        assert_eq!(msg.downcast_ref::<u32>(), Some(&7));
        assert_eq!(msg.readable_bytes(), None);
    }
}
