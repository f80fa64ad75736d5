use super::PipelineMessage;

/// 估算出站消息占用的待写字节数，用于水位线记账。
pub trait MessageSizeEstimator: Send + Sync + 'static {
    fn size(&self, msg: &PipelineMessage) -> usize;
}

/// 默认估算器：字节消息取可读长度，业务对象取固定的 `unknown_size`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefaultMessageSizeEstimator {
    unknown_size: usize,
}

impl DefaultMessageSizeEstimator {
    pub const DEFAULT_UNKNOWN_SIZE: usize = 8;

    pub const fn new(unknown_size: usize) -> Self {
        Self { unknown_size }
    }

    pub const fn unknown_size(&self) -> usize {
        self.unknown_size
    }
}

impl Default for DefaultMessageSizeEstimator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_UNKNOWN_SIZE)
    }
}

impl MessageSizeEstimator for DefaultMessageSizeEstimator {
    fn size(&self, msg: &PipelineMessage) -> usize {
        msg.readable_bytes().unwrap_or(self.unknown_size)
    }
}
