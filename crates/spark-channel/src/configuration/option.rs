//! 通道选项的类型化键。
//!
//! ## 设计目的（Why）
//! - 以 `const` 键代替自由字符串：键本身携带值类型、读取函数与带校验的写入函数，
//!   调用方在编译期就能发现类型不匹配。
//!
//! ## 契约定义（What）
//! - `name`：在 `channel` 域内唯一的稳定名称；
//! - 写入即时生效，校验失败返回 `config.invalid` 且不改变原值。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{MessageSizeEstimator, RecvBufferAllocator};
use crate::error::Result;

use super::{ChannelConfig, WriteBufferWaterMark};

/// 类型化的通道选项键。
pub struct ChannelOption<T: 'static> {
    name: &'static str,
    summary: &'static str,
    get: fn(&ChannelConfig) -> T,
    set: fn(&ChannelConfig, T) -> Result<()>,
}

impl<T: 'static> ChannelOption<T> {
    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn summary(&self) -> &'static str {
        self.summary
    }

    pub(crate) fn read(&self, config: &ChannelConfig) -> T {
        (self.get)(config)
    }

    pub(crate) fn write(&self, config: &ChannelConfig, value: T) -> Result<()> {
        (self.set)(config, value)
    }
}

impl<T: 'static> fmt::Debug for ChannelOption<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOption")
            .field("name", &self.name)
            .finish()
    }
}

impl<T: 'static> fmt::Display for ChannelOption<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel.{}", self.name)
    }
}

pub const CONNECT_TIMEOUT: ChannelOption<Duration> = ChannelOption {
    name: "connect_timeout",
    summary: "客户端连接超时，零表示不设超时",
    get: |config| config.connect_timeout(),
    set: |config, value| {
        config.set_connect_timeout(value);
        Ok(())
    },
};

pub const AUTO_READ: ChannelOption<bool> = ChannelOption {
    name: "auto_read",
    summary: "激活与每轮读取完成后自动发起下一次读取",
    get: |config| config.is_auto_read(),
    set: |config, value| {
        config.set_auto_read(value);
        Ok(())
    },
};

pub const AUTO_CLOSE: ChannelOption<bool> = ChannelOption {
    name: "auto_close",
    summary: "写失败时直接关闭通道，关闭后改为半关闭输出",
    get: |config| config.is_auto_close(),
    set: |config, value| {
        config.set_auto_close(value);
        Ok(())
    },
};

pub const WRITE_SPIN_COUNT: ChannelOption<u32> = ChannelOption {
    name: "write_spin_count",
    summary: "单次 flush 中传输最多尝试写出的轮数",
    get: |config| config.write_spin_count(),
    set: |config, value| config.set_write_spin_count(value),
};

pub const MAX_MESSAGES_PER_WRITE: ChannelOption<u32> = ChannelOption {
    name: "max_messages_per_write",
    summary: "单次 flush 中传输最多写出的消息数",
    get: |config| config.max_messages_per_write(),
    set: |config, value| config.set_max_messages_per_write(value),
};

pub const WRITE_BUFFER_WATER_MARK: ChannelOption<WriteBufferWaterMark> = ChannelOption {
    name: "write_buffer_water_mark",
    summary: "出站缓冲高低水位线",
    get: |config| config.write_buffer_water_mark(),
    set: |config, value| {
        config.set_write_buffer_water_mark(value);
        Ok(())
    },
};

pub const RECV_BUFFER_ALLOCATOR: ChannelOption<Arc<dyn RecvBufferAllocator>> = ChannelOption {
    name: "recv_buffer_allocator",
    summary: "接收缓冲容量分配策略",
    get: |config| config.recv_buffer_allocator(),
    set: |config, value| {
        config.set_recv_buffer_allocator(value);
        Ok(())
    },
};

pub const MESSAGE_SIZE_ESTIMATOR: ChannelOption<Arc<dyn MessageSizeEstimator>> = ChannelOption {
    name: "message_size_estimator",
    summary: "出站消息待写字节数估算器",
    get: |config| config.message_size_estimator(),
    set: |config, value| {
        config.set_message_size_estimator(value);
        Ok(())
    },
};
