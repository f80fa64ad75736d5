//! 通道配置：类型化选项键、即时生效的配置对象与水位线。

mod config;
mod option;
mod water_mark;

pub use config::{ChannelConfig, ChannelConfigSnapshot};
pub use option::ChannelOption;
pub use water_mark::WriteBufferWaterMark;

/// 内置选项键，配合 [`ChannelConfig::set_option`] 使用。
pub mod options {
    pub use super::option::{
        AUTO_CLOSE, AUTO_READ, CONNECT_TIMEOUT, MAX_MESSAGES_PER_WRITE, MESSAGE_SIZE_ESTIMATOR,
        RECV_BUFFER_ALLOCATOR, WRITE_BUFFER_WATER_MARK, WRITE_SPIN_COUNT,
    };
}
