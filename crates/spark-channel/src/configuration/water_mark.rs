use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result, codes};

/// 出站缓冲的高低水位线。
///
/// ## 契约定义（What）
/// - 待写字节数 `> high` 时通道变为不可写，`<= low` 时恢复可写；
/// - 构造时保证 `high >= low`，违反即返回 `config.invalid`，不会留下半生效的配置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWaterMark")]
pub struct WriteBufferWaterMark {
    low: usize,
    high: usize,
}

impl WriteBufferWaterMark {
    pub const DEFAULT_LOW: usize = 32 * 1024;
    pub const DEFAULT_HIGH: usize = 64 * 1024;

    pub const DEFAULT: Self = Self {
        low: Self::DEFAULT_LOW,
        high: Self::DEFAULT_HIGH,
    };

    pub fn new(low: usize, high: usize) -> Result<Self> {
        if high < low {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                format!("写缓冲高水位 ({high}) 不能低于低水位 ({low})"),
            ));
        }
        Ok(Self { low, high })
    }

    pub const fn low(&self) -> usize {
        self.low
    }

    pub const fn high(&self) -> usize {
        self.high
    }
}

/// 反序列化的中间形态，经 [`WriteBufferWaterMark::new`] 校验后才成为水位线。
#[derive(Deserialize)]
struct RawWaterMark {
    low: usize,
    high: usize,
}

impl TryFrom<RawWaterMark> for WriteBufferWaterMark {
    type Error = CoreError;

    fn try_from(raw: RawWaterMark) -> Result<Self> {
        Self::new(raw.low, raw.high)
    }
}

impl Default for WriteBufferWaterMark {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for WriteBufferWaterMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriteBufferWaterMark(low: {}, high: {})", self.low, self.high)
    }
}
