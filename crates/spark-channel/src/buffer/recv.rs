//! 接收缓冲容量分配策略。
//!
//! 传输在每轮读取前向 [`RecvBufferHandle`] 询问缓冲容量，读取后回报实际字节数，
//! 并据 `continue_reading` 决定是否在同一轮继续读取。

use std::sync::LazyLock;

use bytes::BytesMut;

use crate::configuration::ChannelConfig;
use crate::error::{CoreError, Result, codes};

/// 接收缓冲分配器。
pub trait RecvBufferAllocator: Send + Sync + 'static {
    /// 为一个通道创建独立的读取句柄。
    fn new_handle(&self) -> Box<dyn RecvBufferHandle>;
}

/// 单个通道的读取记账句柄。
pub trait RecvBufferHandle: Send {
    /// 下一次读取建议的缓冲容量。
    fn guess(&self) -> usize;

    fn allocate(&self) -> BytesMut {
        BytesMut::with_capacity(self.guess())
    }

    /// 每轮读取开始前重置计数。
    fn reset(&mut self, config: &ChannelConfig);

    fn inc_messages_read(&mut self, count: u32);

    fn set_last_bytes_read(&mut self, bytes: usize);

    fn last_bytes_read(&self) -> usize;

    fn set_attempted_bytes_read(&mut self, bytes: usize);

    fn attempted_bytes_read(&self) -> usize;

    /// 是否应在本轮继续读取：自动读取开启、上一次读满了尝试的容量、
    /// 消息数未超过上限且本轮确有数据。
    fn continue_reading(&self, config: &ChannelConfig) -> bool;

    /// 本轮读取结束。
    fn read_complete(&mut self);
}

#[derive(Clone, Copy, Debug, Default)]
struct ReadCounters {
    max_messages_per_read: u32,
    total_messages: u32,
    total_bytes_read: usize,
    last_bytes_read: usize,
    attempted_bytes_read: usize,
}

impl ReadCounters {
    fn new(max_messages_per_read: u32) -> Self {
        Self {
            max_messages_per_read,
            ..Self::default()
        }
    }

    fn reset(&mut self) {
        self.total_messages = 0;
        self.total_bytes_read = 0;
    }

    fn set_last_bytes_read(&mut self, bytes: usize) {
        self.last_bytes_read = bytes;
        self.total_bytes_read = self.total_bytes_read.saturating_add(bytes);
    }

    fn continue_reading(&self, config: &ChannelConfig) -> bool {
        config.is_auto_read()
            && self.attempted_bytes_read == self.last_bytes_read
            && self.total_messages < self.max_messages_per_read
            && self.total_bytes_read > 0
    }
}

fn validate_max_messages(max_messages_per_read: u32) -> Result<()> {
    if max_messages_per_read == 0 {
        return Err(CoreError::new(
            codes::CONFIG_INVALID,
            "max_messages_per_read 必须大于 0",
        ));
    }
    Ok(())
}

/// 固定容量分配器。
#[derive(Clone, Copy, Debug)]
pub struct FixedRecvBufferAllocator {
    buffer_size: usize,
    max_messages_per_read: u32,
}

impl FixedRecvBufferAllocator {
    pub fn new(buffer_size: usize, max_messages_per_read: u32) -> Result<Self> {
        if buffer_size == 0 {
            return Err(CoreError::new(codes::CONFIG_INVALID, "buffer_size 必须大于 0"));
        }
        validate_max_messages(max_messages_per_read)?;
        Ok(Self {
            buffer_size,
            max_messages_per_read,
        })
    }
}

impl RecvBufferAllocator for FixedRecvBufferAllocator {
    fn new_handle(&self) -> Box<dyn RecvBufferHandle> {
        Box::new(FixedHandle {
            buffer_size: self.buffer_size,
            counters: ReadCounters::new(self.max_messages_per_read),
        })
    }
}

struct FixedHandle {
    buffer_size: usize,
    counters: ReadCounters,
}

impl RecvBufferHandle for FixedHandle {
    fn guess(&self) -> usize {
        self.buffer_size
    }

    fn reset(&mut self, _config: &ChannelConfig) {
        self.counters.reset();
    }

    fn inc_messages_read(&mut self, count: u32) {
        self.counters.total_messages = self.counters.total_messages.saturating_add(count);
    }

    fn set_last_bytes_read(&mut self, bytes: usize) {
        self.counters.set_last_bytes_read(bytes);
    }

    fn last_bytes_read(&self) -> usize {
        self.counters.last_bytes_read
    }

    fn set_attempted_bytes_read(&mut self, bytes: usize) {
        self.counters.attempted_bytes_read = bytes;
    }

    fn attempted_bytes_read(&self) -> usize {
        self.counters.attempted_bytes_read
    }

    fn continue_reading(&self, config: &ChannelConfig) -> bool {
        self.counters.continue_reading(config)
    }

    fn read_complete(&mut self) {}
}

// 16..=496 步长 16，之后按 2 倍增长到 1 GiB。
static SIZE_TABLE: LazyLock<Vec<usize>> = LazyLock::new(|| {
    let mut table: Vec<usize> = (1..32).map(|step| step * 16).collect();
    let mut size = 512_usize;
    while size <= 1 << 30 {
        table.push(size);
        size <<= 1;
    }
    table
});

const INDEX_INCREMENT: usize = 4;
const INDEX_DECREMENT: usize = 1;

fn size_table_index(size: usize) -> usize {
    match SIZE_TABLE.binary_search(&size) {
        Ok(idx) => idx,
        Err(idx) => idx.min(SIZE_TABLE.len() - 1),
    }
}

/// 根据历史读取量自适应调整容量的分配器。
///
/// 读满建议容量时立即放大（跳 4 档），连续两轮都明显偏小时才缩小一档。
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveRecvBufferAllocator {
    min_index: usize,
    max_index: usize,
    initial: usize,
    max_messages_per_read: u32,
}

impl AdaptiveRecvBufferAllocator {
    pub const DEFAULT_MINIMUM: usize = 64;
    pub const DEFAULT_INITIAL: usize = 2048;
    pub const DEFAULT_MAXIMUM: usize = 65536;
    pub const DEFAULT_MAX_MESSAGES_PER_READ: u32 = 16;

    pub fn new(minimum: usize, initial: usize, maximum: usize) -> Result<Self> {
        if minimum == 0 || initial < minimum || maximum < initial {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                format!("需满足 0 < minimum({minimum}) <= initial({initial}) <= maximum({maximum})"),
            ));
        }
        let mut min_index = size_table_index(minimum);
        if SIZE_TABLE[min_index] < minimum {
            min_index += 1;
        }
        let mut max_index = size_table_index(maximum);
        if SIZE_TABLE[max_index] > maximum {
            max_index = max_index.saturating_sub(1);
        }
        Ok(Self {
            min_index,
            max_index,
            initial,
            max_messages_per_read: Self::DEFAULT_MAX_MESSAGES_PER_READ,
        })
    }

    pub fn with_max_messages_per_read(mut self, max_messages_per_read: u32) -> Result<Self> {
        validate_max_messages(max_messages_per_read)?;
        self.max_messages_per_read = max_messages_per_read;
        Ok(self)
    }
}

impl Default for AdaptiveRecvBufferAllocator {
    fn default() -> Self {
        Self {
            min_index: size_table_index(Self::DEFAULT_MINIMUM),
            max_index: size_table_index(Self::DEFAULT_MAXIMUM),
            initial: Self::DEFAULT_INITIAL,
            max_messages_per_read: Self::DEFAULT_MAX_MESSAGES_PER_READ,
        }
    }
}

impl RecvBufferAllocator for AdaptiveRecvBufferAllocator {
    fn new_handle(&self) -> Box<dyn RecvBufferHandle> {
        let index = size_table_index(self.initial).clamp(self.min_index, self.max_index);
        Box::new(AdaptiveHandle {
            min_index: self.min_index,
            max_index: self.max_index,
            index,
            next_size: SIZE_TABLE[index],
            decrease_now: false,
            counters: ReadCounters::new(self.max_messages_per_read),
        })
    }
}

struct AdaptiveHandle {
    min_index: usize,
    max_index: usize,
    index: usize,
    next_size: usize,
    decrease_now: bool,
    counters: ReadCounters,
}

impl AdaptiveHandle {
    fn record(&mut self, actual: usize) {
        let lower = SIZE_TABLE[self.index.saturating_sub(INDEX_DECREMENT)];
        if actual <= lower {
            if self.decrease_now {
                self.index = self
                    .index
                    .saturating_sub(INDEX_DECREMENT)
                    .max(self.min_index);
                self.next_size = SIZE_TABLE[self.index];
                self.decrease_now = false;
            } else {
                self.decrease_now = true;
            }
        } else if actual >= self.next_size {
            self.index = (self.index + INDEX_INCREMENT).min(self.max_index);
            self.next_size = SIZE_TABLE[self.index];
            self.decrease_now = false;
        }
    }
}

impl RecvBufferHandle for AdaptiveHandle {
    fn guess(&self) -> usize {
        self.next_size
    }

    fn reset(&mut self, _config: &ChannelConfig) {
        self.counters.reset();
    }

    fn inc_messages_read(&mut self, count: u32) {
        self.counters.total_messages = self.counters.total_messages.saturating_add(count);
    }

    fn set_last_bytes_read(&mut self, bytes: usize) {
        // 读满尝试容量时立即调整，避免单轮内持续使用偏小的缓冲。
        if bytes == self.counters.attempted_bytes_read {
            self.record(bytes);
        }
        self.counters.set_last_bytes_read(bytes);
    }

    fn last_bytes_read(&self) -> usize {
        self.counters.last_bytes_read
    }

    fn set_attempted_bytes_read(&mut self, bytes: usize) {
        self.counters.attempted_bytes_read = bytes;
    }

    fn attempted_bytes_read(&self) -> usize {
        self.counters.attempted_bytes_read
    }

    fn continue_reading(&self, config: &ChannelConfig) -> bool {
        self.counters.continue_reading(config)
    }

    fn read_complete(&mut self) {
        self.record(self.counters.total_bytes_read);
    }
}
