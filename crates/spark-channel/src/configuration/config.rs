use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::buffer::{
    AdaptiveRecvBufferAllocator, DefaultMessageSizeEstimator, MessageSizeEstimator,
    RecvBufferAllocator,
};
use crate::channel::Channel;
use crate::error::{CoreError, Result, codes};
use crate::observability::TARGET_CHANNEL;

use super::{ChannelOption, WriteBufferWaterMark};

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_WRITE_SPIN_COUNT: u32 = 16;

/// 通道配置。
///
/// ## 设计目的（Why）
/// - 配置在通道的整个生命周期中都可被任意线程读取与修改，热路径（水位线、自动读取）
///   只做原子读取或 `ArcSwap` 加载，不加锁；
/// - 每个 setter 即时生效：打开自动读取会立即发起一次读取，关闭则通知传输停止读兴趣。
///
/// ## 契约定义（What）
/// - 非法值（零写自旋次数、低水位高于高水位等）返回 `config.invalid`，原值保持不变；
/// - 未绑定通道的配置（[`ChannelConfig::default`]）只存储数值，不产生副作用。
pub struct ChannelConfig {
    channel: Weak<Channel>,
    connect_timeout_ms: AtomicU64,
    auto_read: AtomicBool,
    auto_close: AtomicBool,
    write_spin_count: AtomicU32,
    max_messages_per_write: AtomicU32,
    water_mark: ArcSwap<WriteBufferWaterMark>,
    recv_allocator: RwLock<Arc<dyn RecvBufferAllocator>>,
    size_estimator: RwLock<Arc<dyn MessageSizeEstimator>>,
}

impl ChannelConfig {
    pub(crate) fn for_channel(channel: Weak<Channel>) -> Self {
        Self {
            channel,
            connect_timeout_ms: AtomicU64::new(DEFAULT_CONNECT_TIMEOUT_MS),
            auto_read: AtomicBool::new(true),
            auto_close: AtomicBool::new(true),
            write_spin_count: AtomicU32::new(DEFAULT_WRITE_SPIN_COUNT),
            max_messages_per_write: AtomicU32::new(u32::MAX),
            water_mark: ArcSwap::from_pointee(WriteBufferWaterMark::DEFAULT),
            recv_allocator: RwLock::new(Arc::new(AdaptiveRecvBufferAllocator::default())),
            size_estimator: RwLock::new(Arc::new(DefaultMessageSizeEstimator::default())),
        }
    }

    /// 读取任意选项。
    pub fn option<T: 'static>(&self, option: &ChannelOption<T>) -> T {
        option.read(self)
    }

    /// 写入任意选项，校验失败时原值不变。
    pub fn set_option<T: 'static>(&self, option: &ChannelOption<T>, value: T) -> Result<()> {
        option.write(self, value)?;
        tracing::debug!(target: TARGET_CHANNEL, option = option.name(), "通道选项已更新");
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.connect_timeout_ms.store(millis, Ordering::Release);
    }

    pub fn is_auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }

    /// 切换自动读取；从关到开立即发起 `read`，从开到关通知传输。
    pub fn set_auto_read(&self, auto_read: bool) {
        let previous = self.auto_read.swap(auto_read, Ordering::AcqRel);
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if auto_read && !previous {
            channel.read();
        } else if !auto_read && previous {
            channel.transport().auto_read_cleared();
        }
    }

    pub fn is_auto_close(&self) -> bool {
        self.auto_close.load(Ordering::Acquire)
    }

    pub fn set_auto_close(&self, auto_close: bool) {
        self.auto_close.store(auto_close, Ordering::Release);
    }

    pub fn write_spin_count(&self) -> u32 {
        self.write_spin_count.load(Ordering::Acquire)
    }

    pub fn set_write_spin_count(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(CoreError::new(codes::CONFIG_INVALID, "write_spin_count 必须大于 0"));
        }
        self.write_spin_count.store(count, Ordering::Release);
        Ok(())
    }

    pub fn max_messages_per_write(&self) -> u32 {
        self.max_messages_per_write.load(Ordering::Acquire)
    }

    pub fn set_max_messages_per_write(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(CoreError::new(
                codes::CONFIG_INVALID,
                "max_messages_per_write 必须大于 0",
            ));
        }
        self.max_messages_per_write.store(count, Ordering::Release);
        Ok(())
    }

    pub fn write_buffer_water_mark(&self) -> WriteBufferWaterMark {
        **self.water_mark.load()
    }

    pub fn set_write_buffer_water_mark(&self, water_mark: WriteBufferWaterMark) {
        self.water_mark.store(Arc::new(water_mark));
    }

    /// 只调整高水位，新值不得低于当前低水位。
    pub fn set_write_buffer_high_water_mark(&self, high: usize) -> Result<()> {
        let current = self.write_buffer_water_mark();
        let updated = WriteBufferWaterMark::new(current.low(), high)?;
        self.set_write_buffer_water_mark(updated);
        Ok(())
    }

    /// 只调整低水位，新值不得高于当前高水位。
    pub fn set_write_buffer_low_water_mark(&self, low: usize) -> Result<()> {
        let current = self.write_buffer_water_mark();
        let updated = WriteBufferWaterMark::new(low, current.high())?;
        self.set_write_buffer_water_mark(updated);
        Ok(())
    }

    pub fn recv_buffer_allocator(&self) -> Arc<dyn RecvBufferAllocator> {
        Arc::clone(&self.recv_allocator.read())
    }

    pub fn set_recv_buffer_allocator(&self, allocator: Arc<dyn RecvBufferAllocator>) {
        *self.recv_allocator.write() = allocator;
    }

    pub fn message_size_estimator(&self) -> Arc<dyn MessageSizeEstimator> {
        Arc::clone(&self.size_estimator.read())
    }

    pub fn set_message_size_estimator(&self, estimator: Arc<dyn MessageSizeEstimator>) {
        *self.size_estimator.write() = estimator;
    }

    /// 可序列化的数值快照，便于诊断输出。
    pub fn snapshot(&self) -> ChannelConfigSnapshot {
        let water_mark = self.write_buffer_water_mark();
        ChannelConfigSnapshot {
            connect_timeout_ms: self.connect_timeout_ms.load(Ordering::Acquire),
            auto_read: self.is_auto_read(),
            auto_close: self.is_auto_close(),
            write_spin_count: self.write_spin_count(),
            max_messages_per_write: self.max_messages_per_write(),
            write_buffer_low_water_mark: water_mark.low(),
            write_buffer_high_water_mark: water_mark.high(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::for_channel(Weak::new())
    }
}

impl fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// [`ChannelConfig`] 的数值快照。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelConfigSnapshot {
    pub connect_timeout_ms: u64,
    pub auto_read: bool,
    pub auto_close: bool,
    pub write_spin_count: u32,
    pub max_messages_per_write: u32,
    pub write_buffer_low_water_mark: usize,
    pub write_buffer_high_water_mark: usize,
}
