//! 通道出站写缓冲。
//!
//! # 设计意图（Why）
//! - `write` 只把消息记入缓冲，`flush` 才把已记入的部分交给传输，二者之间的分界即“已刷新/未刷新”切分点；
//! - 待写字节数与高低水位线共同决定通道可写性，为上游提供背压信号。
//!
//! # 契约说明（What）
//! - 条目严格按插入顺序完成，不会乱序；
//! - 待写字节数只在条目的 Promise 完成（成功、失败或取消）后扣减，永不为负；
//! - 待写字节数超过高水位时不可写，回落到低水位及以下时恢复，每次翻转只触发一次事件；
//! - 部分写通过累计写入计数与条目检查点比较判定完成，计数会定期按公共基数归一化。
//!
//! # 执行说明（How）
//! - 条目队列由互斥锁保护，但锁从不跨越 Promise 通知或可写性事件：
//!   回调中再次写入同一缓冲是安全的；
//! - 待写字节数与不可写位图是原子变量，任何线程都可以无锁读取。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;

use crate::configuration::ChannelConfig;
use crate::error::{CoreError, Result, codes};
use crate::future::ChannelPromise;
use crate::observability::TARGET_OUTBOUND;

use super::PipelineMessage;

/// 写入计数超过该值时按队首条目的起点归一化。
const NORMALIZE_THRESHOLD: u64 = 1 << 40;

/// 水位线位（第 0 位）以外的可写性位由使用方自定义。
const WATER_MARK_BIT: u32 = 1;

/// 可写性翻转的接收方。
///
/// `invoke_later` 为 `true` 时，接收方应把事件排到执行器队列而不是同步触发。
pub trait WritabilityListener: Send + Sync + 'static {
    fn writability_changed(&self, invoke_later: bool);
}

/// 忽略可写性事件的接收方。
#[derive(Clone, Copy, Debug, Default)]
pub struct IgnoreWritability;

impl WritabilityListener for IgnoreWritability {
    fn writability_changed(&self, _invoke_later: bool) {}
}

struct Entry {
    msg: PipelineMessage,
    pending_size: usize,
    promise: ChannelPromise,
    start: u64,
    checkpoint: u64,
    progress: u64,
    cancelled: bool,
}

impl Entry {
    fn wire_len(&self) -> u64 {
        self.msg.readable_bytes().unwrap_or(0) as u64
    }

    /// 取消后消息替换为空缓冲，返回应从账本扣除的字节数。
    fn cancel(&mut self) -> usize {
        self.cancelled = true;
        self.msg = PipelineMessage::Buffer(Bytes::new());
        std::mem::take(&mut self.pending_size)
    }
}

#[derive(Default)]
struct Ledger {
    entries: VecDeque<Entry>,
    flushed: usize,
    write_counter: u64,
    flush_offset: u64,
    deferred_close: Option<CoreError>,
}

impl Ledger {
    fn pop_flushed(&mut self) -> Option<Entry> {
        if self.flushed == 0 {
            return None;
        }
        let entry = self.entries.pop_front()?;
        self.flushed -= 1;
        self.write_counter = self.write_counter.max(entry.checkpoint);
        self.normalize();
        Some(entry)
    }

    fn normalize(&mut self) {
        if self.flushed == 0 {
            self.write_counter = 0;
            self.flush_offset = 0;
            return;
        }
        if self.write_counter < NORMALIZE_THRESHOLD {
            return;
        }
        let base = self.entries[0].start.min(self.write_counter);
        self.write_counter -= base;
        self.flush_offset -= base;
        for entry in self.entries.iter_mut().take(self.flushed) {
            entry.start -= base;
            entry.checkpoint -= base;
        }
    }
}

/// 单个通道的出站写缓冲。
pub struct OutboundBuffer {
    config: Arc<ChannelConfig>,
    listener: Arc<dyn WritabilityListener>,
    ledger: Mutex<Ledger>,
    total_pending: AtomicUsize,
    unwritable: AtomicU32,
    in_fail: AtomicBool,
}

impl OutboundBuffer {
    pub fn new(config: Arc<ChannelConfig>, listener: Arc<dyn WritabilityListener>) -> Self {
        Self {
            config,
            listener,
            ledger: Mutex::new(Ledger::default()),
            total_pending: AtomicUsize::new(0),
            unwritable: AtomicU32::new(0),
            in_fail: AtomicBool::new(false),
        }
    }

    /// 记入一条消息（尚未刷新）。
    pub fn add_message(&self, msg: PipelineMessage, size: usize, promise: ChannelPromise) {
        self.ledger.lock().entries.push_back(Entry {
            msg,
            pending_size: size,
            promise,
            start: 0,
            checkpoint: 0,
            progress: 0,
            cancelled: false,
        });
        self.increment_pending(size, false);
    }

    /// 把所有未刷新条目标记为已刷新并计算其检查点。
    ///
    /// 刷新时条目的 Promise 被锁定为不可取消；此前已被取消的条目在这里完成记账，
    /// 其消息替换为空缓冲，仍按顺序留在队列中等待传输出队。
    pub fn add_flush(&self) {
        let mut cancelled_bytes = 0;
        {
            let mut guard = self.ledger.lock();
            let ledger = &mut *guard;
            if ledger.flushed == ledger.entries.len() {
                return;
            }
            for entry in ledger.entries.iter_mut().skip(ledger.flushed) {
                if !entry.promise.set_uncancellable() {
                    cancelled_bytes += entry.cancel();
                }
                entry.start = ledger.flush_offset;
                ledger.flush_offset += entry.wire_len();
                entry.checkpoint = ledger.flush_offset;
            }
            ledger.flushed = ledger.entries.len();
        }
        self.decrement_pending(cancelled_bytes, false, true);
    }

    /// 以队首已刷新消息调用 `f`。`f` 内不得再访问本缓冲。
    pub fn with_current<R>(&self, f: impl FnOnce(&PipelineMessage) -> R) -> Option<R> {
        let ledger = self.ledger.lock();
        if ledger.flushed == 0 {
            return None;
        }
        ledger.entries.front().map(|entry| f(&entry.msg))
    }

    /// 队首已刷新消息的剩余字节（若为字节消息）。
    pub fn current_bytes(&self) -> Option<Bytes> {
        self.with_current(|msg| msg.as_bytes().cloned()).flatten()
    }

    /// 出队队首已刷新条目并标记成功。
    pub fn remove(&self) -> bool {
        let entry = self.ledger.lock().pop_flushed();
        match entry {
            Some(entry) => {
                drop(self.finish_success(entry));
                true
            }
            None => false,
        }
    }

    /// 出队队首已刷新条目、标记成功，并把消息所有权交给调用方。
    pub fn remove_and_take(&self) -> Option<PipelineMessage> {
        let entry = self.ledger.lock().pop_flushed()?;
        Some(self.finish_success(entry))
    }

    /// 出队队首已刷新条目并以 `cause` 标记失败。
    pub fn remove_failure(&self, cause: CoreError) -> bool {
        let entry = self.ledger.lock().pop_flushed();
        match entry {
            Some(entry) => {
                self.finish_failure(entry, cause, true);
                true
            }
            None => false,
        }
    }

    /// 登记传输实际写出的字节数。
    ///
    /// 检查点不超过累计写入计数的字节条目依次完成；剩余的队首字节条目按已写部分前移。
    /// 遇到业务对象条目即停止，此类条目须由传输显式调用 [`remove`](Self::remove)。
    pub fn remove_bytes(&self, written: u64) {
        let mut completed = Vec::new();
        {
            let mut guard = self.ledger.lock();
            let ledger = &mut *guard;
            ledger.write_counter += written;
            while ledger.flushed > 0 {
                let Some(front) = ledger.entries.front() else {
                    break;
                };
                if front.msg.readable_bytes().is_none() || front.checkpoint > ledger.write_counter
                {
                    break;
                }
                if let Some(entry) = ledger.entries.pop_front() {
                    ledger.flushed -= 1;
                    completed.push(entry);
                }
            }
            if ledger.flushed > 0
                && let Some(front) = ledger.entries.front_mut()
                && let PipelineMessage::Buffer(bytes) = &mut front.msg
            {
                let consumed = ledger.write_counter.saturating_sub(front.start);
                if consumed > front.progress {
                    let delta = (consumed - front.progress) as usize;
                    bytes.advance(delta.min(bytes.len()));
                    front.progress = consumed;
                }
            }
            ledger.normalize();
        }
        for entry in completed {
            drop(self.finish_success(entry));
        }
    }

    /// 已刷新字节消息的 gather 视图，最多 `max_count` 段、约 `max_bytes` 字节（至少一段）。
    pub fn flushed_buffers(&self, max_count: usize, max_bytes: usize) -> Vec<Bytes> {
        let ledger = self.ledger.lock();
        let mut out = Vec::new();
        let mut total = 0_usize;
        for entry in ledger.entries.iter().take(ledger.flushed) {
            let Some(bytes) = entry.msg.as_bytes() else {
                break;
            };
            if bytes.is_empty() {
                continue;
            }
            if out.len() == max_count || (!out.is_empty() && total + bytes.len() > max_bytes) {
                break;
            }
            total += bytes.len();
            out.push(bytes.clone());
        }
        out
    }

    /// 依次访问已刷新消息，`f` 返回 `false` 时停止。`f` 内不得再访问本缓冲。
    pub fn for_each_flushed(&self, mut f: impl FnMut(&PipelineMessage) -> bool) {
        let ledger = self.ledger.lock();
        for entry in ledger.entries.iter().take(ledger.flushed) {
            if !f(&entry.msg) {
                break;
            }
        }
    }

    /// 以 `cause` 失败所有已刷新条目。
    ///
    /// `notify` 为 `false` 时不触发可写性事件；失败过程中的重入调用直接返回。
    pub fn fail_flushed(&self, cause: CoreError, notify: bool) {
        if self.in_fail.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let entry = self.ledger.lock().pop_flushed();
            match entry {
                Some(entry) => self.finish_failure(entry, cause.clone(), notify),
                None => break,
            }
        }
        self.in_fail.store(false, Ordering::Release);
        let deferred = self.ledger.lock().deferred_close.take();
        if let Some(close_cause) = deferred {
            self.close(close_cause);
        }
    }

    /// 以 `cause` 失败剩余的全部条目（含未刷新部分），不触发可写性事件。
    ///
    /// 若在 [`fail_flushed`](Self::fail_flushed) 的回调中调用，会推迟到失败流程结束后执行。
    pub fn close(&self, cause: CoreError) {
        if self.in_fail.load(Ordering::Acquire) {
            self.ledger.lock().deferred_close = Some(cause);
            return;
        }
        self.in_fail.store(true, Ordering::Release);
        let entries = {
            let mut ledger = self.ledger.lock();
            ledger.flushed = 0;
            ledger.write_counter = 0;
            ledger.flush_offset = 0;
            std::mem::take(&mut ledger.entries)
        };
        if !entries.is_empty() {
            tracing::debug!(
                target: TARGET_OUTBOUND,
                entries = entries.len(),
                code = cause.code(),
                "出站缓冲关闭，剩余条目全部失败"
            );
        }
        for entry in entries {
            if !entry.cancelled {
                entry.promise.safe_failure(cause.clone());
            }
            self.total_pending
                .fetch_sub(entry.pending_size, Ordering::AcqRel);
        }
        self.in_fail.store(false, Ordering::Release);
    }

    /// 已刷新但未完成的条目数。
    pub fn size(&self) -> usize {
        self.ledger.lock().flushed
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 尚未刷新的条目数。
    pub fn unflushed_len(&self) -> usize {
        let ledger = self.ledger.lock();
        ledger.entries.len() - ledger.flushed
    }

    pub fn total_pending_write_bytes(&self) -> usize {
        self.total_pending.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.unwritable.load(Ordering::Acquire) == 0
    }

    /// 距离变为不可写还能写入的字节数；当前不可写时为 0。
    pub fn bytes_before_unwritable(&self) -> usize {
        let high = self.config.write_buffer_water_mark().high();
        match high.checked_sub(self.total_pending_write_bytes()) {
            Some(room) if self.is_writable() => room + 1,
            _ => 0,
        }
    }

    /// 需要再排空多少字节才能恢复可写；当前可写时为 0。
    pub fn bytes_before_writable(&self) -> usize {
        let low = self.config.write_buffer_water_mark().low();
        if self.is_writable() {
            return 0;
        }
        self.total_pending_write_bytes().saturating_sub(low)
    }

    /// 自定义可写性位（`1..=31`）是否处于可写状态。
    pub fn user_defined_writability(&self, index: u32) -> Result<bool> {
        let mask = writability_mask(index)?;
        Ok(self.unwritable.load(Ordering::Acquire) & mask == 0)
    }

    /// 设置自定义可写性位；整体可写性翻转时延后触发事件。
    pub fn set_user_defined_writability(&self, index: u32, writable: bool) -> Result<()> {
        let mask = writability_mask(index)?;
        if writable {
            self.clear_unwritable_bits(mask, true);
        } else {
            self.set_unwritable_bits(mask, true);
        }
        Ok(())
    }

    fn finish_success(&self, entry: Entry) -> PipelineMessage {
        if !entry.cancelled {
            entry.promise.safe_success();
        }
        self.decrement_pending(entry.pending_size, false, true);
        entry.msg
    }

    fn finish_failure(&self, entry: Entry, cause: CoreError, notify: bool) {
        if !entry.cancelled {
            entry.promise.safe_failure(cause);
        }
        self.decrement_pending(entry.pending_size, false, notify);
    }

    fn increment_pending(&self, size: usize, invoke_later: bool) {
        if size == 0 {
            return;
        }
        let total = self.total_pending.fetch_add(size, Ordering::AcqRel) + size;
        if total > self.config.write_buffer_water_mark().high() {
            self.set_unwritable_bits(WATER_MARK_BIT, invoke_later);
        }
    }

    fn decrement_pending(&self, size: usize, invoke_later: bool, notify: bool) {
        if size == 0 {
            return;
        }
        let previous = self.total_pending.fetch_sub(size, Ordering::AcqRel);
        debug_assert!(previous >= size, "待写字节数不能为负");
        let total = previous - size;
        if notify && total <= self.config.write_buffer_water_mark().low() {
            self.clear_unwritable_bits(WATER_MARK_BIT, invoke_later);
        }
    }

    fn set_unwritable_bits(&self, mask: u32, invoke_later: bool) {
        let previous = self.unwritable.fetch_or(mask, Ordering::AcqRel);
        if previous == 0 {
            self.listener.writability_changed(invoke_later);
        }
    }

    fn clear_unwritable_bits(&self, mask: u32, invoke_later: bool) {
        let previous = self.unwritable.fetch_and(!mask, Ordering::AcqRel);
        if previous != 0 && previous & !mask == 0 {
            self.listener.writability_changed(invoke_later);
        }
    }
}

fn writability_mask(index: u32) -> Result<u32> {
    if !(1..=31).contains(&index) {
        return Err(CoreError::new(
            codes::CONFIG_INVALID,
            format!("自定义可写性位索引 {index} 超出 1..=31"),
        ));
    }
    Ok(1 << index)
}

impl fmt::Debug for OutboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger.lock();
        f.debug_struct("OutboundBuffer")
            .field("flushed", &ledger.flushed)
            .field("entries", &ledger.entries.len())
            .field("pending_bytes", &self.total_pending_write_bytes())
            .field("writable", &self.is_writable())
            .finish()
    }
}
