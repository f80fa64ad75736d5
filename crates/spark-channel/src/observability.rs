//! 日志目标常量。
//!
//! 所有诊断输出都通过 `tracing` 宏发出，并使用这里的稳定 `target`，
//! 方便订阅方按子系统过滤（例如 `RUST_LOG=spark.pipeline=debug`）。
//! 结构化字段统一使用 `channel`、`handler`、`code`、`error` 等键名。

/// 通道生命周期与 Unsafe 操作。
pub const TARGET_CHANNEL: &str = "spark.channel";
/// 管线变更与尾部兜底处理。
pub const TARGET_PIPELINE: &str = "spark.pipeline";
/// 出站缓冲与可写性。
pub const TARGET_OUTBOUND: &str = "spark.outbound";
/// 事件循环与任务调度。
pub const TARGET_RUNTIME: &str = "spark.runtime";
