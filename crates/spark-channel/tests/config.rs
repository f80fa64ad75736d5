//! 通道配置：选项读写、校验与即时生效。

mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spark_channel::buffer::{MessageSizeEstimator, PipelineMessage};
use spark_channel::codes;
use spark_channel::configuration::{ChannelConfig, WriteBufferWaterMark, options};
use spark_channel::transport::TransportCall;

use support::Harness;

#[test]
fn defaults_match_documented_values() {
    let config = ChannelConfig::default();
    assert!(config.is_auto_read());
    assert!(config.is_auto_close());
    assert_eq!(config.connect_timeout(), Duration::from_secs(30));
    assert_eq!(config.max_messages_per_write(), u32::MAX);
    assert_eq!(config.write_buffer_water_mark(), WriteBufferWaterMark::DEFAULT);
}

#[test]
fn typed_options_round_through_config() {
    let config = ChannelConfig::default();
    config
        .set_option(&options::CONNECT_TIMEOUT, Duration::from_millis(1500))
        .expect("超时可设置");
    config
        .set_option(&options::MAX_MESSAGES_PER_WRITE, 8)
        .expect("消息数可设置");
    config
        .set_option(&options::AUTO_CLOSE, false)
        .expect("自动关闭可设置");

    assert_eq!(config.connect_timeout(), Duration::from_millis(1500));
    assert_eq!(config.option(&options::MAX_MESSAGES_PER_WRITE), 8);
    assert!(!config.option(&options::AUTO_CLOSE));
    assert_eq!(options::WRITE_SPIN_COUNT.to_string(), "channel.write_spin_count");
}

#[test]
fn invalid_values_leave_config_unchanged() {
    let config = ChannelConfig::default();
    let spin = config.write_spin_count();

    let err = config
        .set_option(&options::WRITE_SPIN_COUNT, 0)
        .expect_err("零自旋次数非法");
    assert_eq!(err.code(), codes::CONFIG_INVALID);
    assert_eq!(config.write_spin_count(), spin);

    let err = config
        .set_max_messages_per_write(0)
        .expect_err("零消息数非法");
    assert_eq!(err.code(), codes::CONFIG_INVALID);
    assert_eq!(config.max_messages_per_write(), u32::MAX);
}

#[test]
fn water_mark_halves_are_validated_against_each_other() {
    let config = ChannelConfig::default();
    let err = WriteBufferWaterMark::new(10, 5).expect_err("高水位低于低水位");
    assert_eq!(err.code(), codes::CONFIG_INVALID);

    let err = config
        .set_write_buffer_low_water_mark(WriteBufferWaterMark::DEFAULT_HIGH + 1)
        .expect_err("低水位不能越过当前高水位");
    assert_eq!(err.code(), codes::CONFIG_INVALID);
    assert_eq!(config.write_buffer_water_mark(), WriteBufferWaterMark::DEFAULT);

    config
        .set_write_buffer_high_water_mark(128 * 1024)
        .expect("调高高水位");
    config
        .set_write_buffer_low_water_mark(96 * 1024)
        .expect("再调高低水位");
    assert_eq!(
        config.write_buffer_water_mark(),
        WriteBufferWaterMark::new(96 * 1024, 128 * 1024).expect("水位合法")
    );
}

/// 从外部配置源读取的水位线同样经过高低校验。
#[test]
fn deserialized_water_mark_is_validated() {
    let err = serde_json::from_str::<WriteBufferWaterMark>(r#"{"low":100,"high":10}"#)
        .expect_err("低水位高于高水位应被拒绝");
    assert!(
        err.to_string().contains(codes::CONFIG_INVALID),
        "错误应携带配置非法的错误码: {err}"
    );

    let parsed: WriteBufferWaterMark =
        serde_json::from_str(r#"{"low":10,"high":100}"#).expect("合法水位可以读取");
    assert_eq!(parsed, WriteBufferWaterMark::new(10, 100).expect("水位合法"));
    assert_eq!(
        serde_json::to_value(parsed).expect("水位可序列化"),
        json!({ "low": 10, "high": 100 })
    );
}

#[test]
fn snapshot_serializes_numeric_view() {
    let config = ChannelConfig::default();
    config.set_connect_timeout(Duration::from_secs(2));
    config.set_auto_read(false);
    config
        .set_write_buffer_water_mark(WriteBufferWaterMark::new(1, 2).expect("水位合法"));

    let value = serde_json::to_value(config.snapshot()).expect("快照可序列化");
    assert_eq!(
        value,
        json!({
            "connect_timeout_ms": 2000,
            "auto_read": false,
            "auto_close": true,
            "write_spin_count": config.write_spin_count(),
            "max_messages_per_write": u32::MAX,
            "write_buffer_low_water_mark": 1,
            "write_buffer_high_water_mark": 2,
        })
    );
}

struct FixedSize(usize);

impl MessageSizeEstimator for FixedSize {
    fn size(&self, _msg: &PipelineMessage) -> usize {
        self.0
    }
}

/// 更换估算器后，新写入的消息按新估算计入水位。
#[test]
fn size_estimator_drives_pending_accounting() {
    let harness = Harness::connected();
    let config = harness.channel.config();
    config
        .set_option(
            &options::MESSAGE_SIZE_ESTIMATOR,
            Arc::new(FixedSize(100)) as Arc<dyn MessageSizeEstimator>,
        )
        .expect("估算器可替换");
    config.set_write_buffer_water_mark(WriteBufferWaterMark::new(50, 150).expect("水位合法"));

    harness.channel.write("a");
    assert!(harness.channel.is_writable());
    assert_eq!(harness.channel.bytes_before_unwritable(), 51);
    harness.channel.write("b");
    assert!(!harness.channel.is_writable(), "估算 200 字节超过高水位");
}

#[test]
fn auto_read_option_is_live() {
    let harness = Harness::connected();
    let config = harness.channel.config();
    let reads = harness.transport.count(&TransportCall::BeginRead);

    config
        .set_option(&options::AUTO_READ, false)
        .expect("关闭自动读取");
    config
        .set_option(&options::AUTO_READ, false)
        .expect("重复设置无副作用");
    assert_eq!(harness.transport.count(&TransportCall::AutoReadCleared), 1);

    config
        .set_option(&options::AUTO_READ, true)
        .expect("恢复自动读取");
    assert_eq!(harness.transport.count(&TransportCall::BeginRead), reads + 1);
}
