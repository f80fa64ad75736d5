use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// 进程内唯一的通道标识。
///
/// 由进程号、单调序号与创建时间戳组成；短文本只取序号，适合日志，
/// 长文本包含全部字段，适合跨进程关联。排序按字段顺序进行。
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    process: u32,
    sequence: u32,
    timestamp: u64,
}

impl ChannelId {
    pub fn new_instance() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            process: std::process::id(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            timestamp,
        }
    }

    pub fn as_short_text(&self) -> String {
        format!("{:08x}", self.sequence)
    }

    pub fn as_long_text(&self) -> String {
        format!(
            "{:08x}-{:08x}-{:016x}",
            self.process, self.sequence, self.timestamp
        )
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_short_text())
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.as_long_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_ordered() {
        let first = ChannelId::new_instance();
        let second = ChannelId::new_instance();
        assert_ne!(first, second);
        assert!(first < second, "同进程内后创建的标识排序靠后");
        assert_eq!(first.as_short_text().len(), 8);
        assert!(second.as_long_text().contains(&second.as_short_text()));
    }
}
