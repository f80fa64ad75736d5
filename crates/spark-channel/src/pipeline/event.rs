use std::any::Any;
use std::fmt;

/// 经 `user_event_triggered` 传播的带外事件。
pub enum UserEvent {
    /// 通道输出方向已关闭（半关闭），此后写入会失败，读取仍可继续。
    OutputShutdown,
    /// 应用自定义事件。
    Application(Box<dyn Any + Send>),
}

impl UserEvent {
    pub fn application<T: Any + Send>(event: T) -> Self {
        Self::Application(Box::new(event))
    }

    pub fn is_output_shutdown(&self) -> bool {
        matches!(self, Self::OutputShutdown)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Application(event) => event.downcast_ref::<T>(),
            Self::OutputShutdown => None,
        }
    }
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutputShutdown => f.write_str("OutputShutdown"),
            Self::Application(_) => f.write_str("Application(..)"),
        }
    }
}
