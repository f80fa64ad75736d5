//! 通道：生命周期状态机、标识与工厂。

#[allow(clippy::module_inception)]
mod channel;
mod factory;
mod id;
mod unsafe_ops;

pub use channel::Channel;
pub use factory::{ChannelFactory, TransportChannelFactory};
pub use id::ChannelId;
pub use unsafe_ops::Unsafe;
