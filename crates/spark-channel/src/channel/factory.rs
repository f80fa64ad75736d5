use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{CoreError, Result};
use crate::transport::Transport;

use super::Channel;

/// 按需创建通道，供引导器或服务端接受循环使用。
pub trait ChannelFactory: Send + Sync + 'static {
    fn new_channel(&self) -> Result<Arc<Channel>>;
}

/// 用一个传输构造函数生成通道的工厂。
///
/// 构造函数失败时，I/O 错误被包装为 `transport.io` 返回，不会产生半初始化的通道。
pub struct TransportChannelFactory<F, T> {
    make: F,
    _transport: PhantomData<fn() -> T>,
}

impl<F, T> TransportChannelFactory<F, T>
where
    F: Fn() -> io::Result<T> + Send + Sync + 'static,
    T: Transport,
{
    pub fn new(make: F) -> Self {
        Self {
            make,
            _transport: PhantomData,
        }
    }
}

impl<F, T> ChannelFactory for TransportChannelFactory<F, T>
where
    F: Fn() -> io::Result<T> + Send + Sync + 'static,
    T: Transport,
{
    fn new_channel(&self) -> Result<Arc<Channel>> {
        let transport =
            (self.make)().map_err(|err| CoreError::from_io("创建通道传输失败", err))?;
        Ok(Channel::new(transport))
    }
}
