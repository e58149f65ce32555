//! 建连抽象与 TCP 实现。
//!
//! # 教案式说明
//! - **Why**：重连循环只关心“拿到一条字节流”，测试需要用内存管道替代套接字来
//!   编排失败次数与写入故障；
//! - **How**：[`StreamConnector`] 以 `async_trait` 暴露对象安全的异步建连；TCP 实现在连上
//!   之后通过 `socket2::SockRef` 落地套接字选项；
//! - **What**：数据只朝目标写；读方向保持打开，循环靠它发现对端关闭或复位，不在失效的
//!   连接上继续写。

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::{CONFIGURE, map_io_error};

/// 可读可写的双向字节流。读方向只用于观察对端是否还在。
pub trait ByteStream: AsyncRead + AsyncWrite + Send {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send {}

/// 重连循环持有的连接。
pub type BoxedStream = Pin<Box<dyn ByteStream>>;

/// 建立到目标的字节流。
///
/// 失败返回的 `io::Error` 只用于日志与计数，循环总会按重试周期再次尝试。
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, target: SocketAddr) -> io::Result<BoxedStream>;
}

/// 基于 Tokio 的 TCP 建连。
#[derive(Clone, Debug)]
pub struct TcpStreamConnector {
    keepalive: bool,
    linger: Option<Duration>,
}

impl TcpStreamConnector {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            keepalive: config.keepalive,
            linger: Some(config.linger),
        }
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_keepalive(self.keepalive)?;
        // 关闭时尽量把缓冲中的尾部数据送达，超过 linger 才放弃。
        sock.set_linger(self.linger)
    }
}

#[async_trait]
impl StreamConnector for TcpStreamConnector {
    async fn connect(&self, target: SocketAddr) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(target).await?;
        if let Err(err) = self.configure(&stream) {
            // 选项失败不影响数据通路。
            let err = map_io_error(CONFIGURE, target, err);
            debug!(code = err.code(), error = %err, "stream socket options not applied");
        }
        Ok(Box::pin(stream))
    }
}
