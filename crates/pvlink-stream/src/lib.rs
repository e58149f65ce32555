#![deny(unsafe_code)]
#![doc = "pvlink-stream: 带退避重连的单向字节流客户端。"]
#![doc = ""]
#![doc = "面向日志转发等“尽力送达”的消费方："]
#![doc = "- [`config`]：目标地址、重试周期、缓冲容量与套接字选项；"]
#![doc = "- [`connector`]：可替换的建连抽象与 TCP 实现；"]
#![doc = "- [`client`]：有界缓冲、后台重连与补发；"]
#![doc = "- [`error`]：与 `pvlink-core` 共用处置类别的错误域。"]

pub mod client;
pub mod config;
pub mod connector;
pub mod error;

pub use client::{StreamClient, StreamState, StreamStatus};
pub use config::StreamConfig;
pub use connector::{BoxedStream, ByteStream, StreamConnector, TcpStreamConnector};
pub use error::{Result, StreamError};
