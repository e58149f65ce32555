//! 流客户端的错误域。
//!
//! 与 `pvlink_core::CaError` 共用 [`ErrorCategory`]：连接被拒、复位等网络故障属于
//! `Transient`，由重连循环在本地恢复，只有配置错误、关闭后调用与“初次连接始终不可达”
//! 才会交给调用方。

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use pvlink_core::ErrorCategory;
use pvlink_core::error::OperationKind;
use thiserror::Error;

pub const CONNECT: OperationKind = OperationKind {
    code: "pvlink.stream.connect_failed",
    message: "stream connect",
};
pub const WRITE: OperationKind = OperationKind {
    code: "pvlink.stream.write_failed",
    message: "stream write",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "pvlink.stream.configure_failed",
    message: "socket configure",
};

#[derive(Debug, Error)]
pub enum StreamError {
    /// 底层套接字操作失败。
    #[error("{} {target}: {source}", kind.message)]
    Io {
        kind: OperationKind,
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 初次连接在允许的次数内始终未成功。
    #[error("{target} not reachable after {attempts} connection attempts")]
    NotReachable { target: SocketAddr, attempts: u32 },

    /// 等待超时。
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// 配置非法。
    #[error("invalid stream configuration: {detail}")]
    InvalidConfig { detail: Cow<'static, str> },

    /// 客户端已关闭。
    #[error("stream client has been shut down")]
    ShutDown,
}

impl StreamError {
    pub fn invalid_config(detail: impl Into<Cow<'static, str>>) -> Self {
        StreamError::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::Io { kind, .. } => kind.code,
            StreamError::NotReachable { .. } => "pvlink.stream.not_reachable",
            StreamError::Timeout { .. } => "pvlink.stream.timeout",
            StreamError::InvalidConfig { .. } => "pvlink.stream.invalid_config",
            StreamError::ShutDown => "pvlink.stream.shut_down",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Io { source, .. } => match source.kind() {
                io::ErrorKind::TimedOut => ErrorCategory::Timeout,
                io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
                    ErrorCategory::Misuse
                }
                _ => ErrorCategory::Transient,
            },
            StreamError::NotReachable { .. } => ErrorCategory::Transient,
            StreamError::Timeout { .. } => ErrorCategory::Timeout,
            StreamError::InvalidConfig { .. } => ErrorCategory::Misuse,
            StreamError::ShutDown => ErrorCategory::Cancelled,
        }
    }
}

/// 将 IO 错误映射为流错误。
pub fn map_io_error(kind: OperationKind, target: SocketAddr, source: io::Error) -> StreamError {
    StreamError::Io {
        kind,
        target,
        source,
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
