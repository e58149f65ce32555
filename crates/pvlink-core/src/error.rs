//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为客户端引擎对外暴露的全部失败路径提供统一的错误域 [`CaError`]；
//! - 每个错误都附带稳定错误码（`code()`）与 [`ErrorCategory`]，调用方可据此区分
//!   “对端行为异常”与“调用方误用 API”，而无需解析错误消息。
//!
//! ## 分类约定（What）
//! - `Transient`：连接被拒绝、复位、超时等网络瞬态故障，由重连循环在本地恢复；
//! - `Protocol`：畸形或不合时宜的报文，所在 Circuit 按断线处理；
//! - `ResourceExhausted`：无法再分配 Circuit/Channel 记录；
//! - `Misuse`：对已销毁句柄操作、重复注销订阅、非法配置等编程错误；
//! - `Timeout` / `Cancelled`：同步桥超时、请求因通道销毁而取消；
//! - `Rejected`：服务器明确拒绝请求（例如写权限不足）。

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// 错误的处置类别。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorCategory {
    /// 网络瞬态故障，重连即可恢复。
    Transient,
    /// 报文畸形或状态不符，Circuit 将被拆除后重建。
    Protocol,
    /// 本地资源耗尽。
    ResourceExhausted,
    /// 调用方编程错误。
    Misuse,
    /// 等待超时。
    Timeout,
    /// 请求被取消。
    Cancelled,
    /// 服务器拒绝请求。
    Rejected,
}

impl ErrorCategory {
    /// 该类错误能否通过重连在本地恢复。
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorCategory::Transient | ErrorCategory::Protocol)
    }

    /// 稳定的小写标签，用于日志字段。
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::ResourceExhausted => "resource_exhausted",
            ErrorCategory::Misuse => "misuse",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Rejected => "rejected",
        }
    }
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const CONNECT: OperationKind = OperationKind {
    code: "pvlink.io.connect_failed",
    message: "tcp connect",
};
pub const READ: OperationKind = OperationKind {
    code: "pvlink.io.read_failed",
    message: "tcp read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "pvlink.io.write_failed",
    message: "tcp write",
};
pub const CONFIGURE: OperationKind = OperationKind {
    code: "pvlink.io.configure_failed",
    message: "socket configure",
};
pub const SEARCH: OperationKind = OperationKind {
    code: "pvlink.io.search_failed",
    message: "udp search",
};
pub const BIND: OperationKind = OperationKind {
    code: "pvlink.io.bind_failed",
    message: "udp bind",
};

/// 客户端引擎的统一错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把网络、协议、资源与误用四类失败收敛到一个可 `?` 传播的类型，
///   同时保留足够的上下文（对端地址、通道名、句柄）辅助排障；
/// - **契约 (What)**：所有变体均 `Send + Sync + 'static`；[`CaError::category`] 与
///   [`CaError::code`] 对同一变体恒定；
/// - **执行逻辑 (How)**：IO 错误经 [`map_io_error`] 按 [`OperationKind`] 分类，其余变体
///   由引擎在检测点直接构造。
#[derive(Debug, Error)]
pub enum CaError {
    /// 底层套接字操作失败。
    #[error("{}{}: {source}", kind.message, fmt_peer(*peer))]
    Io {
        kind: OperationKind,
        peer: Option<SocketAddr>,
        #[source]
        source: io::Error,
    },

    /// 对端发送了畸形或不合时宜的报文。
    #[error("protocol violation{}: {detail}", fmt_peer(*peer))]
    Protocol {
        peer: Option<SocketAddr>,
        detail: Cow<'static, str>,
    },

    /// 帧解码失败。
    #[error("malformed frame: {detail}")]
    MalformedFrame { detail: Cow<'static, str> },

    /// 注册表容量耗尽。
    #[error("no memory: {resource} registry is full (limit {limit})")]
    ResourceExhausted { resource: &'static str, limit: usize },

    /// 句柄指向的通道已被销毁或从未存在。
    #[error("channel handle {handle} is stale or destroyed")]
    StaleChannel { handle: String },

    /// 订阅句柄未登记或已被注销。
    #[error("subscription handle {handle} is not registered")]
    UnknownSubscription { handle: String },

    /// 通道当前未连接，无法执行需要连接的操作。
    #[error("channel `{name}` is not connected")]
    NotConnected { name: String },

    /// 请求超时。
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// 请求被取消。
    #[error("request cancelled: {reason}")]
    Cancelled { reason: &'static str },

    /// 服务器拒绝了请求。
    #[error("server rejected request on `{name}` with status {status}")]
    Rejected { name: String, status: u32 },

    /// 请求的数组超出配置上限。
    #[error("array of {bytes} bytes exceeds the {limit}-byte limit")]
    ArrayTooLarge { bytes: usize, limit: usize },

    /// 配置非法。
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: Cow<'static, str> },

    /// 上下文已关闭。
    #[error("client context has been shut down")]
    ShutDown,
}

fn fmt_peer(peer: Option<SocketAddr>) -> String {
    match peer {
        Some(addr) => format!(" ({addr})"),
        None => String::new(),
    }
}

impl CaError {
    /// 构造协议错误。
    pub fn protocol(peer: Option<SocketAddr>, detail: impl Into<Cow<'static, str>>) -> Self {
        CaError::Protocol {
            peer,
            detail: detail.into(),
        }
    }

    /// 构造帧解码错误。
    pub fn malformed(detail: impl Into<Cow<'static, str>>) -> Self {
        CaError::MalformedFrame {
            detail: detail.into(),
        }
    }

    /// 构造配置错误。
    pub fn invalid_config(detail: impl Into<Cow<'static, str>>) -> Self {
        CaError::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// 稳定错误码，遵循 `pvlink.<域>.<语义>` 约定。
    pub fn code(&self) -> &'static str {
        match self {
            CaError::Io { kind, .. } => kind.code,
            CaError::Protocol { .. } => "pvlink.circuit.protocol",
            CaError::MalformedFrame { .. } => "pvlink.wire.malformed",
            CaError::ResourceExhausted { .. } => "pvlink.registry.no_memory",
            CaError::StaleChannel { .. } => "pvlink.channel.stale_handle",
            CaError::UnknownSubscription { .. } => "pvlink.subscription.unknown",
            CaError::NotConnected { .. } => "pvlink.channel.not_connected",
            CaError::Timeout { .. } => "pvlink.request.timeout",
            CaError::Cancelled { .. } => "pvlink.request.cancelled",
            CaError::Rejected { .. } => "pvlink.request.rejected",
            CaError::ArrayTooLarge { .. } => "pvlink.request.array_too_large",
            CaError::InvalidConfig { .. } => "pvlink.config.invalid",
            CaError::ShutDown => "pvlink.context.shut_down",
        }
    }

    /// 错误的处置类别。
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaError::Io { source, .. } => categorize_io_error(source),
            CaError::Protocol { .. } | CaError::MalformedFrame { .. } => ErrorCategory::Protocol,
            CaError::ResourceExhausted { .. } => ErrorCategory::ResourceExhausted,
            CaError::StaleChannel { .. }
            | CaError::UnknownSubscription { .. }
            | CaError::ArrayTooLarge { .. }
            | CaError::InvalidConfig { .. } => ErrorCategory::Misuse,
            CaError::NotConnected { .. } => ErrorCategory::Transient,
            CaError::Timeout { .. } => ErrorCategory::Timeout,
            CaError::Cancelled { .. } | CaError::ShutDown => ErrorCategory::Cancelled,
            CaError::Rejected { .. } => ErrorCategory::Rejected,
        }
    }

    /// 是否属于调用方误用。
    pub fn is_misuse(&self) -> bool {
        self.category() == ErrorCategory::Misuse
    }
}

/// 将 IO 错误映射为引擎错误。
pub fn map_io_error(kind: OperationKind, peer: Option<SocketAddr>, source: io::Error) -> CaError {
    CaError::Io { kind, peer, source }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported | ErrorKind::InvalidInput => {
            ErrorCategory::Misuse
        }
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => ErrorCategory::Protocol,
        _ => ErrorCategory::Transient,
    }
}

pub type Result<T, E = CaError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_categorized_by_kind() {
        let refused = map_io_error(
            CONNECT,
            None,
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(refused.category(), ErrorCategory::Transient);
        assert!(refused.category().is_recoverable());
        assert_eq!(refused.code(), "pvlink.io.connect_failed");

        let denied = map_io_error(WRITE, None, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(denied.is_misuse());
    }

    #[test]
    fn misuse_is_distinct_from_peer_failures() {
        let stale = CaError::StaleChannel {
            handle: "3v1".into(),
        };
        let protocol = CaError::protocol(None, "unexpected reply");
        assert!(stale.is_misuse());
        assert!(!protocol.is_misuse());
        assert!(protocol.category().is_recoverable());
        assert!(!stale.category().is_recoverable());
    }
}
