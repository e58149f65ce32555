#![deny(unsafe_code)]

//! # pvlink-client
//!
//! ## 定位与职责（Why）
//! - 过程变量客户端引擎：按名称搜索服务器，把通道多路复用到每个服务器一条的 TCP Circuit 上，
//!   在连接丢失后自动重新搜索、重连并重放订阅；
//! - 以 [`KillTimer`] 处理“对端静默但套接字未关闭”的故障，以 [`SyncBridge`] 为非异步调用方
//!   提供带超时的阻塞式 get/put。
//!
//! ## 架构嵌入（Where）
//! - `context` 拥有全部注册表并驱动状态机，自身不做 I/O；
//! - `io` 定义引擎与 I/O 层之间的接缝，`driver` 提供基于 Tokio 的实现；
//! - 时间一律来自 `pvlink_core::TimerQueue` 的可注入时钟，测试可以确定性地推进。
//!
//! ## 并发约定（How）
//! - 全局注册表锁先于逐 Circuit 锁获取；所有应用回调都在锁外执行。

mod beacon;

/// 阻塞式与 `async` 的请求桥。
pub mod bridge;

/// 通道状态与一次性请求。
pub mod channel;

/// Circuit 生命周期状态机。
pub mod circuit;

/// 客户端上下文：注册表、搜索与事件分派。
pub mod context;

/// Tokio 驱动。
pub mod driver;

mod effects;

/// 类型化句柄。
pub mod ids;

/// 引擎与 I/O 层的接缝。
pub mod io;

/// 静默对端的强制驱逐。
pub mod kill_timer;

/// 应用回调接口。
pub mod listener;

mod stats;

/// 订阅登记与重放。
pub mod subscription;

pub use bridge::SyncBridge;
pub use channel::{ChannelInfo, ChannelState};
pub use circuit::{CircuitInfo, CircuitState};
pub use context::{ClientContext, WeakContext};
pub use ids::{ChannelId, CircuitId, RequestId, SubscriptionId};
pub use io::{CircuitLink, Connector, SearchRequest, SearchTransport};
pub use kill_timer::{CircuitEvictor, KillTimer};
pub use listener::{ChannelListener, GetCallback, MonitorListener, NoopListener, PutCallback};
pub use stats::ContextStats;
pub use subscription::SubscriptionSpec;

pub use pvlink_core::{CaError, ClientConfig, ErrorCategory, Result};
