//! 面向上层（记录/数据库层）的回调接口。
//!
//! # 教案式说明
//! - **意图 (Why)**：连接丢失与正常断开走同一个 `on_connection_change` 回调，上层的故障处理
//!   路径因此保持统一；值更新与请求完成分别经由订阅监听器与一次性完成闭包投递。
//! - **契约 (What)**：
//!   - 所有回调都在引擎释放内部锁之后调用，回调内可以重入引擎（销毁通道、再发请求）；
//!   - 回调运行在 I/O 任务或定时器任务上，必须快速返回，不得阻塞。

use pvlink_core::Result;
use pvlink_core::wire::Reading;

use crate::ids::{ChannelId, RequestId, SubscriptionId};

/// 通道连接状态变化监听器。
pub trait ChannelListener: Send + Sync + 'static {
    fn on_connection_change(&self, channel: ChannelId, connected: bool);
}

impl<F> ChannelListener for F
where
    F: Fn(ChannelId, bool) + Send + Sync + 'static,
{
    fn on_connection_change(&self, channel: ChannelId, connected: bool) {
        self(channel, connected)
    }
}

/// 订阅值更新监听器。
pub trait MonitorListener: Send + Sync + 'static {
    fn on_data(&self, subscription: SubscriptionId, reading: &Reading);
}

impl<F> MonitorListener for F
where
    F: Fn(SubscriptionId, &Reading) + Send + Sync + 'static,
{
    fn on_data(&self, subscription: SubscriptionId, reading: &Reading) {
        self(subscription, reading)
    }
}

/// 忽略所有事件的监听器。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl ChannelListener for NoopListener {
    fn on_connection_change(&self, _channel: ChannelId, _connected: bool) {}
}

impl MonitorListener for NoopListener {
    fn on_data(&self, _subscription: SubscriptionId, _reading: &Reading) {}
}

/// get 完成回调：成功携带读数，失败携带取消、拒绝或断线原因。
pub type GetCallback = Box<dyn FnOnce(RequestId, Result<Reading>) + Send + 'static>;

/// put 完成回调。
pub type PutCallback = Box<dyn FnOnce(RequestId, Result<()>) + Send + 'static>;
