//! # 同步桥
//!
//! ## 核心意图（Why）
//! - 为不在异步运行时内的调用方（脚本、命令行工具、测试）提供阻塞式 get/put，
//!   并为 Tokio 任务提供等价的 `async` 版本。
//!
//! ## 契约（What）
//! - 调用线程阻塞至完成或超时，超时返回 `Timeout`；
//! - 超时后请求被放弃：迟到的应答按关联标识识别并丢弃，不会投递给任何后续等待者，也不会
//!   写入已返回调用方的栈上数据；
//! - 桥本身不持有锁，完成回调只向一次性槽位写入结果。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pvlink_core::wire::{DbrType, Reading, Value};
use pvlink_core::{CaError, Result};
use tokio::sync::oneshot;
use tracing::debug;

use crate::context::ClientContext;
use crate::ids::{ChannelId, RequestId};

/// 一次性完成槽位：首次写入生效，等待方按截止时间阻塞。
struct Completion<T> {
    shared: Arc<(Mutex<Option<T>>, Condvar)>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Completion<T> {
    fn new() -> Self {
        Self {
            shared: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn complete(&self, value: T) {
        let (slot, ready) = &*self.shared;
        let mut slot = slot.lock();
        if slot.is_none() {
            *slot = Some(value);
            ready.notify_all();
        }
    }

    fn wait_for(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let (slot, ready) = &*self.shared;
        let mut slot = slot.lock();
        while slot.is_none() {
            if ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.take()
    }
}

/// 在 [`ClientContext`] 之上的阻塞式请求接口。
#[derive(Clone, Debug)]
pub struct SyncBridge {
    context: ClientContext,
}

impl SyncBridge {
    pub fn new(context: ClientContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    /// 创建通道并等待其首次连接；超时后通道被销毁。
    pub fn connect(&self, name: &str, timeout: Duration) -> Result<ChannelId> {
        let slot = Completion::new();
        let signal = slot.clone();
        let channel = self.context.create_channel(
            name,
            Arc::new(move |_: ChannelId, connected: bool| {
                if connected {
                    signal.complete(());
                }
            }),
        )?;
        if slot.wait_for(timeout).is_some() {
            return Ok(channel);
        }
        let _ = self.context.destroy_channel(channel);
        Err(CaError::Timeout {
            operation: "connect",
            after: timeout,
        })
    }

    /// 阻塞式读取。`count` 为 0 表示原生元素数。
    pub fn get(
        &self,
        channel: ChannelId,
        data_type: DbrType,
        count: u32,
        timeout: Duration,
    ) -> Result<Reading> {
        let slot = Completion::new();
        let sink = slot.clone();
        let request = self.context.get(
            channel,
            data_type,
            count,
            Box::new(move |_: RequestId, result: Result<Reading>| sink.complete(result)),
        )?;
        self.wait(&slot, request, "get", timeout)
    }

    /// 阻塞式写入，等待服务器确认。
    pub fn put(&self, channel: ChannelId, value: Value, timeout: Duration) -> Result<()> {
        let slot = Completion::new();
        let sink = slot.clone();
        let request = self.context.put_callback(
            channel,
            value,
            Box::new(move |_: RequestId, result: Result<()>| sink.complete(result)),
        )?;
        self.wait(&slot, request, "put", timeout)
    }

    fn wait<T>(
        &self,
        slot: &Completion<Result<T>>,
        request: RequestId,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<T> {
        if let Some(result) = slot.wait_for(timeout) {
            return result;
        }
        if !self.context.abandon(request) {
            // 完成与超时同时发生：结果已在投递途中。
            if let Some(result) = slot.wait_for(Duration::ZERO) {
                return result;
            }
        }
        debug!(request = %request, operation, timeout = ?timeout, "request timed out");
        Err(CaError::Timeout {
            operation,
            after: timeout,
        })
    }

    /// [`SyncBridge::get`] 的异步版本，不阻塞运行时线程。
    pub async fn get_async(
        &self,
        channel: ChannelId,
        data_type: DbrType,
        count: u32,
        timeout: Duration,
    ) -> Result<Reading> {
        let (tx, rx) = oneshot::channel();
        let request = self.context.get(
            channel,
            data_type,
            count,
            Box::new(move |_: RequestId, result: Result<Reading>| {
                let _ = tx.send(result);
            }),
        )?;
        self.await_reply(rx, request, "get", timeout).await
    }

    /// [`SyncBridge::put`] 的异步版本。
    pub async fn put_async(&self, channel: ChannelId, value: Value, timeout: Duration) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let request = self.context.put_callback(
            channel,
            value,
            Box::new(move |_: RequestId, result: Result<()>| {
                let _ = tx.send(result);
            }),
        )?;
        self.await_reply(rx, request, "put", timeout).await
    }

    async fn await_reply<T>(
        &self,
        reply: oneshot::Receiver<Result<T>>,
        request: RequestId,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CaError::Cancelled {
                reason: "request dropped",
            }),
            Err(_) => {
                self.context.abandon(request);
                debug!(request = %request, operation, timeout = ?timeout, "request timed out");
                Err(CaError::Timeout {
                    operation,
                    after: timeout,
                })
            }
        }
    }
}
