//! Tokio 驱动：把引擎接到真实网络与系统时钟上。
//!
//! [`spawn`] 组装一套可运行的客户端：系统时钟驱动的定时器队列任务、TCP 连接执行者、
//! UDP 搜索端及其应答接收任务。引擎本身对这些实现一无所知，测试可以用记录型实现替换。

mod tcp;
mod udp;

use std::sync::Arc;

use pvlink_core::{ClientConfig, Result, SystemClock, TimerQueue};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::info;

use crate::context::ClientContext;

pub use tcp::TcpConnector;
pub use udp::{MAX_DATAGRAM, UdpSearchTransport};

/// 正在运行的客户端。释放前应调用 [`RunningClient::shutdown`]。
#[derive(Debug)]
pub struct RunningClient {
    context: ClientContext,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningClient {
    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    /// 关闭上下文并停止后台任务。
    pub fn shutdown(self) {
        self.context.shutdown();
        for task in &self.tasks {
            task.abort();
        }
        info!("client stopped");
    }
}

/// 在当前 Tokio 运行时上启动客户端。
pub async fn spawn(config: ClientConfig) -> Result<RunningClient> {
    config.validate()?;
    let runtime = Handle::current();
    let timers = TimerQueue::new(Arc::new(SystemClock));
    let connector = Arc::new(TcpConnector::new(&config, runtime.clone()));
    let search = Arc::new(UdpSearchTransport::bind(&config).await?);
    let context = ClientContext::new(config, timers.clone(), connector, search.clone())?;

    let timer_task = runtime.spawn(async move { timers.run().await });
    let receiver = search.spawn_receiver(&runtime, context.downgrade());
    info!(
        local = ?search.local_addr().ok(),
        destinations = ?search.destinations(),
        "client started"
    );
    Ok(RunningClient {
        context,
        tasks: vec![timer_task, receiver],
    })
}
