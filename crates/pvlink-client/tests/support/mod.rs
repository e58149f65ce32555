//! 集成测试共用的确定性环境。
//!
//! # 教案式说明
//! - **Why**：Circuit 状态机只通过 [`Connector`] 与 [`SearchTransport`] 接触外部世界，
//!   注入记录型实现后，测试可以扮演服务器：检查发出的报文、回送应答、模拟断线。
//! - **How**：时间来自 [`MockClock`]，`advance` 推进时钟后反复处理到期定时器，直到没有
//!   到期条目为止。
//! - **What**：所有辅助函数都只通过公开接口驱动上下文。

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pvlink_client::{
    ChannelId, CircuitId, CircuitLink, ClientConfig, ClientContext, Connector, SearchRequest,
    SearchTransport,
};
use pvlink_core::wire::{DbrType, Message};
use pvlink_core::{MockClock, TimerQueue};

#[derive(Default)]
pub struct RecordingConnector {
    pub links: Mutex<Vec<CircuitLink>>,
    pub wakes: Mutex<Vec<CircuitId>>,
    pub closes: Mutex<Vec<(CircuitId, u64)>>,
}

impl Connector for RecordingConnector {
    fn open(&self, link: CircuitLink) {
        self.links.lock().push(link);
    }

    fn wake(&self, circuit: CircuitId) {
        self.wakes.lock().push(circuit);
    }

    fn close(&self, circuit: CircuitId, epoch: u64) {
        self.closes.lock().push((circuit, epoch));
    }
}

#[derive(Default)]
pub struct RecordingSearch {
    pub sent: Mutex<Vec<SearchRequest>>,
}

impl SearchTransport for RecordingSearch {
    fn send(&self, requests: &[SearchRequest]) {
        self.sent.lock().extend_from_slice(requests);
    }
}

pub fn server(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, 1], port))
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        auto_discovery: false,
        server_addresses: vec![server(5064)],
        connection_timeout: Duration::from_secs(2),
        search_initial_period: Duration::from_millis(100),
        search_retry_ceiling: Duration::from_secs(2),
        inactivity_timeout: Duration::from_secs(30),
        echo_period: Duration::from_secs(10),
        ..ClientConfig::default()
    }
}

pub struct Harness {
    pub clock: MockClock,
    pub timers: TimerQueue,
    pub connector: Arc<RecordingConnector>,
    pub search: Arc<RecordingSearch>,
    pub context: ClientContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        let clock = MockClock::new();
        let timers = TimerQueue::new(Arc::new(clock.clone()));
        let connector = Arc::new(RecordingConnector::default());
        let search = Arc::new(RecordingSearch::default());
        let context = ClientContext::new(config, timers.clone(), connector.clone(), search.clone())
            .expect("测试配置合法");
        Self {
            clock,
            timers,
            connector,
            search,
            context,
        }
    }

    /// 处理当前时刻所有到期的定时器（包括回调中零延迟重排的条目）。
    pub fn settle(&self) {
        for _ in 0..16 {
            let now = self.clock.now();
            match self.timers.next_deadline() {
                Some(deadline) if deadline <= now => {
                    self.timers.process(now);
                }
                _ => return,
            }
        }
    }

    pub fn advance(&self, delta: Duration) {
        self.clock.advance(delta);
        self.settle();
    }

    /// 按固定步长推进，使周期性定时器在每个到期点都被处理。
    pub fn advance_in_steps(&self, total: Duration, step: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.advance(step);
            elapsed += step;
        }
    }

    pub fn take_searches(&self) -> Vec<SearchRequest> {
        std::mem::take(&mut *self.search.sent.lock())
    }

    pub fn searches_for(&self, name: &str) -> usize {
        self.search
            .sent
            .lock()
            .iter()
            .filter(|request| &*request.name == name)
            .count()
    }

    /// 以服务器身份应答对 `channel` 的搜索。
    pub fn reply(&self, channel: ChannelId, addr: SocketAddr) {
        self.context.on_search_reply(channel.wire(), addr);
    }

    pub fn links(&self) -> Vec<CircuitLink> {
        self.connector.links.lock().clone()
    }

    /// 指向 `addr` 的最新连接凭据。
    pub fn link_for(&self, addr: SocketAddr) -> CircuitLink {
        self.connector
            .links
            .lock()
            .iter()
            .rev()
            .find(|link| link.addr() == addr)
            .cloned()
            .expect("该地址上应当已请求建连")
    }

    pub fn closes(&self) -> Vec<(CircuitId, u64)> {
        self.connector.closes.lock().clone()
    }

    /// 完成握手并回应全部通道创建请求，返回应答之后发出的报文（订阅重放与排队请求）。
    pub fn accept(&self, link: &CircuitLink, native_type: DbrType, element_count: u32) -> Vec<Message> {
        link.connected();
        let opening = link.take_outbound();
        for message in &opening {
            if let Message::CreateChannel { cid, .. } = message {
                link.message(Message::CreateChannelReply {
                    cid: *cid,
                    sid: cid.wrapping_add(1000),
                    native_type,
                    element_count,
                });
            }
        }
        link.take_outbound()
    }

    /// 创建通道、应答搜索并完成连接。
    pub fn connected_channel(&self, name: &str, addr: SocketAddr) -> (ChannelId, CircuitLink) {
        let channel = self
            .context
            .create_channel(name, Arc::new(pvlink_client::NoopListener))
            .expect("创建通道");
        self.settle();
        self.reply(channel, addr);
        let link = self.link_for(addr);
        self.accept(&link, DbrType::Double, 1);
        (channel, link)
    }
}

/// 只保留指定种类的报文。
pub fn event_adds(messages: &[Message]) -> Vec<u32> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::EventAdd { subid, .. } => Some(*subid),
            _ => None,
        })
        .collect()
}

pub fn event_cancels(messages: &[Message]) -> Vec<u32> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::EventCancel { subid, .. } => Some(*subid),
            _ => None,
        })
        .collect()
}
