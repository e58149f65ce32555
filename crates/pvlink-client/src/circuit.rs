//! # Circuit 状态机
//!
//! ## 核心意图（Why）
//! - 一个 Circuit 对应一条到某个服务器的 TCP 连接，复用承载多个 Channel；
//! - 把“搜索 → 连接 → 已连接 → 断开 →（重新搜索 | 销毁）”的生命周期收敛到可校验的状态图，
//!   让断线恢复、超时驱逐与重连重放都有唯一的落点。
//!
//! ## 状态机约束（What）
//! - 合法跃迁：`Searching → Connecting → Connected → Disconnected → (Searching | Destroyed)`，
//!   另有 `Connecting → Disconnected`（握手失败或超时）与 `Searching → Destroyed`
//!   （等待重连期间最后一个通道被销毁）；
//! - 每次进入 `Connecting` 都会递增 `epoch`。I/O 路径上报的事件都带 epoch，过期 epoch 的
//!   事件一律丢弃，因此断开与新连接成功竞争时断开总是获胜；
//! - `attached` 只包含 `circuit` 反向引用指向本 Circuit 的通道；`wanted` 是断线后等待
//!   本 Circuit 重新找到服务器的通道。
//!
//! ## 并发（How）
//! - `Circuit` 位于 [`CircuitCell`] 的逐 Circuit 锁内；获取顺序恒为“全局注册表锁 → Circuit 锁”，
//!   I/O 驱动只取 Circuit 锁来读取发送队列。

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pvlink_core::wire::Message;
use pvlink_core::{Arena, CaError, Handle, Result, SearchBackoff, Timer};
use tracing::warn;

use crate::ids::{ChannelId, RequestId, SubscriptionId};
use crate::kill_timer::KillTimer;

/// Circuit 生命周期状态。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CircuitState {
    /// 尚无套接字；周期性为等待中的通道发送名称查询。
    Searching,
    /// 套接字已打开，握手进行中。
    Connecting,
    /// 正常收发。
    Connected,
    /// 套接字已关闭；随即转入 `Searching` 或 `Destroyed`。
    Disconnected,
    /// 已从注册表移除。
    Destroyed,
}

impl CircuitState {
    /// 判断状态是否允许跃迁至 `target`。
    pub fn can_transition_to(self, target: CircuitState) -> bool {
        matches!(
            (self, target),
            (CircuitState::Searching, CircuitState::Connecting)
                | (CircuitState::Searching, CircuitState::Destroyed)
                | (CircuitState::Connecting, CircuitState::Connected)
                | (CircuitState::Connecting, CircuitState::Disconnected)
                | (CircuitState::Connected, CircuitState::Disconnected)
                | (CircuitState::Disconnected, CircuitState::Searching)
                | (CircuitState::Disconnected, CircuitState::Destroyed)
        )
    }

    /// 是否持有（或正在建立）套接字。
    pub fn has_socket(self) -> bool {
        matches!(self, CircuitState::Connecting | CircuitState::Connected)
    }
}

/// 在途标识（ioid/subid）指向的目标。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum IoTarget {
    Request(RequestId),
    Monitor(SubscriptionId),
    /// 连接建立时自动发出的控制元数据读取。
    Metadata(ChannelId),
}

pub(crate) type IoHandle = Handle<IoTarget>;

/// 每连接在途标识的上限。
const MAX_IN_FLIGHT: usize = 1 << 16;

pub(crate) struct Circuit {
    pub(crate) addr: SocketAddr,
    pub(crate) state: CircuitState,
    pub(crate) epoch: u64,
    pub(crate) connections: u64,
    pub(crate) attached: BTreeSet<ChannelId>,
    pub(crate) wanted: Vec<ChannelId>,
    /// 本 epoch 内分配的 ioid/subid；断线时整体清空，旧标识随代际失效。
    pub(crate) io: Arena<IoTarget>,
    pub(crate) outbound: VecDeque<Message>,
    pub(crate) last_activity: Instant,
    pub(crate) backoff: SearchBackoff,
    pub(crate) next_search: Option<Instant>,
    pub(crate) kill_timer: Option<Arc<KillTimer>>,
    pub(crate) echo_timer: Timer,
    pub(crate) connect_timer: Timer,
}

impl Circuit {
    pub(crate) fn new(
        addr: SocketAddr,
        now: Instant,
        backoff: SearchBackoff,
        echo_timer: Timer,
        connect_timer: Timer,
    ) -> Self {
        Self {
            addr,
            state: CircuitState::Searching,
            epoch: 0,
            connections: 0,
            attached: BTreeSet::new(),
            wanted: Vec::new(),
            io: Arena::with_limit(MAX_IN_FLIGHT),
            outbound: VecDeque::new(),
            last_activity: now,
            backoff,
            next_search: None,
            kill_timer: None,
            echo_timer,
            connect_timer,
        }
    }

    /// 执行状态跃迁；非法跃迁记录告警并保持原状态。
    pub(crate) fn transition(&mut self, target: CircuitState) -> bool {
        if !self.state.can_transition_to(target) {
            warn!(
                circuit = %self.addr,
                from = ?self.state,
                to = ?target,
                "rejected illegal circuit transition"
            );
            debug_assert!(false, "illegal circuit transition {:?} -> {:?}", self.state, target);
            return false;
        }
        self.state = target;
        true
    }

    pub(crate) fn enqueue(&mut self, message: Message) {
        self.outbound.push_back(message);
    }

    pub(crate) fn allocate_io(&mut self, target: IoTarget) -> Result<IoHandle> {
        let limit = self.io.limit();
        self.io
            .try_insert(target)
            .map_err(|_| CaError::ResourceExhausted {
                resource: "in-flight request",
                limit,
            })
    }

    /// 当前在途的一次性请求数。
    pub(crate) fn outstanding_requests(&self) -> usize {
        self.io
            .iter()
            .filter(|(_, target)| matches!(target, IoTarget::Request(_)))
            .count()
    }

    /// 没有任何通道引用本 Circuit。
    pub(crate) fn is_unreferenced(&self) -> bool {
        self.attached.is_empty() && self.wanted.is_empty()
    }

    pub(crate) fn disarm_timers(&mut self) {
        if let Some(kill_timer) = self.kill_timer.take() {
            kill_timer.disarm();
        }
        self.echo_timer.cancel();
        self.connect_timer.cancel();
    }

    pub(crate) fn info(&self) -> CircuitInfo {
        CircuitInfo {
            addr: self.addr,
            state: self.state,
            epoch: self.epoch,
            connections: self.connections,
            attached: self.attached.len(),
            wanted: self.wanted.len(),
            outstanding_requests: self.outstanding_requests(),
            search_period: self.backoff.current(),
            search_attempts: self.backoff.attempts(),
            kill_timer_armed: self.kill_timer.as_ref().is_some_and(|timer| timer.is_armed()),
        }
    }
}

/// 注册表中的 Circuit 条目：逐 Circuit 锁。
pub struct CircuitCell {
    pub(crate) addr: SocketAddr,
    pub(crate) inner: Mutex<Circuit>,
}

impl CircuitCell {
    pub(crate) fn new(circuit: Circuit) -> Self {
        Self {
            addr: circuit.addr,
            inner: Mutex::new(circuit),
        }
    }
}

/// Circuit 快照。
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitInfo {
    pub addr: SocketAddr,
    pub state: CircuitState,
    pub epoch: u64,
    /// 成功进入 `Connected` 的次数。
    pub connections: u64,
    pub attached: usize,
    pub wanted: usize,
    pub outstanding_requests: usize,
    /// 下一次搜索前的等待周期。
    pub search_period: Duration,
    pub search_attempts: u32,
    pub kill_timer_armed: bool,
}
