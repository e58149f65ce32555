//! # 客户端上下文
//!
//! ## 核心意图（Why）
//! - 显式拥有全部 Circuit、Channel、订阅与在途请求的注册表，替代进程级全局单例；
//! - 完成“名称 → Circuit”的解析（搜索），并把应用请求路由到正确的 Circuit；
//! - 作为 I/O 层回报事件的唯一入口，驱动 Circuit 状态机与订阅重放。
//!
//! ## 并发模型（How）
//! - 注册表由一把全局锁保护；需要修改 Circuit 时在全局锁内再取逐 Circuit 锁，顺序恒为
//!   “全局 → Circuit → 定时器队列”；
//! - 持锁期间只把 I/O 请求与应用回调记录到 [`Effects`]，锁全部释放后再执行，回调可以安全地
//!   重入上下文；
//! - 定时器回调只持有上下文的 `Weak`，上下文释放后触发即为空操作。
//!
//! ## 关键约束（What）
//! - 断开与新连接成功竞争时断开获胜：每次进入 `Connecting` 都递增 epoch，旧 epoch 的
//!   握手完成、报文与失败回报一律丢弃；
//! - 新 epoch 重新分配全部 ioid/subid，上一 epoch 的标识不会被复用到新请求上；
//! - 可以通过重连恢复的失败只以连接状态回调告知应用，调用方误用立即以 `Misuse` 类错误返回。

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use pvlink_core::wire::{ControlInfo, DbrType, Message, Reading, Value, status};
use pvlink_core::{
    Arena, CaError, ClientConfig, ErrorCategory, Expire, Result, SearchBackoff, Timer,
    TimerNotify, TimerQueue,
};
use tracing::{debug, info, warn};

use crate::beacon::BeaconTracker;
use crate::channel::{
    Channel, ChannelInfo, ChannelState, Request, RequestKind, has_control_metadata, resolve_count,
};
use crate::circuit::{Circuit, CircuitCell, CircuitInfo, CircuitState, IoTarget};
use crate::effects::{Action, Callback, Effects};
use crate::ids::{ChannelId, CircuitId, RequestId, SubscriptionId};
use crate::io::{CircuitLink, Connector, SearchRequest, SearchTransport};
use crate::kill_timer::{CircuitEvictor, KillTimer};
use crate::listener::{ChannelListener, GetCallback, MonitorListener, PutCallback};
use crate::stats::{ContextStats, StatsCounters};
use crate::subscription::{SubscriptionRegistry, SubscriptionSpec, WireLink};

struct Registry {
    shut_down: bool,
    channels: Arena<Channel>,
    subscriptions: SubscriptionRegistry,
    requests: Arena<Request>,
    circuits: Arena<Arc<CircuitCell>>,
    by_addr: HashMap<SocketAddr, CircuitId>,
    beacons: BeaconTracker,
}

impl Registry {
    fn ensure_open(&self) -> Result<()> {
        if self.shut_down {
            return Err(CaError::ShutDown);
        }
        Ok(())
    }

    fn cell(&self, id: CircuitId) -> Option<Arc<CircuitCell>> {
        self.circuits.get(id.0).cloned()
    }

    fn cell_at(&self, addr: SocketAddr) -> Option<Arc<CircuitCell>> {
        self.by_addr.get(&addr).and_then(|id| self.cell(*id))
    }

    fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels.get(id.0).ok_or_else(|| stale(id))
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.channels.get_mut(id.0).ok_or_else(|| stale(id))
    }
}

fn stale(id: ChannelId) -> CaError {
    CaError::StaleChannel {
        handle: id.to_string(),
    }
}

/// 已连接通道的路由：所在 Circuit、服务器分配的 sid 与原生元素数。
fn route(channel: &Channel) -> Option<(CircuitId, u32, u32)> {
    match (channel.state, channel.circuit, channel.sid, channel.native) {
        (ChannelState::Connected, Some(circuit), Some(sid), Some((_, count))) => {
            Some((circuit, sid, count))
        }
        _ => None,
    }
}

fn earliest(current: Option<Instant>, candidate: Instant) -> Option<Instant> {
    Some(current.map_or(candidate, |at| at.min(candidate)))
}

/// 在当前连接上发出一个已登记的请求，分配新的 ioid。
fn send_request(
    requests: &mut Arena<Request>,
    channels: &mut Arena<Channel>,
    request_id: RequestId,
    link: &mut WireLink<'_>,
) -> Result<()> {
    let Some(request) = requests.get_mut(request_id.0) else {
        return Ok(());
    };
    let ioid = link.circuit.allocate_io(IoTarget::Request(request_id))?;
    let message = match &request.kind {
        RequestKind::Get {
            data_type, count, ..
        } => Message::ReadNotify {
            sid: link.sid,
            ioid: ioid.to_wire(),
            data_type: *data_type,
            count: resolve_count(*count, link.native_count),
        },
        RequestKind::Put { value, .. } => Message::WriteNotify {
            sid: link.sid,
            ioid: ioid.to_wire(),
            value: value.clone(),
        },
    };
    request.ioid = Some(ioid);
    link.circuit.enqueue(message);
    if let Some(channel) = channels.get_mut(request.channel.0) {
        channel.in_flight.insert(request_id);
    }
    Ok(())
}

/// 以同一完成路径让一批请求失败；已放弃的请求静默移除。
fn fail_requests(
    requests: &mut Arena<Request>,
    effects: &mut Effects,
    mut circuit: Option<&mut Circuit>,
    ids: impl IntoIterator<Item = RequestId>,
    error: impl Fn() -> CaError,
) {
    for request_id in ids {
        let Some(mut request) = requests.remove(request_id.0) else {
            continue;
        };
        if let (Some(ioid), Some(circuit)) = (request.ioid, circuit.as_deref_mut()) {
            circuit.io.remove(ioid);
        }
        effects.callback_opt(request.kind.settle(request_id, Err(error())));
    }
}

pub(crate) struct ContextInner {
    config: ClientConfig,
    timers: TimerQueue,
    connector: Arc<dyn Connector>,
    search: Arc<dyn SearchTransport>,
    registry: Mutex<Registry>,
    search_timer: Timer,
    stats: StatsCounters,
    weak_self: Weak<ContextInner>,
}

impl ContextInner {
    fn now(&self) -> Instant {
        self.timers.now()
    }

    fn weak(&self) -> WeakContext {
        WeakContext {
            inner: self.weak_self.clone(),
        }
    }

    fn search_backoff(&self) -> SearchBackoff {
        SearchBackoff::new(
            self.config.search_initial_period,
            self.config.search_retry_ceiling,
        )
    }

    /// 持全局锁执行 `f`，释放锁之后再执行它记录的副作用。
    fn with_registry<R>(&self, f: impl FnOnce(&mut Registry, &mut Effects) -> R) -> R {
        let mut effects = Effects::default();
        let result = {
            let mut registry = self.registry.lock();
            f(&mut registry, &mut effects)
        };
        self.apply(effects);
        result
    }

    fn apply(&self, effects: Effects) {
        let Effects { actions, callbacks } = effects;
        for action in actions {
            match action {
                Action::Open(link) => self.connector.open(link),
                Action::Wake(circuit) => self.connector.wake(circuit),
                Action::Close { circuit, epoch } => self.connector.close(circuit, epoch),
                Action::Search(requests) => {
                    StatsCounters::add(&self.stats.searches_sent, requests.len() as u64);
                    self.search.send(&requests);
                }
            }
        }
        for callback in callbacks {
            callback.invoke();
        }
    }

    // ---- 定时器 ----

    fn schedule_search(&self, due: Instant) {
        let sooner = self.search_timer.expires_at().is_none_or(|at| due < at);
        if sooner {
            self.search_timer.start_at(self.search_notify(), due);
        }
    }

    fn search_notify(&self) -> Arc<dyn TimerNotify> {
        let weak = self.weak_self.clone();
        Arc::new(move |now: Instant| {
            let Some(inner) = weak.upgrade() else {
                return Expire::Done;
            };
            match inner.search_round(now) {
                Some(next) => Expire::Restart(next.saturating_duration_since(now)),
                None => Expire::Done,
            }
        })
    }

    fn circuit_notify(
        &self,
        circuit: CircuitId,
        epoch: u64,
        on_expire: fn(&ContextInner, CircuitId, u64, Instant) -> Expire,
    ) -> Arc<dyn TimerNotify> {
        let weak = self.weak_self.clone();
        Arc::new(move |now: Instant| match weak.upgrade() {
            Some(inner) => on_expire(&inner, circuit, epoch, now),
            None => Expire::Done,
        })
    }

    /// 发出所有到期的名称查询，返回下一次到期时间。
    fn search_round(&self, now: Instant) -> Option<Instant> {
        self.with_registry(|reg, fx| self.search_round_locked(reg, fx, now))
    }

    fn search_round_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        now: Instant,
    ) -> Option<Instant> {
        if reg.shut_down {
            return None;
        }
        let mut batch = Vec::new();
        let mut next = None;

        for (handle, channel) in reg.channels.iter_mut() {
            if channel.state != ChannelState::Searching {
                continue;
            }
            let Some(mut due) = channel.next_search else {
                continue;
            };
            if due <= now {
                batch.push(SearchRequest {
                    search_id: ChannelId(handle).wire(),
                    name: Arc::clone(&channel.name),
                });
                due = now + channel.backoff.advance();
                channel.next_search = Some(due);
            }
            next = earliest(next, due);
        }

        // 等待重连的 Circuit 以自身的退避周期替全部等待中的通道查询。
        for (_, cell) in reg.circuits.iter() {
            let mut guard = cell.inner.lock();
            let circuit = &mut *guard;
            if circuit.state != CircuitState::Searching {
                continue;
            }
            let Some(mut due) = circuit.next_search else {
                continue;
            };
            if due <= now {
                for id in &circuit.wanted {
                    if let Some(channel) = reg.channels.get(id.0) {
                        batch.push(SearchRequest {
                            search_id: id.wire(),
                            name: Arc::clone(&channel.name),
                        });
                    }
                }
                due = now + circuit.backoff.advance();
                circuit.next_search = Some(due);
                debug!(
                    circuit = %circuit.addr,
                    attempts = circuit.backoff.attempts(),
                    period = ?circuit.backoff.current(),
                    "re-searching for disconnected circuit"
                );
            }
            next = earliest(next, due);
        }

        if !batch.is_empty() {
            debug!(count = batch.len(), "sending name searches");
        }
        fx.search(batch);
        next
    }

    fn echo_expired(&self, circuit: CircuitId, epoch: u64, now: Instant) -> Expire {
        self.with_registry(|reg, fx| {
            let Some(cell) = reg.cell(circuit) else {
                return Expire::Done;
            };
            let mut guard = cell.inner.lock();
            if guard.epoch != epoch || guard.state != CircuitState::Connected {
                return Expire::Done;
            }
            self.echo_if_idle(fx, circuit, &mut guard, now);
            Expire::Restart(self.config.echo_period)
        })
    }

    fn echo_if_idle(
        &self,
        fx: &mut Effects,
        id: CircuitId,
        circuit: &mut Circuit,
        now: Instant,
    ) -> bool {
        let idle = now.saturating_duration_since(circuit.last_activity);
        if idle < self.config.echo_period {
            return false;
        }
        circuit.enqueue(Message::Echo);
        fx.wake(id);
        debug!(circuit = %circuit.addr, idle = ?idle, "probing idle circuit");
        true
    }

    fn connect_expired(&self, circuit: CircuitId, epoch: u64, _now: Instant) -> Expire {
        self.with_registry(|reg, fx| {
            let Some(cell) = reg.cell(circuit) else {
                return;
            };
            let mut guard = cell.inner.lock();
            if guard.epoch == epoch && guard.state == CircuitState::Connecting {
                warn!(
                    circuit = %guard.addr,
                    epoch,
                    timeout = ?self.config.connection_timeout,
                    "circuit handshake timed out"
                );
                self.disconnect_locked(reg, fx, circuit, &mut guard, "connect timeout");
            }
        });
        Expire::Done
    }

    // ---- Circuit 生命周期 ----

    fn create_circuit_locked(&self, reg: &mut Registry, addr: SocketAddr) -> Result<CircuitId> {
        let echo_timer = self.timers.create_timer()?;
        let connect_timer = self.timers.create_timer()?;
        let circuit = Circuit::new(
            addr,
            self.now(),
            self.search_backoff(),
            echo_timer,
            connect_timer,
        );
        let limit = reg.circuits.limit();
        let handle = reg
            .circuits
            .try_insert(Arc::new(CircuitCell::new(circuit)))
            .map_err(|_| CaError::ResourceExhausted {
                resource: "circuit",
                limit,
            })?;
        let id = CircuitId(handle);
        reg.by_addr.insert(addr, id);
        debug!(circuit = %addr, id = %id, "circuit created");
        Ok(id)
    }

    fn begin_connect_locked(
        &self,
        fx: &mut Effects,
        id: CircuitId,
        cell: &Arc<CircuitCell>,
        circuit: &mut Circuit,
    ) {
        if !circuit.transition(CircuitState::Connecting) {
            return;
        }
        circuit.epoch += 1;
        circuit.next_search = None;
        circuit.outbound.clear();
        circuit.io.clear();
        circuit.connect_timer.start(
            self.circuit_notify(id, circuit.epoch, ContextInner::connect_expired),
            self.config.connection_timeout,
        );
        fx.open(CircuitLink::new(
            self.weak(),
            id,
            circuit.epoch,
            Arc::clone(cell),
        ));
        info!(
            circuit = %circuit.addr,
            epoch = circuit.epoch,
            channels = circuit.attached.len(),
            "connecting circuit"
        );
    }

    /// 把通道绑定到 Circuit。等待重连的 Circuit 会带着全部等待中的通道一起进入 `Connecting`。
    fn bind_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        id: ChannelId,
        circuit_id: CircuitId,
    ) {
        let Some(cell) = reg.cell(circuit_id) else {
            return;
        };
        let mut guard = cell.inner.lock();
        let circuit = &mut *guard;
        match circuit.state {
            CircuitState::Searching => {
                let mut joining = std::mem::take(&mut circuit.wanted);
                if !joining.contains(&id) {
                    joining.push(id);
                }
                for channel_id in joining {
                    if let Some(channel) = reg.channels.get_mut(channel_id.0) {
                        channel.attach(circuit_id);
                        circuit.attached.insert(channel_id);
                    }
                }
                self.begin_connect_locked(fx, circuit_id, &cell, circuit);
            }
            CircuitState::Connecting => {
                if let Some(channel) = reg.channels.get_mut(id.0) {
                    channel.attach(circuit_id);
                    circuit.attached.insert(id);
                }
            }
            CircuitState::Connected => {
                if let Some(channel) = reg.channels.get_mut(id.0) {
                    channel.attach(circuit_id);
                    circuit.attached.insert(id);
                    circuit.enqueue(Message::CreateChannel {
                        cid: id.wire(),
                        name: channel.name.to_string(),
                    });
                    fx.wake(circuit_id);
                }
            }
            CircuitState::Disconnected | CircuitState::Destroyed => {
                debug!(circuit = %circuit.addr, state = ?circuit.state, "circuit is not accepting channels");
            }
        }
    }

    /// 通道在别处被找到：解除它与原等待 Circuit 的关系，必要时销毁后者。
    fn unwant_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        id: ChannelId,
        previous: CircuitId,
    ) {
        if let Some(cell) = reg.cell(previous) {
            let mut guard = cell.inner.lock();
            let circuit = &mut *guard;
            circuit.wanted.retain(|wanted| *wanted != id);
            if circuit.is_unreferenced() && circuit.state == CircuitState::Searching {
                self.destroy_circuit_locked(reg, fx, previous, circuit);
            }
        }
        let now = self.now();
        if let Some(channel) = reg.channels.get_mut(id.0) {
            channel.detach(ChannelState::Searching, None);
            let due = now + channel.backoff.current();
            channel.next_search = Some(due);
            self.schedule_search(due);
        }
    }

    fn release_if_unreferenced(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        id: CircuitId,
        circuit: &mut Circuit,
    ) {
        if circuit.is_unreferenced() {
            self.destroy_circuit_locked(reg, fx, id, circuit);
        }
    }

    /// 销毁 Circuit：先解除全部定时器，再从注册表移除。
    fn destroy_circuit_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        id: CircuitId,
        circuit: &mut Circuit,
    ) {
        if circuit.state == CircuitState::Destroyed {
            return;
        }
        if circuit.state.has_socket() {
            circuit.transition(CircuitState::Disconnected);
            fx.close(id, circuit.epoch);
        }
        circuit.disarm_timers();
        circuit.outbound.clear();
        circuit.io.clear();
        circuit.next_search = None;
        circuit.transition(CircuitState::Destroyed);
        reg.circuits.remove(id.0);
        if reg.by_addr.get(&circuit.addr) == Some(&id) {
            reg.by_addr.remove(&circuit.addr);
        }
        info!(circuit = %circuit.addr, "circuit destroyed");
    }

    /// 连接丢失：通道转为 `Unconnected` 并挂到等待列表，订阅保留但遗忘下发记录。
    fn disconnect_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        id: CircuitId,
        circuit: &mut Circuit,
        reason: &'static str,
    ) {
        if !circuit.state.has_socket() {
            return;
        }
        let epoch = circuit.epoch;
        circuit.transition(CircuitState::Disconnected);
        circuit.disarm_timers();
        circuit.outbound.clear();
        circuit.io.clear();
        fx.close(id, epoch);
        StatsCounters::bump(&self.stats.disconnects);
        warn!(circuit = %circuit.addr, epoch, reason, "circuit disconnected");

        let attached = std::mem::take(&mut circuit.attached);
        for channel_id in attached {
            let Some(channel) = reg.channels.get_mut(channel_id.0) else {
                continue;
            };
            if channel.state.is_connected() {
                fx.callback(Callback::Connection {
                    listener: Arc::clone(&channel.listener),
                    channel: channel_id,
                    connected: false,
                });
            }
            let in_flight = std::mem::take(&mut channel.in_flight);
            let subscriptions = channel.subscriptions.clone();
            let name = Arc::clone(&channel.name);
            channel.detach(ChannelState::Unconnected, Some(id));
            reg.subscriptions.forget(&subscriptions, None);
            fail_requests(&mut reg.requests, fx, None, in_flight, || {
                CaError::NotConnected {
                    name: name.to_string(),
                }
            });
            circuit.wanted.push(channel_id);
        }

        if circuit.wanted.is_empty() {
            self.destroy_circuit_locked(reg, fx, id, circuit);
        } else {
            let now = self.now();
            circuit.transition(CircuitState::Searching);
            circuit.backoff.reset();
            circuit.next_search = Some(now);
            self.schedule_search(now);
        }
    }

    // ---- 入站报文 ----

    fn dispatch_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        circuit_id: CircuitId,
        circuit: &mut Circuit,
        message: Message,
    ) {
        match message {
            Message::CreateChannelReply {
                cid,
                sid,
                native_type,
                element_count,
            } => self.channel_ready_locked(
                reg,
                fx,
                circuit_id,
                circuit,
                cid,
                sid,
                (native_type, element_count),
            ),
            Message::CreateChannelFailed { cid } => {
                warn!(circuit = %circuit.addr, cid, "server refused to create channel");
                self.channel_lost_locked(reg, fx, circuit_id, circuit, cid, true);
            }
            Message::ServerDisconnect { cid } => {
                self.channel_lost_locked(reg, fx, circuit_id, circuit, cid, false);
            }
            Message::EventData {
                subid,
                status,
                reading,
                ..
            } => self.deliver_event_locked(reg, fx, circuit, subid, status, reading),
            Message::ReadNotifyReply {
                ioid,
                status,
                reading: None,
                ..
            } if status::is_success(status) => {
                // 成功却不带数据的读取应答：请求以协议错误结束，连接随之拆除。
                self.complete_locked(reg, fx, circuit, ioid, status, None);
                StatsCounters::bump(&self.stats.protocol_errors);
                warn!(circuit = %circuit.addr, ioid, "read reply without data; tearing circuit down");
                self.disconnect_locked(reg, fx, circuit_id, circuit, "protocol error");
            }
            Message::ReadNotifyReply {
                ioid,
                status,
                reading,
                ..
            } => self.complete_locked(reg, fx, circuit, ioid, status, reading),
            Message::ReadControlReply { ioid, status, info } => {
                self.metadata_locked(reg, fx, circuit_id, circuit, ioid, status, info)
            }
            Message::WriteNotifyReply { ioid, status } => {
                self.complete_locked(reg, fx, circuit, ioid, status, None)
            }
            Message::Error {
                cid,
                status,
                message,
            } => warn!(circuit = %circuit.addr, cid, status, %message, "server reported an error"),
            Message::Echo | Message::Version { .. } | Message::ClearChannel { .. } => {}
            other => {
                StatsCounters::bump(&self.stats.protocol_errors);
                warn!(
                    circuit = %circuit.addr,
                    message = other.name(),
                    "unexpected message on circuit; tearing it down"
                );
                self.disconnect_locked(reg, fx, circuit_id, circuit, "protocol error");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn channel_ready_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        circuit_id: CircuitId,
        circuit: &mut Circuit,
        cid: u32,
        sid: u32,
        native: (DbrType, u32),
    ) {
        let Some(handle) = reg.channels.resolve_wire(cid) else {
            // 通道已被销毁：归还服务器侧资源。
            debug!(circuit = %circuit.addr, cid, "create reply for unknown channel");
            circuit.enqueue(Message::ClearChannel { sid, cid });
            fx.wake(circuit_id);
            return;
        };
        let id = ChannelId(handle);
        let Some(channel) = reg.channels.get_mut(handle) else {
            return;
        };
        if channel.circuit != Some(circuit_id) || channel.state != ChannelState::Connecting {
            debug!(channel = %channel.name, state = ?channel.state, "ignoring duplicate create reply");
            return;
        }
        channel.state = ChannelState::Connected;
        channel.sid = Some(sid);
        channel.native = Some(native);
        channel.server = Some(circuit.addr);
        channel.connections += 1;
        channel.backoff.reset();
        fx.callback(Callback::Connection {
            listener: Arc::clone(&channel.listener),
            channel: id,
            connected: true,
        });
        let order = channel.subscriptions.clone();
        let pending: Vec<RequestId> = channel.pending.drain(..).collect();
        info!(channel = %channel.name, circuit = %circuit.addr, sid, "channel connected");

        let mut link = WireLink {
            id: circuit_id,
            circuit,
            sid,
            native_count: native.1,
        };
        let armed = reg.subscriptions.on_reconnect(&order, &mut link);
        StatsCounters::add(&self.stats.subscriptions_armed, armed as u64);
        for request_id in pending {
            if let Err(err) = send_request(&mut reg.requests, &mut reg.channels, request_id, &mut link)
            {
                warn!(request = %request_id, error = %err, "failed to send queued request");
                if let Some(mut request) = reg.requests.remove(request_id.0) {
                    fx.callback_opt(request.kind.settle(request_id, Err(err)));
                }
            }
        }
        if self.config.fetch_metadata && has_control_metadata(native.0) {
            match link.circuit.allocate_io(IoTarget::Metadata(id)) {
                Ok(ioid) => link.circuit.enqueue(Message::ReadControl {
                    sid,
                    ioid: ioid.to_wire(),
                }),
                Err(err) => debug!(channel = %id, error = %err, "control metadata not requested"),
            }
        }
        fx.wake(circuit_id);
    }

    /// 控制元数据应答。只在通道仍连在同一 Circuit 上时保存。
    #[allow(clippy::too_many_arguments)]
    fn metadata_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        circuit_id: CircuitId,
        circuit: &mut Circuit,
        ioid: u32,
        status: u32,
        info: Option<ControlInfo>,
    ) {
        let target = circuit
            .io
            .resolve_wire(ioid)
            .and_then(|handle| circuit.io.get(handle).map(|target| (handle, *target)));
        let Some((handle, IoTarget::Metadata(channel_id))) = target else {
            StatsCounters::bump(&self.stats.stale_completions);
            debug!(circuit = %circuit.addr, ioid, "discarding metadata for unknown correlation id");
            return;
        };
        circuit.io.remove(handle);
        let Some(channel) = reg.channels.get_mut(channel_id.0) else {
            return;
        };
        if channel.circuit != Some(circuit_id) || !channel.state.is_connected() {
            return;
        }
        if !status::is_success(status) {
            warn!(channel = %channel.name, status, "server refused control metadata");
            return;
        }
        let Some(info) = info else {
            StatsCounters::bump(&self.stats.protocol_errors);
            warn!(circuit = %circuit.addr, ioid, "metadata reply without data; tearing circuit down");
            self.disconnect_locked(reg, fx, circuit_id, circuit, "protocol error");
            return;
        };
        debug!(
            channel = %channel.name,
            units = %info.units,
            precision = info.precision,
            "control metadata received"
        );
        channel.metadata = Some(info);
    }

    /// 单个通道在仍然存活的 Circuit 上失去连接（创建被拒或服务器撤销）。
    fn channel_lost_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        circuit_id: CircuitId,
        circuit: &mut Circuit,
        cid: u32,
        rejected: bool,
    ) {
        let Some(handle) = reg.channels.resolve_wire(cid) else {
            return;
        };
        let id = ChannelId(handle);
        let now = self.now();
        let Some(channel) = reg.channels.get_mut(handle) else {
            return;
        };
        if channel.circuit != Some(circuit_id) {
            return;
        }
        if channel.state.is_connected() {
            fx.callback(Callback::Connection {
                listener: Arc::clone(&channel.listener),
                channel: id,
                connected: false,
            });
        }
        let in_flight = std::mem::take(&mut channel.in_flight);
        let subscriptions = channel.subscriptions.clone();
        let name = Arc::clone(&channel.name);
        channel.detach(ChannelState::Searching, None);
        // 被拒绝的通道沿退避周期重试，避免与同一服务器反复握手。
        let due = if rejected {
            now + channel.backoff.advance()
        } else {
            now
        };
        channel.next_search = Some(due);
        circuit.attached.remove(&id);
        info!(channel = %name, circuit = %circuit.addr, rejected, "channel lost; searching again");

        reg.subscriptions.forget(&subscriptions, Some(&mut *circuit));
        fail_requests(&mut reg.requests, fx, Some(&mut *circuit), in_flight, || {
            CaError::NotConnected {
                name: name.to_string(),
            }
        });
        self.schedule_search(due);
        self.release_if_unreferenced(reg, fx, circuit_id, circuit);
    }

    fn deliver_event_locked(
        &self,
        reg: &Registry,
        fx: &mut Effects,
        circuit: &Circuit,
        subid: u32,
        status: u32,
        reading: Option<Reading>,
    ) {
        let target = circuit
            .io
            .resolve_wire(subid)
            .and_then(|handle| circuit.io.get(handle).copied());
        let Some(IoTarget::Monitor(subscription_id)) = target else {
            debug!(circuit = %circuit.addr, subid, "dropping update for unknown subscription");
            return;
        };
        let Some(subscription) = reg.subscriptions.get(subscription_id) else {
            return;
        };
        match reading {
            Some(reading) if status::is_success(status) => fx.callback(Callback::Data {
                listener: Arc::clone(&subscription.listener),
                subscription: subscription_id,
                reading,
            }),
            _ => warn!(subscription = %subscription_id, status, "monitor update carried an error status"),
        }
    }

    /// 按关联标识完成一次性请求；找不到或已被放弃的完成计为过期并丢弃。
    fn complete_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        circuit: &mut Circuit,
        ioid: u32,
        status: u32,
        reading: Option<Reading>,
    ) {
        let target = circuit
            .io
            .resolve_wire(ioid)
            .and_then(|handle| circuit.io.get(handle).map(|target| (handle, *target)));
        let Some((handle, IoTarget::Request(request_id))) = target else {
            StatsCounters::bump(&self.stats.stale_completions);
            debug!(circuit = %circuit.addr, ioid, "discarding completion for unknown correlation id");
            return;
        };
        circuit.io.remove(handle);
        let Some(mut request) = reg.requests.remove(request_id.0) else {
            StatsCounters::bump(&self.stats.stale_completions);
            return;
        };
        let name = match reg.channels.get_mut(request.channel.0) {
            Some(channel) => {
                channel.in_flight.remove(&request_id);
                channel.name.to_string()
            }
            None => String::new(),
        };
        let outcome = if status::is_success(status) {
            Ok(reading)
        } else {
            Err(CaError::Rejected { name, status })
        };
        let operation = request.kind.operation();
        match request.kind.settle(request_id, outcome) {
            Some(callback) => fx.callback(callback),
            None => {
                StatsCounters::bump(&self.stats.stale_completions);
                debug!(request = %request_id, operation, "discarding late completion of abandoned request");
            }
        }
    }

    fn destroy_channel_locked(
        &self,
        reg: &mut Registry,
        fx: &mut Effects,
        id: ChannelId,
    ) -> Result<()> {
        let channel = reg.channels.remove(id.0).ok_or_else(|| stale(id))?;
        let bound = channel.circuit.or(channel.rebind);
        let cell = bound.and_then(|circuit| reg.cell(circuit));
        let mut guard = cell.as_ref().map(|cell| cell.inner.lock());
        let route = route(&channel);

        // (a) 注销全部订阅，已下发的先撤销。
        for subscription in &channel.subscriptions {
            let mut link = match (route, guard.as_deref_mut()) {
                (Some((circuit_id, sid, native_count)), Some(circuit)) => Some(WireLink {
                    id: circuit_id,
                    circuit,
                    sid,
                    native_count,
                }),
                _ => None,
            };
            if let Ok((_, true)) = reg.subscriptions.remove(*subscription, link.as_mut()) {
                StatsCounters::bump(&self.stats.subscriptions_cancelled);
            }
        }

        // (b) 待发与在途请求以“已取消”结束。
        let requests = channel
            .pending
            .iter()
            .chain(channel.in_flight.iter())
            .copied()
            .collect::<Vec<_>>();
        fail_requests(
            &mut reg.requests,
            fx,
            guard.as_deref_mut(),
            requests,
            || CaError::Cancelled {
                reason: "channel destroyed",
            },
        );

        // (c) 解除与 Circuit 的双向引用。
        if let (Some(circuit_id), Some(circuit)) = (bound, guard.as_deref_mut()) {
            if let Some((_, sid, _)) = route {
                circuit.enqueue(Message::ClearChannel { sid, cid: id.wire() });
                fx.wake(circuit_id);
            }
            circuit.attached.remove(&id);
            circuit.wanted.retain(|wanted| *wanted != id);
            self.release_if_unreferenced(reg, fx, circuit_id, circuit);
        }
        debug!(channel = %channel.name, id = %id, "channel destroyed");
        Ok(())
    }

    fn submit(&self, channel_id: ChannelId, kind: RequestKind) -> Result<RequestId> {
        self.with_registry(|reg, fx| {
            reg.ensure_open()?;
            let route = route(reg.channel(channel_id)?);
            let limit = reg.requests.limit();
            let request_id = reg
                .requests
                .try_insert(Request::new(channel_id, kind))
                .map(RequestId)
                .map_err(|_| CaError::ResourceExhausted {
                    resource: "request",
                    limit,
                })?;
            let Some((circuit_id, sid, native_count)) = route else {
                reg.channel_mut(channel_id)?.pending.push_back(request_id);
                return Ok(request_id);
            };
            let sent = match reg.cell(circuit_id) {
                Some(cell) => {
                    let mut guard = cell.inner.lock();
                    let mut link = WireLink {
                        id: circuit_id,
                        circuit: &mut *guard,
                        sid,
                        native_count,
                    };
                    send_request(&mut reg.requests, &mut reg.channels, request_id, &mut link)
                }
                None => Err(CaError::NotConnected {
                    name: reg.channel(channel_id)?.name.to_string(),
                }),
            };
            if let Err(err) = sent {
                reg.requests.remove(request_id.0);
                return Err(err);
            }
            fx.wake(circuit_id);
            Ok(request_id)
        })
    }

    fn check_array(&self, bytes: usize) -> Result<()> {
        let limit = self.config.max_array_bytes;
        if bytes > limit {
            return Err(CaError::ArrayTooLarge { bytes, limit });
        }
        Ok(())
    }
}

impl CircuitEvictor for ContextInner {
    fn evict(&self, circuit: CircuitId, epoch: u64) {
        self.with_registry(|reg, fx| {
            let Some(cell) = reg.cell(circuit) else {
                return;
            };
            let mut guard = cell.inner.lock();
            if guard.epoch != epoch || guard.state != CircuitState::Connected {
                debug!(circuit = %guard.addr, epoch, "kill timer fired for a superseded epoch");
                return;
            }
            StatsCounters::bump(&self.stats.kill_timer_evictions);
            warn!(
                circuit = %guard.addr,
                epoch,
                bound = ?self.config.inactivity_timeout,
                "peer unresponsive; evicting circuit"
            );
            self.disconnect_locked(reg, fx, circuit, &mut guard, "inactivity bound exceeded");
        });
    }
}

/// 客户端上下文：所有 Circuit 与 Channel 的拥有者。克隆体共享同一份注册表。
#[derive(Clone)]
pub struct ClientContext {
    inner: Arc<ContextInner>,
}

impl ClientContext {
    /// 构造上下文。配置在此处校验；I/O 由 `connector` 与 `search` 承担。
    pub fn new(
        config: ClientConfig,
        timers: TimerQueue,
        connector: Arc<dyn Connector>,
        search: Arc<dyn SearchTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let search_timer = timers.create_timer()?;
        let registry = Registry {
            shut_down: false,
            channels: Arena::with_limit(config.max_channels),
            subscriptions: SubscriptionRegistry::with_limit(pvlink_core::arena::MAX_WIRE_SLOTS),
            requests: Arena::default(),
            circuits: Arena::with_limit(config.max_circuits),
            by_addr: HashMap::new(),
            beacons: BeaconTracker::new(timers.now()),
        };
        let inner = Arc::new_cyclic(|weak_self| ContextInner {
            config,
            timers,
            connector,
            search,
            registry: Mutex::new(registry),
            search_timer,
            stats: StatsCounters::default(),
            weak_self: weak_self.clone(),
        });
        Ok(Self { inner })
    }

    pub fn downgrade(&self) -> WeakContext {
        self.inner.weak()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.inner.timers
    }

    // ---- 应用接口 ----

    /// 创建通道并立即开始搜索。
    pub fn create_channel(
        &self,
        name: &str,
        listener: Arc<dyn ChannelListener>,
    ) -> Result<ChannelId> {
        let inner = &*self.inner;
        inner.with_registry(|reg, _| {
            reg.ensure_open()?;
            let now = inner.now();
            let limit = reg.channels.limit();
            let handle = reg
                .channels
                .try_insert(Channel::new(
                    Arc::from(name),
                    listener,
                    inner.search_backoff(),
                    now,
                ))
                .map_err(|_| CaError::ResourceExhausted {
                    resource: "channel",
                    limit,
                })?;
            let id = ChannelId(handle);
            inner.schedule_search(now);
            debug!(channel = name, id = %id, "channel created");
            Ok(id)
        })
    }

    /// 销毁通道：注销订阅、以“已取消”结束全部请求、解除与 Circuit 的绑定。
    pub fn destroy_channel(&self, id: ChannelId) -> Result<()> {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| inner.destroy_channel_locked(reg, fx, id))
    }

    /// 一次性读取。未连接时排队，连接建立后按提交顺序发出。`count` 为 0 表示原生元素数。
    pub fn get(
        &self,
        channel: ChannelId,
        data_type: DbrType,
        count: u32,
        done: GetCallback,
    ) -> Result<RequestId> {
        self.inner
            .check_array(data_type.element_size().saturating_mul(count as usize))?;
        self.inner.submit(
            channel,
            RequestKind::Get {
                data_type,
                count,
                done: Some(done),
            },
        )
    }

    /// 带完成通知的写入。未连接时排队。
    pub fn put_callback(&self, channel: ChannelId, value: Value, done: PutCallback) -> Result<RequestId> {
        self.inner.check_array(value.encoded_len())?;
        self.inner.submit(
            channel,
            RequestKind::Put {
                value,
                done: Some(done),
            },
        )
    }

    /// 不等待确认的写入，只允许在已连接时调用。
    pub fn put(&self, channel: ChannelId, value: Value) -> Result<()> {
        let inner = &*self.inner;
        inner.check_array(value.encoded_len())?;
        inner.with_registry(|reg, fx| {
            reg.ensure_open()?;
            let target = reg.channel(channel)?;
            let Some((circuit_id, sid, _)) = route(target) else {
                return Err(target.not_connected());
            };
            let cell = reg.cell(circuit_id).ok_or_else(|| target.not_connected())?;
            cell.inner.lock().enqueue(Message::Write {
                sid,
                ioid: 0,
                value,
            });
            fx.wake(circuit_id);
            Ok(())
        })
    }

    /// 登记订阅；通道已连接时立即下发。
    pub fn subscribe(
        &self,
        channel: ChannelId,
        spec: SubscriptionSpec,
        listener: Arc<dyn MonitorListener>,
    ) -> Result<SubscriptionId> {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| {
            reg.ensure_open()?;
            let route = route(reg.channel(channel)?);
            let id = reg.subscriptions.add(channel, spec, listener)?;
            reg.channel_mut(channel)?.subscriptions.push(id);
            let Some((circuit_id, sid, native_count)) = route else {
                return Ok(id);
            };
            let Some(cell) = reg.cell(circuit_id) else {
                return Ok(id);
            };
            let mut guard = cell.inner.lock();
            let mut link = WireLink {
                id: circuit_id,
                circuit: &mut *guard,
                sid,
                native_count,
            };
            match reg.subscriptions.arm(id, &mut link) {
                Ok(armed) => {
                    if armed {
                        StatsCounters::bump(&inner.stats.subscriptions_armed);
                        fx.wake(circuit_id);
                    }
                    Ok(id)
                }
                Err(err) => {
                    // 不留下半登记的订阅。
                    let _ = reg.subscriptions.remove(id, None);
                    reg.channel_mut(channel)?
                        .subscriptions
                        .retain(|subscription| *subscription != id);
                    Err(err)
                }
            }
        })
    }

    /// 注销订阅。通道未连接时只删除本地记录；重复注销返回 `Misuse` 类错误。
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> Result<()> {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| {
            let channel = reg
                .subscriptions
                .get(subscription)
                .map(|entry| entry.channel)
                .ok_or_else(|| CaError::UnknownSubscription {
                    handle: subscription.to_string(),
                })?;
            let route = reg.channels.get_mut(channel.0).and_then(|owner| {
                owner.subscriptions.retain(|id| *id != subscription);
                route(owner)
            });
            let cell = route.and_then(|(circuit_id, ..)| reg.cell(circuit_id));
            let mut guard = cell.as_ref().map(|cell| cell.inner.lock());
            let mut link = match (route, guard.as_deref_mut()) {
                (Some((circuit_id, sid, native_count)), Some(circuit)) => Some(WireLink {
                    id: circuit_id,
                    circuit,
                    sid,
                    native_count,
                }),
                _ => None,
            };
            let (_, cancelled) = reg.subscriptions.remove(subscription, link.as_mut())?;
            if let (true, Some(link)) = (cancelled, link) {
                StatsCounters::bump(&inner.stats.subscriptions_cancelled);
                fx.wake(link.id);
            }
            Ok(())
        })
    }

    /// 放弃等待请求结果：完成闭包被丢弃，迟到的应答按关联标识识别后计为过期。
    ///
    /// 返回请求在调用前是否仍有待投递的完成闭包。
    pub fn abandon(&self, request: RequestId) -> bool {
        self.inner.with_registry(|reg, _| {
            let Some(entry) = reg.requests.get_mut(request.0) else {
                return false;
            };
            let live = !entry.kind.is_abandoned();
            if entry.ioid.is_some() {
                // 已发出：保留记录，迟到的应答仍能按 ioid 对上号。
                let _ = entry.kind.settle(request, Err(CaError::Cancelled { reason: "abandoned" }));
            } else if let Some(removed) = reg.requests.remove(request.0) {
                if let Some(channel) = reg.channels.get_mut(removed.channel.0) {
                    channel.pending.retain(|queued| *queued != request);
                }
            }
            if live {
                debug!(request = %request, "request abandoned");
            }
            live
        })
    }

    // ---- 查询 ----

    pub fn connection_state(&self, channel: ChannelId) -> Result<ChannelState> {
        Ok(self.inner.registry.lock().channel(channel)?.state)
    }

    /// 已连接通道的元数据；未连接时返回 `NotConnected`。
    pub fn channel_info(&self, channel: ChannelId) -> Result<ChannelInfo> {
        self.inner.registry.lock().channel(channel)?.info()
    }

    /// 通道当前绑定的 Circuit 地址（`Connecting` 或 `Connected` 时存在）。
    pub fn channel_circuit(&self, channel: ChannelId) -> Result<Option<SocketAddr>> {
        let reg = self.inner.registry.lock();
        let circuit = reg.channel(channel)?.circuit;
        Ok(circuit
            .and_then(|id| reg.circuits.get(id.0))
            .map(|cell| cell.addr))
    }

    /// 绑定在指定 Circuit 上的通道。
    pub fn circuit_channels(&self, addr: SocketAddr) -> Vec<ChannelId> {
        let reg = self.inner.registry.lock();
        reg.cell_at(addr)
            .map(|cell| cell.inner.lock().attached.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn circuit_state(&self, addr: SocketAddr) -> Option<CircuitState> {
        let reg = self.inner.registry.lock();
        reg.cell_at(addr).map(|cell| cell.inner.lock().state)
    }

    pub fn circuit_info(&self, addr: SocketAddr) -> Option<CircuitInfo> {
        let reg = self.inner.registry.lock();
        reg.cell_at(addr).map(|cell| cell.inner.lock().info())
    }

    pub fn circuits(&self) -> Vec<CircuitInfo> {
        let reg = self.inner.registry.lock();
        reg.circuits
            .iter()
            .map(|(_, cell)| cell.inner.lock().info())
            .collect()
    }

    pub fn circuit_count(&self) -> usize {
        self.inner.registry.lock().circuits.len()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.registry.lock().channels.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.lock().subscriptions.len()
    }

    pub fn stats(&self) -> ContextStats {
        self.inner.stats.snapshot()
    }

    /// 指定 Circuit 当前 epoch 的 Kill Timer。
    pub fn kill_timer(&self, addr: SocketAddr) -> Option<Arc<KillTimer>> {
        let reg = self.inner.registry.lock();
        reg.cell_at(addr)
            .and_then(|cell| cell.inner.lock().kill_timer.clone())
    }

    // ---- I/O 层入口 ----

    /// 名称查询应答。未知标识与重复应答被忽略。
    pub fn on_search_reply(&self, search_id: u32, server: SocketAddr) {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| {
            if reg.shut_down {
                return;
            }
            let Some(handle) = reg.channels.resolve_wire(search_id) else {
                debug!(search_id, %server, "ignoring reply for unknown search id");
                return;
            };
            let id = ChannelId(handle);
            let Some((state, rebind)) = reg.channels.get(handle).map(|c| (c.state, c.rebind)) else {
                return;
            };
            if !matches!(state, ChannelState::Searching | ChannelState::Unconnected) {
                debug!(channel = %id, %server, "ignoring duplicate search reply");
                return;
            }
            StatsCounters::bump(&inner.stats.search_replies);
            if let Some(previous) = rebind {
                let moved = reg.cell(previous).is_none_or(|cell| cell.addr != server);
                if moved {
                    inner.unwant_locked(reg, fx, id, previous);
                }
            }
            let circuit = match reg.by_addr.get(&server).copied() {
                Some(existing) => existing,
                None => match inner.create_circuit_locked(reg, server) {
                    Ok(created) => created,
                    Err(err) => {
                        warn!(%server, error = %err, "cannot create circuit; channel keeps searching");
                        return;
                    }
                },
            };
            inner.bind_locked(reg, fx, id, circuit);
        });
    }

    /// 服务器信标。节奏异常说明有服务器刚刚上线或恢复可达：仍在搜索的通道与等待重连的
    /// Circuit 把退避复位并立即重搜。返回本次信标是否构成异常。
    pub fn on_beacon(&self, server: SocketAddr, beacon_id: u32) -> bool {
        let inner = &*self.inner;
        let now = inner.now();
        inner.with_registry(|reg, _| {
            if reg.shut_down || !reg.beacons.observe(server, beacon_id, now) {
                return false;
            }
            StatsCounters::bump(&inner.stats.beacon_anomalies);
            let mut rescheduled = 0usize;
            for (_, channel) in reg.channels.iter_mut() {
                if channel.state == ChannelState::Searching {
                    channel.backoff.reset();
                    channel.next_search = Some(now);
                    rescheduled += 1;
                }
            }
            for (_, cell) in reg.circuits.iter() {
                let mut circuit = cell.inner.lock();
                if circuit.state == CircuitState::Searching {
                    circuit.backoff.reset();
                    circuit.next_search = Some(now);
                    rescheduled += 1;
                }
            }
            if rescheduled > 0 {
                inner.schedule_search(now);
            }
            info!(%server, beacon_id, rescheduled, "beacon anomaly; restarting searches");
            true
        })
    }

    /// 握手完成。epoch 过期或 Circuit 已不在 `Connecting` 时忽略。
    pub fn on_circuit_connected(&self, circuit_id: CircuitId, epoch: u64) {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| {
            let Some(cell) = reg.cell(circuit_id) else {
                return;
            };
            let mut guard = cell.inner.lock();
            let circuit = &mut *guard;
            if circuit.epoch != epoch || circuit.state != CircuitState::Connecting {
                debug!(
                    circuit = %circuit.addr,
                    epoch,
                    current = circuit.epoch,
                    state = ?circuit.state,
                    "ignoring stale handshake completion"
                );
                return;
            }
            circuit.transition(CircuitState::Connected);
            circuit.connections += 1;
            if circuit.connections > 1 {
                StatsCounters::bump(&inner.stats.reconnects);
            }
            circuit.connect_timer.cancel();
            circuit.backoff.reset();
            circuit.last_activity = inner.now();

            let evictor: Weak<dyn CircuitEvictor> = inner.weak_self.clone();
            match KillTimer::new(
                &inner.timers,
                evictor,
                circuit_id,
                epoch,
                inner.config.inactivity_timeout,
            ) {
                Ok(kill_timer) => {
                    kill_timer.start();
                    circuit.kill_timer = Some(kill_timer);
                }
                Err(err) => {
                    warn!(circuit = %circuit.addr, error = %err, "kill timer unavailable");
                }
            }
            circuit.echo_timer.start(
                inner.circuit_notify(circuit_id, epoch, ContextInner::echo_expired),
                inner.config.echo_period,
            );

            for channel_id in &circuit.attached {
                if let Some(channel) = reg.channels.get(channel_id.0) {
                    circuit.outbound.push_back(Message::CreateChannel {
                        cid: channel_id.wire(),
                        name: channel.name.to_string(),
                    });
                }
            }
            fx.wake(circuit_id);
            info!(
                circuit = %circuit.addr,
                epoch,
                channels = circuit.attached.len(),
                "circuit connected"
            );
        });
    }

    /// 入站报文。过期 epoch 的报文被丢弃；其余报文刷新活动时间并推迟 Kill Timer。
    pub fn on_message(&self, circuit_id: CircuitId, epoch: u64, message: Message) {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| {
            let Some(cell) = reg.cell(circuit_id) else {
                return;
            };
            let mut guard = cell.inner.lock();
            let circuit = &mut *guard;
            if circuit.epoch != epoch || circuit.state != CircuitState::Connected {
                debug!(
                    circuit = %circuit.addr,
                    epoch,
                    message = message.name(),
                    "dropping message from stale epoch"
                );
                return;
            }
            circuit.last_activity = inner.now();
            if let Some(kill_timer) = &circuit.kill_timer {
                kill_timer.touch();
            }
            inner.dispatch_locked(reg, fx, circuit_id, circuit, message);
        });
    }

    /// 连接失败（包括握手失败与畸形帧）。协议类错误计入统计。
    pub fn on_circuit_failed(&self, circuit_id: CircuitId, epoch: u64, error: CaError) {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| {
            let Some(cell) = reg.cell(circuit_id) else {
                return;
            };
            let mut guard = cell.inner.lock();
            if guard.epoch != epoch || !guard.state.has_socket() {
                debug!(circuit = %guard.addr, epoch, error = %error, "ignoring failure of stale epoch");
                return;
            }
            if error.category() == ErrorCategory::Protocol {
                StatsCounters::bump(&inner.stats.protocol_errors);
            }
            warn!(circuit = %guard.addr, epoch, code = error.code(), error = %error, "circuit failed");
            inner.disconnect_locked(reg, fx, circuit_id, &mut guard, "i/o failure");
        });
    }

    /// 对端关闭连接。
    pub fn on_circuit_closed(&self, circuit_id: CircuitId, epoch: u64) {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| {
            let Some(cell) = reg.cell(circuit_id) else {
                return;
            };
            let mut guard = cell.inner.lock();
            if guard.epoch != epoch || !guard.state.has_socket() {
                return;
            }
            inner.disconnect_locked(reg, fx, circuit_id, &mut guard, "peer closed");
        });
    }

    /// 取走指定 epoch 的待发送报文；epoch 过期时返回空。
    pub fn take_outbound(&self, circuit_id: CircuitId, epoch: u64) -> Vec<Message> {
        let cell = self.inner.registry.lock().cell(circuit_id);
        let Some(cell) = cell else {
            return Vec::new();
        };
        let mut circuit = cell.inner.lock();
        if circuit.epoch != epoch || !circuit.state.has_socket() {
            return Vec::new();
        }
        circuit.outbound.drain(..).collect()
    }

    /// 立即执行一轮到期搜索，返回下一次到期时间。通常由内部定时器驱动。
    pub fn search_tick(&self) -> Option<Instant> {
        self.inner.search_round(self.inner.now())
    }

    /// 立即对空闲超过回声周期的已连接 Circuit 发送探测，返回探测的数量。
    pub fn echo_tick(&self) -> usize {
        let inner = &*self.inner;
        let now = inner.now();
        inner.with_registry(|reg, fx| {
            let mut echoed = 0;
            for (handle, cell) in reg.circuits.iter() {
                let mut guard = cell.inner.lock();
                if guard.state == CircuitState::Connected
                    && inner.echo_if_idle(fx, CircuitId(handle), &mut guard, now)
                {
                    echoed += 1;
                }
            }
            echoed
        })
    }

    /// 关闭上下文：销毁全部通道与 Circuit，之后的操作返回 `ShutDown`。
    pub fn shutdown(&self) {
        let inner = &*self.inner;
        inner.with_registry(|reg, fx| {
            if reg.shut_down {
                return;
            }
            reg.shut_down = true;
            for handle in reg.channels.handles() {
                let _ = inner.destroy_channel_locked(reg, fx, ChannelId(handle));
            }
            for handle in reg.circuits.handles() {
                if let Some(cell) = reg.circuits.get(handle).cloned() {
                    let mut guard = cell.inner.lock();
                    inner.destroy_circuit_locked(reg, fx, CircuitId(handle), &mut guard);
                }
            }
            inner.search_timer.cancel();
            info!("client context shut down");
        });
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.registry.lock().shut_down
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("channels", &self.channel_count())
            .field("circuits", &self.circuit_count())
            .finish()
    }
}

/// 上下文的弱引用，供 I/O 任务与定时器回调持有。
#[derive(Clone)]
pub struct WeakContext {
    inner: Weak<ContextInner>,
}

impl WeakContext {
    pub fn upgrade(&self) -> Option<ClientContext> {
        self.inner.upgrade().map(|inner| ClientContext { inner })
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContext")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
