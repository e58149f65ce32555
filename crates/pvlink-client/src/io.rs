//! 引擎与 I/O 层之间的接缝。
//!
//! # 教案式说明
//! - **意图 (Why)**：Circuit 状态机本身不做网络 I/O。它通过 [`Connector`] 要求打开、唤醒
//!   或关闭连接，通过 [`SearchTransport`] 发出名称查询；I/O 层则经由 [`CircuitLink`]
//!   把连接结果与入站报文交还给上下文。生产实现基于 Tokio，测试注入记录型实现。
//! - **契约 (What)**：
//!   - 接缝方法都在引擎释放内部锁之后调用，实现可以同步回调上下文；
//!   - 每个 [`CircuitLink`] 绑定一个 `(circuit, epoch)`，过期 epoch 上报的事件被上下文丢弃；
//!   - 实现不得阻塞调用线程。

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use pvlink_core::CaError;
use pvlink_core::wire::Message;

use crate::circuit::CircuitCell;
use crate::context::WeakContext;
use crate::ids::CircuitId;

/// 连接生命周期的执行者。
pub trait Connector: Send + Sync + 'static {
    /// 为 `link` 所示的 epoch 建立连接并完成握手。
    fn open(&self, link: CircuitLink);

    /// 发送队列有新报文。
    fn wake(&self, circuit: CircuitId);

    /// 关闭指定 epoch 的连接；epoch 不匹配时忽略。
    fn close(&self, circuit: CircuitId, epoch: u64);
}

/// 一条名称查询。`search_id` 即通道的线上标识。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchRequest {
    pub search_id: u32,
    pub name: Arc<str>,
}

/// 名称查询的发送端。
pub trait SearchTransport: Send + Sync + 'static {
    fn send(&self, requests: &[SearchRequest]);
}

/// I/O 层持有的连接凭据。
#[derive(Clone)]
pub struct CircuitLink {
    context: WeakContext,
    circuit: CircuitId,
    epoch: u64,
    addr: SocketAddr,
    cell: Arc<CircuitCell>,
}

impl CircuitLink {
    pub(crate) fn new(
        context: WeakContext,
        circuit: CircuitId,
        epoch: u64,
        cell: Arc<CircuitCell>,
    ) -> Self {
        Self {
            context,
            circuit,
            epoch,
            addr: cell.addr,
            cell,
        }
    }

    pub fn circuit(&self) -> CircuitId {
        self.circuit
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// 本凭据对应的 epoch 是否仍持有套接字。
    pub fn is_current(&self) -> bool {
        let circuit = self.cell.inner.lock();
        circuit.epoch == self.epoch && circuit.state.has_socket()
    }

    /// 取走待发送的报文；epoch 已过期时返回空。
    ///
    /// 只获取逐 Circuit 锁，不触碰全局注册表锁。
    pub fn take_outbound(&self) -> Vec<Message> {
        let mut circuit = self.cell.inner.lock();
        if circuit.epoch != self.epoch || !circuit.state.has_socket() {
            return Vec::new();
        }
        circuit.outbound.drain(..).collect()
    }

    /// 握手完成。
    pub fn connected(&self) {
        if let Some(context) = self.context.upgrade() {
            context.on_circuit_connected(self.circuit, self.epoch);
        }
    }

    /// 收到一条入站报文。
    pub fn message(&self, message: Message) {
        if let Some(context) = self.context.upgrade() {
            context.on_message(self.circuit, self.epoch, message);
        }
    }

    /// 连接或握手失败、读写出错或收到畸形帧。
    pub fn failed(&self, error: CaError) {
        if let Some(context) = self.context.upgrade() {
            context.on_circuit_failed(self.circuit, self.epoch, error);
        }
    }

    /// 对端正常关闭。
    pub fn closed(&self) {
        if let Some(context) = self.context.upgrade() {
            context.on_circuit_closed(self.circuit, self.epoch);
        }
    }
}

impl fmt::Debug for CircuitLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitLink")
            .field("circuit", &self.circuit)
            .field("epoch", &self.epoch)
            .field("addr", &self.addr)
            .finish()
    }
}
