//! Channel 与一次性请求的记录。
//!
//! # 教案式说明
//! - **状态语义 (What)**：
//!   - `Searching`：未绑定任何 Circuit，按通道自身的退避周期发送名称查询；
//!   - `Unconnected`：原 Circuit 已断开，通道挂在该 Circuit 的等待列表上，由 Circuit 的
//!     退避周期统一重搜；
//!   - `Connecting`：已绑定 Circuit，等待创建应答；
//!   - `Connected`：服务器分配的 `sid` 有效，可以收发请求。
//! - **不变量**：`circuit` 非空当且仅当状态为 `Connecting` 或 `Connected`；`rebind` 非空
//!   当且仅当状态为 `Unconnected`；`sid` 只在 `Connected` 时有效。

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use pvlink_core::wire::{ControlInfo, DbrType, Reading, Value};
use pvlink_core::{CaError, Result, SearchBackoff};

use crate::circuit::IoHandle;
use crate::effects::Callback;
use crate::ids::{ChannelId, CircuitId, RequestId, SubscriptionId};
use crate::listener::{ChannelListener, GetCallback, PutCallback};

/// 通道连接状态。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChannelState {
    Unconnected,
    Searching,
    Connecting,
    Connected,
}

impl ChannelState {
    pub fn is_connected(self) -> bool {
        self == ChannelState::Connected
    }
}

pub struct Channel {
    pub(crate) name: Arc<str>,
    pub(crate) state: ChannelState,
    pub(crate) circuit: Option<CircuitId>,
    pub(crate) rebind: Option<CircuitId>,
    pub(crate) sid: Option<u32>,
    pub(crate) native: Option<(DbrType, u32)>,
    pub(crate) server: Option<SocketAddr>,
    /// 本次连接取得的控制元数据；每次断开都清空。
    pub(crate) metadata: Option<ControlInfo>,
    pub(crate) listener: Arc<dyn ChannelListener>,
    /// 按登记顺序排列，重连后按此顺序重放。
    pub(crate) subscriptions: Vec<SubscriptionId>,
    /// 尚未发出的请求，连接建立后按提交顺序发送。
    pub(crate) pending: VecDeque<RequestId>,
    /// 已在当前 epoch 发出、等待应答的请求。
    pub(crate) in_flight: BTreeSet<RequestId>,
    pub(crate) backoff: SearchBackoff,
    pub(crate) next_search: Option<Instant>,
    pub(crate) connections: u64,
}

impl Channel {
    pub(crate) fn new(
        name: Arc<str>,
        listener: Arc<dyn ChannelListener>,
        backoff: SearchBackoff,
        now: Instant,
    ) -> Self {
        Self {
            name,
            state: ChannelState::Searching,
            circuit: None,
            rebind: None,
            sid: None,
            native: None,
            server: None,
            metadata: None,
            listener,
            subscriptions: Vec::new(),
            pending: VecDeque::new(),
            in_flight: BTreeSet::new(),
            backoff,
            next_search: Some(now),
            connections: 0,
        }
    }

    /// 进入 `Connecting` 并建立双向引用中通道一侧的指向。
    pub(crate) fn attach(&mut self, circuit: CircuitId) {
        self.state = ChannelState::Connecting;
        self.circuit = Some(circuit);
        self.rebind = None;
        self.next_search = None;
    }

    /// 断开与 Circuit 的绑定，清除仅在连接期间有效的字段。
    pub(crate) fn detach(&mut self, state: ChannelState, rebind: Option<CircuitId>) {
        debug_assert!(!matches!(
            state,
            ChannelState::Connecting | ChannelState::Connected
        ));
        self.state = state;
        self.circuit = None;
        self.rebind = rebind;
        self.sid = None;
        self.native = None;
        self.metadata = None;
    }

    pub(crate) fn not_connected(&self) -> CaError {
        CaError::NotConnected {
            name: self.name.to_string(),
        }
    }

    pub(crate) fn info(&self) -> Result<ChannelInfo> {
        match (self.state, self.native, self.server) {
            (ChannelState::Connected, Some((native_type, element_count)), Some(server)) => {
                Ok(ChannelInfo {
                    name: self.name.to_string(),
                    state: self.state,
                    native_type,
                    element_count,
                    server,
                    connections: self.connections,
                    metadata: self.metadata.clone(),
                })
            }
            _ => Err(self.not_connected()),
        }
    }
}

/// 已连接通道的元数据快照。
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub state: ChannelState,
    pub native_type: DbrType,
    pub element_count: u32,
    pub server: SocketAddr,
    /// 通道累计进入 `Connected` 的次数。
    pub connections: u64,
    /// 工程单位、精度与各级上下限；未开启 `fetch_metadata`、原生类型非数值或应答
    /// 尚未到达时为 `None`。
    pub metadata: Option<ControlInfo>,
}

/// 只有数值类型的通道才有单位与上下限。
pub(crate) fn has_control_metadata(native_type: DbrType) -> bool {
    !matches!(native_type, DbrType::String | DbrType::Enum)
}

pub(crate) enum RequestKind {
    Get {
        data_type: DbrType,
        count: u32,
        done: Option<GetCallback>,
    },
    Put {
        value: Value,
        done: Option<PutCallback>,
    },
}

impl RequestKind {
    /// 取出完成闭包并与结果配对；闭包已被放弃时返回 `None`。
    ///
    /// `Ok(None)` 表示服务器以成功状态应答但未携带数据，对 get 而言是协议错误。
    pub(crate) fn settle(
        &mut self,
        request: RequestId,
        outcome: Result<Option<Reading>>,
    ) -> Option<Callback> {
        match self {
            RequestKind::Get { done, .. } => {
                let done = done.take()?;
                let result = match outcome {
                    Ok(Some(reading)) => Ok(reading),
                    Ok(None) => Err(CaError::protocol(None, "read reply without data")),
                    Err(err) => Err(err),
                };
                Some(Callback::Get {
                    done,
                    request,
                    result,
                })
            }
            RequestKind::Put { done, .. } => {
                let done = done.take()?;
                Some(Callback::Put {
                    done,
                    request,
                    result: outcome.map(|_| ()),
                })
            }
        }
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        match self {
            RequestKind::Get { done, .. } => done.is_none(),
            RequestKind::Put { done, .. } => done.is_none(),
        }
    }

    pub(crate) fn operation(&self) -> &'static str {
        match self {
            RequestKind::Get { .. } => "get",
            RequestKind::Put { .. } => "put",
        }
    }
}

pub struct Request {
    pub(crate) channel: ChannelId,
    pub(crate) kind: RequestKind,
    /// 已发出时的在途标识；`None` 表示仍在通道的待发队列中。
    pub(crate) ioid: Option<IoHandle>,
}

impl Request {
    pub(crate) fn new(channel: ChannelId, kind: RequestKind) -> Self {
        Self {
            channel,
            kind,
            ioid: None,
        }
    }
}

/// 元素数为 0 表示使用通道的原生元素数。
pub(crate) fn resolve_count(requested: u32, native: u32) -> u32 {
    if requested == 0 { native } else { requested }
}
