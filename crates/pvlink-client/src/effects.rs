//! 锁外副作用。
//!
//! 注册表操作在持锁期间只把 I/O 请求与应用回调记录到 [`Effects`]，释放全部内部锁之后
//! 再统一执行。回调因此可以重入上下文而不会死锁。

use std::sync::Arc;

use pvlink_core::Result;
use pvlink_core::wire::Reading;

use crate::ids::{ChannelId, CircuitId, RequestId, SubscriptionId};
use crate::io::{CircuitLink, SearchRequest};
use crate::listener::{ChannelListener, GetCallback, MonitorListener, PutCallback};

pub(crate) enum Action {
    Open(CircuitLink),
    Wake(CircuitId),
    Close { circuit: CircuitId, epoch: u64 },
    Search(Vec<SearchRequest>),
}

pub(crate) enum Callback {
    Connection {
        listener: Arc<dyn ChannelListener>,
        channel: ChannelId,
        connected: bool,
    },
    Data {
        listener: Arc<dyn MonitorListener>,
        subscription: SubscriptionId,
        reading: Reading,
    },
    Get {
        done: GetCallback,
        request: RequestId,
        result: Result<Reading>,
    },
    Put {
        done: PutCallback,
        request: RequestId,
        result: Result<()>,
    },
}

impl Callback {
    pub(crate) fn invoke(self) {
        match self {
            Callback::Connection {
                listener,
                channel,
                connected,
            } => listener.on_connection_change(channel, connected),
            Callback::Data {
                listener,
                subscription,
                reading,
            } => listener.on_data(subscription, &reading),
            Callback::Get {
                done,
                request,
                result,
            } => done(request, result),
            Callback::Put {
                done,
                request,
                result,
            } => done(request, result),
        }
    }
}

#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) actions: Vec<Action>,
    pub(crate) callbacks: Vec<Callback>,
}

impl Effects {
    pub(crate) fn open(&mut self, link: CircuitLink) {
        self.actions.push(Action::Open(link));
    }

    /// 同一 Circuit 的多次唤醒合并为一次。
    pub(crate) fn wake(&mut self, circuit: CircuitId) {
        let queued = self
            .actions
            .iter()
            .any(|action| matches!(action, Action::Wake(id) if *id == circuit));
        if !queued {
            self.actions.push(Action::Wake(circuit));
        }
    }

    pub(crate) fn close(&mut self, circuit: CircuitId, epoch: u64) {
        self.actions.push(Action::Close { circuit, epoch });
    }

    pub(crate) fn search(&mut self, requests: Vec<SearchRequest>) {
        if !requests.is_empty() {
            self.actions.push(Action::Search(requests));
        }
    }

    pub(crate) fn callback(&mut self, callback: Callback) {
        self.callbacks.push(callback);
    }

    pub(crate) fn callback_opt(&mut self, callback: Option<Callback>) {
        if let Some(callback) = callback {
            self.callbacks.push(callback);
        }
    }
}
