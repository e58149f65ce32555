//! # 订阅登记表
//!
//! ## 核心意图（Why）
//! - 让“存活的监视器集合”与 Circuit 的起落无关：订阅在断线期间保留在登记表中，
//!   连接恢复后由登记表统一重新下发，上层无需重新订阅。
//!
//! ## 契约（What）
//! - `add` 只登记，是否立即下发由调用方根据通道状态决定；
//! - `on_reconnect` 按调用方给出的登记顺序重放，同一订阅在同一 Circuit epoch 内至多下发一次；
//! - `remove` 若订阅在当前 epoch 已下发，则先发出撤销报文再删除本地记录；通道未连接时
//!   只删除本地记录。
//!
//! ## 实现要点（How）
//! - 每个订阅记录最近一次下发所在的 `(circuit, epoch, subid)`，去重与撤销都以它为依据；
//! - 断线时调用方通过 `forget` 清空该记录，旧 subid 随 Circuit 在途表的清空而失效。

use std::fmt;
use std::sync::Arc;

use pvlink_core::wire::{DbrType, EventMask, Message};
use pvlink_core::{Arena, CaError, Result};

use crate::channel::resolve_count;
use crate::circuit::{Circuit, IoHandle, IoTarget};
use crate::ids::{ChannelId, CircuitId, SubscriptionId};
use crate::listener::MonitorListener;

/// 订阅参数。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscriptionSpec {
    pub data_type: DbrType,
    /// 0 表示使用通道的原生元素数。
    pub count: u32,
    pub mask: EventMask,
}

impl SubscriptionSpec {
    pub fn new(data_type: DbrType) -> Self {
        Self {
            data_type,
            count: 0,
            mask: EventMask::default(),
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn with_mask(mut self, mask: EventMask) -> Self {
        self.mask = mask;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Armed {
    pub(crate) circuit: CircuitId,
    pub(crate) epoch: u64,
    pub(crate) subid: IoHandle,
}

pub struct Subscription {
    pub(crate) channel: ChannelId,
    pub(crate) spec: SubscriptionSpec,
    pub(crate) listener: Arc<dyn MonitorListener>,
    pub(crate) armed: Option<Armed>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("spec", &self.spec)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

/// 下发订阅所需的连接上下文：已连接通道的 `sid` 与其所在的 Circuit。
pub(crate) struct WireLink<'a> {
    pub(crate) id: CircuitId,
    pub(crate) circuit: &'a mut Circuit,
    pub(crate) sid: u32,
    pub(crate) native_count: u32,
}

impl WireLink<'_> {
    fn owns(&self, armed: &Armed) -> bool {
        armed.circuit == self.id && armed.epoch == self.circuit.epoch
    }
}

pub(crate) struct SubscriptionRegistry {
    entries: Arena<Subscription>,
}

impl SubscriptionRegistry {
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            entries: Arena::with_limit(limit),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn add(
        &mut self,
        channel: ChannelId,
        spec: SubscriptionSpec,
        listener: Arc<dyn MonitorListener>,
    ) -> Result<SubscriptionId> {
        let limit = self.entries.limit();
        self.entries
            .try_insert(Subscription {
                channel,
                spec,
                listener,
                armed: None,
            })
            .map(SubscriptionId)
            .map_err(|_| CaError::ResourceExhausted {
                resource: "subscription",
                limit,
            })
    }

    pub(crate) fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.entries.get(id.0)
    }

    /// 在当前连接上下发订阅；已在同一 epoch 下发过时返回 `Ok(false)`。
    pub(crate) fn arm(&mut self, id: SubscriptionId, link: &mut WireLink<'_>) -> Result<bool> {
        let Some(subscription) = self.entries.get_mut(id.0) else {
            return Err(CaError::UnknownSubscription {
                handle: id.to_string(),
            });
        };
        if subscription.armed.as_ref().is_some_and(|armed| link.owns(armed)) {
            return Ok(false);
        }
        let subid = link.circuit.allocate_io(IoTarget::Monitor(id))?;
        link.circuit.enqueue(Message::EventAdd {
            sid: link.sid,
            subid: subid.to_wire(),
            data_type: subscription.spec.data_type,
            count: resolve_count(subscription.spec.count, link.native_count),
            mask: subscription.spec.mask,
        });
        subscription.armed = Some(Armed {
            circuit: link.id,
            epoch: link.circuit.epoch,
            subid,
        });
        Ok(true)
    }

    /// 通道进入 `Connected` 时调用：按 `order` 依次重放，返回实际下发的数量。
    ///
    /// 在途标识耗尽的订阅保持未下发状态并记录告警，不影响后续订阅。
    pub(crate) fn on_reconnect(&mut self, order: &[SubscriptionId], link: &mut WireLink<'_>) -> usize {
        let mut armed = 0;
        for id in order {
            match self.arm(*id, link) {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(subscription = %id, error = %err, "failed to replay subscription");
                }
            }
        }
        armed
    }

    /// 连接丢失：遗忘下发记录，不发出任何报文。
    ///
    /// Circuit 仍然存活时（单个通道被服务器撤销）一并归还其 subid。
    pub(crate) fn forget(&mut self, ids: &[SubscriptionId], mut circuit: Option<&mut Circuit>) {
        for id in ids {
            let Some(subscription) = self.entries.get_mut(id.0) else {
                continue;
            };
            if let (Some(armed), Some(circuit)) = (subscription.armed.take(), circuit.as_deref_mut()) {
                circuit.io.remove(armed.subid);
            }
        }
    }

    /// 注销订阅；若其在 `link` 所示连接上处于下发状态，则先发出撤销报文。
    ///
    /// 返回被移除的记录以及是否发出了撤销报文。
    pub(crate) fn remove(
        &mut self,
        id: SubscriptionId,
        link: Option<&mut WireLink<'_>>,
    ) -> Result<(Subscription, bool)> {
        let subscription = self
            .entries
            .remove(id.0)
            .ok_or_else(|| CaError::UnknownSubscription {
                handle: id.to_string(),
            })?;
        let mut cancelled = false;
        if let (Some(armed), Some(link)) = (subscription.armed, link) {
            if link.owns(&armed) {
                link.circuit.io.remove(armed.subid);
                link.circuit.enqueue(Message::EventCancel {
                    sid: link.sid,
                    subid: armed.subid.to_wire(),
                    data_type: subscription.spec.data_type,
                    count: resolve_count(subscription.spec.count, link.native_count),
                });
                cancelled = true;
            }
        }
        Ok((subscription, cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::NoopListener;
    use crate::channel::Channel;
    use crate::circuit::CircuitCell;
    use pvlink_core::{MockClock, SearchBackoff, TimerQueue};
    use std::time::Duration;

    struct Fixture {
        _queue: TimerQueue,
        cell: Arc<CircuitCell>,
        circuit_id: CircuitId,
        channel: ChannelId,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::new();
        let queue = TimerQueue::new(Arc::new(clock.clone()));
        let backoff = SearchBackoff::new(Duration::from_millis(500), Duration::from_secs(5));
        let mut circuit = Circuit::new(
            "127.0.0.1:5064".parse().expect("地址"),
            clock.now(),
            backoff.clone(),
            queue.create_timer().expect("定时器"),
            queue.create_timer().expect("定时器"),
        );
        circuit.epoch = 1;
        let cell = Arc::new(CircuitCell::new(circuit));

        let mut circuits: Arena<Arc<CircuitCell>> = Arena::default();
        let circuit_id = CircuitId(circuits.try_insert(Arc::clone(&cell)).ok().expect("容量充足"));
        let mut channels: Arena<Channel> = Arena::default();
        let channel = channels
            .try_insert(Channel::new(
                Arc::from("TEST:PV"),
                Arc::new(NoopListener),
                backoff,
                clock.now(),
            ))
            .ok()
            .expect("容量充足");
        Fixture {
            _queue: queue,
            cell,
            circuit_id,
            channel: ChannelId(channel),
        }
    }

    #[test]
    fn arming_twice_in_one_epoch_sends_once() {
        let fx = fixture();
        let mut registry = SubscriptionRegistry::with_limit(8);
        let id = registry
            .add(fx.channel, SubscriptionSpec::new(DbrType::Double), Arc::new(NoopListener))
            .expect("登记");
        let mut circuit = fx.cell.inner.lock();
        let mut link = WireLink {
            id: fx.circuit_id,
            circuit: &mut *circuit,
            sid: 7,
            native_count: 1,
        };
        assert_eq!(registry.on_reconnect(&[id, id], &mut link), 1);
        assert_eq!(link.circuit.outbound.len(), 1, "同一 epoch 内不得重复下发");
    }

    #[test]
    fn remove_cancels_only_when_armed_on_current_epoch() {
        let fx = fixture();
        let mut registry = SubscriptionRegistry::with_limit(8);
        let id = registry
            .add(fx.channel, SubscriptionSpec::new(DbrType::Long), Arc::new(NoopListener))
            .expect("登记");
        let mut circuit = fx.cell.inner.lock();
        {
            let mut link = WireLink {
                id: fx.circuit_id,
                circuit: &mut *circuit,
                sid: 7,
                native_count: 1,
            };
            assert!(registry.arm(id, &mut link).expect("下发"));
        }
        circuit.outbound.clear();
        circuit.epoch += 1;

        let mut link = WireLink {
            id: fx.circuit_id,
            circuit: &mut *circuit,
            sid: 9,
            native_count: 1,
        };
        let (_, cancelled) = registry.remove(id, Some(&mut link)).expect("注销");
        assert!(!cancelled, "上一 epoch 的下发记录不得触发撤销报文");
        assert!(link.circuit.outbound.is_empty());

        let err = registry.remove(id, None).expect_err("重复注销属于误用");
        assert!(err.is_misuse());
    }

    #[test]
    fn debug_output_shows_arming_without_listener() {
        let fx = fixture();
        let mut registry = SubscriptionRegistry::with_limit(8);
        let id = registry
            .add(fx.channel, SubscriptionSpec::new(DbrType::Long), Arc::new(NoopListener))
            .expect("登记");
        let idle = format!("{:?}", registry.get(id).expect("已登记"));
        assert!(idle.starts_with("Subscription"), "{idle}");
        assert!(idle.contains("armed: None"), "{idle}");

        let mut circuit = fx.cell.inner.lock();
        let mut link = WireLink {
            id: fx.circuit_id,
            circuit: &mut *circuit,
            sid: 3,
            native_count: 1,
        };
        assert!(registry.arm(id, &mut link).expect("下发"));
        let armed = format!("{:?}", registry.get(id).expect("已登记"));
        assert!(armed.contains("armed: Some"), "{armed}");
        assert!(!armed.contains("listener"), "监听器不参与调试输出");
    }
}
