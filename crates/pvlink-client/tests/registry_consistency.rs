//! 注册表双向引用的一致性。
//!
//! # 教案式说明
//! - **Why**：通道与 Circuit 互相引用，任何一次断线、重连、销毁或过期事件都可能让两侧失配；
//!   失配的后果是回调丢失或向错误的 Circuit 发报文；
//! - **How**：用 `proptest` 生成随机操作序列（创建、销毁、搜索应答、握手、断线、过期握手、
//!   推进时间），每一步之后只通过公开查询接口核对不变量；
//! - **What**：
//!   - 通道报告的 Circuit 一定在该 Circuit 的挂接列表中，反之亦然；
//!   - 只有 `Connecting`/`Connected` 的通道挂接在 Circuit 上；
//!   - 已连接通道所在的 Circuit 处于 `Connected`；
//!   - `Disconnected` 只是瞬态，永远不会被外部观察到。

mod support;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use pvlink_client::{ChannelId, ChannelState, CircuitState, NoopListener, SubscriptionSpec};
use pvlink_core::wire::{DbrType, Message};
use support::{Harness, server};

const SERVERS: [u16; 2] = [5064, 5065];

#[derive(Clone, Debug)]
enum Op {
    Create,
    Destroy(usize),
    Reply { channel: usize, server: usize },
    Handshake(usize),
    Close(usize),
    StaleHandshake(usize),
    Subscribe(usize),
    Advance(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => Just(Op::Create),
        1 => (0usize..8).prop_map(Op::Destroy),
        3 => (0usize..8, 0usize..SERVERS.len())
            .prop_map(|(channel, server)| Op::Reply { channel, server }),
        2 => (0usize..SERVERS.len()).prop_map(Op::Handshake),
        1 => (0usize..SERVERS.len()).prop_map(Op::Close),
        1 => (0usize..SERVERS.len()).prop_map(Op::StaleHandshake),
        1 => (0usize..8).prop_map(Op::Subscribe),
        1 => (50u64..3_000).prop_map(Op::Advance),
    ]
}

struct Model {
    harness: Harness,
    live: Vec<ChannelId>,
    created: usize,
}

impl Model {
    fn new() -> Self {
        Self {
            harness: Harness::new(),
            live: Vec::new(),
            created: 0,
        }
    }

    fn pick(&self, index: usize) -> Option<ChannelId> {
        if self.live.is_empty() {
            None
        } else {
            Some(self.live[index % self.live.len()])
        }
    }

    fn apply(&mut self, op: &Op) {
        let h = &self.harness;
        match op {
            Op::Create => {
                let name = format!("RC:{}", self.created);
                self.created += 1;
                let channel = h
                    .context
                    .create_channel(&name, Arc::new(NoopListener))
                    .expect("容量充足");
                self.live.push(channel);
                h.settle();
            }
            Op::Destroy(index) => {
                if let Some(channel) = self.pick(*index) {
                    h.context.destroy_channel(channel).expect("句柄有效");
                    self.live.retain(|live| *live != channel);
                }
            }
            Op::Reply { channel, server: which } => {
                if let Some(channel) = self.pick(*channel) {
                    h.reply(channel, server(SERVERS[*which]));
                }
            }
            Op::Handshake(which) => {
                let addr = server(SERVERS[*which]);
                if let Some(link) = h.links().into_iter().rev().find(|link| link.addr() == addr) {
                    link.connected();
                    for message in link.take_outbound() {
                        if let Message::CreateChannel { cid, .. } = message {
                            link.message(Message::CreateChannelReply {
                                cid,
                                sid: cid ^ 0x5a5a,
                                native_type: DbrType::Double,
                                element_count: 1,
                            });
                        }
                    }
                    link.take_outbound();
                }
            }
            Op::Close(which) => {
                let addr = server(SERVERS[*which]);
                if let Some(link) = h.links().into_iter().rev().find(|link| link.addr() == addr) {
                    link.closed();
                }
            }
            Op::StaleHandshake(which) => {
                let addr = server(SERVERS[*which]);
                if let Some(link) = h.links().into_iter().find(|link| link.addr() == addr) {
                    link.connected();
                    link.message(Message::Echo);
                }
            }
            Op::Subscribe(index) => {
                if let Some(channel) = self.pick(*index) {
                    h.context
                        .subscribe(
                            channel,
                            SubscriptionSpec::new(DbrType::Double),
                            Arc::new(NoopListener),
                        )
                        .expect("句柄有效");
                }
            }
            Op::Advance(ms) => h.advance_in_steps(Duration::from_millis(*ms), Duration::from_millis(50)),
        }
    }

    fn check(&self) -> Result<(), TestCaseError> {
        let context = &self.harness.context;
        prop_assert_eq!(context.channel_count(), self.live.len());

        for channel in &self.live {
            let state = context.connection_state(*channel).expect("存活通道");
            let circuit = context.channel_circuit(*channel).expect("存活通道");
            let attached = matches!(state, ChannelState::Connecting | ChannelState::Connected);
            prop_assert_eq!(circuit.is_some(), attached, "{:?} 处于 {:?}", channel, state);
            if let Some(addr) = circuit {
                prop_assert!(
                    context.circuit_channels(addr).contains(channel),
                    "{:?} 指向 {} 但不在其挂接列表中",
                    channel,
                    addr
                );
                if state == ChannelState::Connected {
                    prop_assert_eq!(context.circuit_state(addr), Some(CircuitState::Connected));
                }
            }
        }

        for info in context.circuits() {
            prop_assert_ne!(info.state, CircuitState::Disconnected);
            let attached = context.circuit_channels(info.addr);
            prop_assert_eq!(attached.len(), info.attached);
            let unique: BTreeSet<_> = attached.iter().copied().collect();
            prop_assert_eq!(unique.len(), attached.len(), "挂接列表不得重复");
            for channel in attached {
                prop_assert_eq!(
                    context.channel_circuit(channel).ok().flatten(),
                    Some(info.addr),
                    "挂接在 {} 上的 {:?} 必须反向指向它",
                    info.addr,
                    channel
                );
            }
            if info.state == CircuitState::Searching {
                prop_assert_eq!(info.attached, 0, "等待重连的 Circuit 不挂接通道");
                prop_assert!(info.wanted > 0, "无人等待的 Circuit 必须被销毁");
            }
        }
        Ok(())
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn back_references_stay_consistent(ops in prop::collection::vec(op(), 1..60)) {
        let mut model = Model::new();
        for op in &ops {
            model.apply(op);
            model.check()?;
        }
        model.harness.context.shutdown();
        prop_assert_eq!(model.harness.context.circuit_count(), 0);
    }
}
