//! 订阅在断线重连后的重放。
//!
//! # 教案式说明
//! - **Why**：上层只登记一次订阅，之后的每一次重连都必须恰好重新下发一次，既不能遗漏也不能重复；
//! - **How**：以 [`Harness`] 扮演服务器，逐 epoch 统计 `EventAdd` 与 `EventCancel`；
//! - **What**：覆盖登记顺序重放、下发与撤销配对、断线期间注销、销毁时的撤销以及数据回调中的注销。

mod support;

use std::sync::Arc;

use parking_lot::Mutex;
use pvlink_client::{CaError, NoopListener, SubscriptionId, SubscriptionSpec};
use pvlink_core::wire::{DbrType, Message, Reading, Value, status};
use support::{Harness, event_adds, event_cancels, server};

fn data_types(messages: &[Message]) -> Vec<DbrType> {
    messages
        .iter()
        .filter_map(|message| match message {
            Message::EventAdd { data_type, .. } => Some(*data_type),
            _ => None,
        })
        .collect()
}

/// 场景 B：两个订阅在重连后按登记顺序各下发一次。
#[test]
fn subscriptions_replay_in_registration_order() {
    let h = Harness::new();
    let (channel, first) = h.connected_channel("SR:X", server(5064));
    h.context
        .subscribe(channel, SubscriptionSpec::new(DbrType::Double), Arc::new(NoopListener))
        .expect("订阅一");
    h.context
        .subscribe(channel, SubscriptionSpec::new(DbrType::Long), Arc::new(NoopListener))
        .expect("订阅二");
    assert_eq!(data_types(&first.take_outbound()), vec![DbrType::Double, DbrType::Long]);

    first.closed();
    assert_eq!(h.context.subscription_count(), 2, "断线不删除订阅");

    h.reply(channel, server(5064));
    let second = h.link_for(server(5064));
    let replay = h.accept(&second, DbrType::Double, 1);
    assert_eq!(data_types(&replay), vec![DbrType::Double, DbrType::Long]);
    assert_eq!(h.context.stats().subscriptions_armed, 4);
}

/// 每个 epoch 内：下发恰好一次，注销时撤销的正是该 epoch 下发的标识。
#[test]
fn each_epoch_pairs_one_add_with_one_cancel() {
    let h = Harness::new();
    let (channel, first) = h.connected_channel("SR:PAIR", server(5064));
    let subscription = h
        .context
        .subscribe(channel, SubscriptionSpec::new(DbrType::Double), Arc::new(NoopListener))
        .expect("订阅");
    let first_epoch = first.take_outbound();
    assert_eq!(event_adds(&first_epoch).len(), 1);

    first.closed();
    h.reply(channel, server(5064));
    let second = h.link_for(server(5064));
    let mut second_epoch = h.accept(&second, DbrType::Double, 1);
    h.context.unsubscribe(subscription).expect("注销");
    second_epoch.extend(second.take_outbound());

    let adds = event_adds(&second_epoch);
    let cancels = event_cancels(&second_epoch);
    assert_eq!(adds.len(), 1, "重连后恰好重放一次");
    assert_eq!(cancels, adds, "撤销必须引用同一 epoch 下发的标识");
    assert_eq!(h.context.subscription_count(), 0);
}

/// 未连接时登记的订阅在首次连接时下发一次，更新被投递给监听器。
#[test]
fn subscription_registered_before_connect_is_armed_once() {
    let h = Harness::new();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    let channel = h
        .context
        .create_channel("SR:EARLY", Arc::new(NoopListener))
        .expect("创建通道");
    h.context
        .subscribe(
            channel,
            SubscriptionSpec::new(DbrType::Double),
            Arc::new(move |_: SubscriptionId, reading: &Reading| {
                sink.lock().push(reading.value.clone());
            }),
        )
        .expect("订阅");
    h.settle();
    h.reply(channel, server(5064));
    let link = h.link_for(server(5064));
    let sent = h.accept(&link, DbrType::Double, 1);
    let subids = event_adds(&sent);
    assert_eq!(subids.len(), 1);

    link.message(Message::EventData {
        subid: subids[0],
        status: status::NORMAL,
        data_type: DbrType::Double,
        reading: Some(Reading::new(Value::Doubles(vec![7.5]))),
    });
    assert_eq!(*updates.lock(), vec![Value::Doubles(vec![7.5])]);
}

/// 断线期间注销：只删除本地记录，重连后不再下发。
#[test]
fn unsubscribe_while_disconnected_is_local() {
    let h = Harness::new();
    let (channel, first) = h.connected_channel("SR:GONE", server(5064));
    let kept = h
        .context
        .subscribe(channel, SubscriptionSpec::new(DbrType::Double), Arc::new(NoopListener))
        .expect("订阅");
    let dropped = h
        .context
        .subscribe(channel, SubscriptionSpec::new(DbrType::Long), Arc::new(NoopListener))
        .expect("订阅");
    first.take_outbound();
    first.closed();

    h.context.unsubscribe(dropped).expect("注销");
    assert_eq!(h.context.stats().subscriptions_cancelled, 0, "未连接时不发撤销报文");
    let again = h.context.unsubscribe(dropped).expect_err("重复注销");
    assert!(matches!(again, CaError::UnknownSubscription { .. }));
    assert!(again.is_misuse());

    h.reply(channel, server(5064));
    let second = h.link_for(server(5064));
    let replay = h.accept(&second, DbrType::Double, 1);
    assert_eq!(data_types(&replay), vec![DbrType::Double]);
    h.context.unsubscribe(kept).expect("注销");
}

/// 旧 epoch 的订阅更新不会投递。
#[test]
fn updates_from_previous_epoch_are_dropped() {
    let h = Harness::new();
    let updates = Arc::new(Mutex::new(0usize));
    let sink = Arc::clone(&updates);
    let (channel, first) = h.connected_channel("SR:OLD", server(5064));
    h.context
        .subscribe(
            channel,
            SubscriptionSpec::new(DbrType::Double),
            Arc::new(move |_: SubscriptionId, _: &Reading| *sink.lock() += 1),
        )
        .expect("订阅");
    let old_subid = event_adds(&first.take_outbound())[0];
    first.closed();
    first.message(Message::EventData {
        subid: old_subid,
        status: status::NORMAL,
        data_type: DbrType::Double,
        reading: Some(Reading::new(Value::Doubles(vec![1.0]))),
    });
    assert_eq!(*updates.lock(), 0);
}

/// 销毁仍在已连接 Circuit 上的通道时，先撤销其全部订阅再清除通道。
#[test]
fn destroy_cancels_armed_subscriptions_first() {
    let h = Harness::new();
    let (keeper, link) = h.connected_channel("SR:KEEPER", server(5064));
    let doomed = h
        .context
        .create_channel("SR:DOOMED", Arc::new(NoopListener))
        .expect("创建通道");
    h.settle();
    h.reply(doomed, server(5064));
    for message in link.take_outbound() {
        if let Message::CreateChannel { cid, .. } = message {
            link.message(Message::CreateChannelReply {
                cid,
                sid: 77,
                native_type: DbrType::Double,
                element_count: 1,
            });
        }
    }
    for data_type in [DbrType::Double, DbrType::Long] {
        h.context
            .subscribe(doomed, SubscriptionSpec::new(data_type), Arc::new(NoopListener))
            .expect("订阅");
    }
    let armed = event_adds(&link.take_outbound());
    assert_eq!(armed.len(), 2);

    h.context.destroy_channel(doomed).expect("销毁");
    let teardown = link.take_outbound();
    assert_eq!(event_cancels(&teardown), armed);
    assert!(matches!(teardown.last(), Some(Message::ClearChannel { sid: 77, .. })));
    assert_eq!(h.context.subscription_count(), 0);
    assert_eq!(h.context.stats().subscriptions_cancelled, 2);
    assert_eq!(h.context.circuit_channels(server(5064)), vec![keeper]);
}

/// 数据回调中注销自身订阅：撤销报文照常发出，之后到达的更新不再投递。
#[test]
fn data_callback_may_unsubscribe_itself() {
    let h = Harness::new();
    let (channel, link) = h.connected_channel("SR:ONCE", server(5064));
    let weak = h.context.downgrade();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&delivered);
    h.context
        .subscribe(
            channel,
            SubscriptionSpec::new(DbrType::Double),
            Arc::new(move |subscription: SubscriptionId, reading: &Reading| {
                record.lock().push(reading.value.clone());
                if let Some(context) = weak.upgrade() {
                    context.unsubscribe(subscription).expect("回调中注销");
                }
            }),
        )
        .expect("订阅");
    let subid = event_adds(&link.take_outbound())[0];

    for value in [1.0, 2.0] {
        link.message(Message::EventData {
            subid,
            status: status::NORMAL,
            data_type: DbrType::Double,
            reading: Some(Reading::new(Value::Doubles(vec![value]))),
        });
    }
    assert_eq!(*delivered.lock(), vec![Value::Doubles(vec![1.0])]);
    assert_eq!(event_cancels(&link.take_outbound()), vec![subid]);
    assert_eq!(h.context.subscription_count(), 0);
    assert_eq!(h.context.stats().subscriptions_cancelled, 1);
}
