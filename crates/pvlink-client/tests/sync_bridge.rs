//! 同步桥的超时与迟到应答。
//!
//! # 教案式说明
//! - **Why**：阻塞调用在超时后已经返回，迟到的应答既不能投递给后续等待者，也不能写入已经
//!   失效的等待槽位；
//! - **How**：响应方在另一个线程（或 Tokio 任务）中扮演服务器，按真实时间延迟应答；
//! - **What**：覆盖按时完成、超时后迟到、服务器拒绝、连接超时与 `async` 变体。

mod support;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pvlink_client::{CaError, CircuitLink, SyncBridge};
use pvlink_core::wire::{DbrType, Message, Reading, Value, status};
use support::{Harness, server};

/// 轮询待发报文直到出现读取请求，返回其关联标识。
fn wait_for_read(link: &CircuitLink) -> u32 {
    for _ in 0..400 {
        let found = link.take_outbound().into_iter().find_map(|message| match message {
            Message::ReadNotify { ioid, .. } => Some(ioid),
            _ => None,
        });
        if let Some(ioid) = found {
            return ioid;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("客户端未发出读取请求");
}

fn read_reply(ioid: u32, value: f64) -> Message {
    Message::ReadNotifyReply {
        ioid,
        status: status::NORMAL,
        data_type: DbrType::Double,
        reading: Some(Reading::new(Value::Doubles(vec![value]))),
    }
}

/// 应答在超时前到达时正常返回。
#[test]
fn get_returns_reply_within_timeout() {
    let h = Harness::new();
    let (channel, link) = h.connected_channel("SB:FAST", server(5064));
    let bridge = SyncBridge::new(h.context.clone());
    let responder = thread::spawn(move || {
        let ioid = wait_for_read(&link);
        link.message(read_reply(ioid, 42.0));
    });

    let reading = bridge
        .get(channel, DbrType::Double, 1, Duration::from_secs(5))
        .expect("按时应答");
    assert_eq!(reading.value, Value::Doubles(vec![42.0]));
    responder.join().expect("响应线程");
}

/// 场景 E：超时 1 秒、应答 1.2 秒到达。调用方得到 `Timeout`，迟到应答计为过期且不投递。
#[test]
fn late_reply_after_timeout_is_discarded() {
    let h = Harness::new();
    let (channel, link) = h.connected_channel("SB:SLOW", server(5064));
    let bridge = SyncBridge::new(h.context.clone());
    let server_link = link.clone();
    let responder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(1200));
        let ioid = wait_for_read(&server_link);
        server_link.message(read_reply(ioid, 1.0));
    });

    let started = Instant::now();
    let result = bridge.get(channel, DbrType::Double, 1, Duration::from_secs(1));
    let elapsed = started.elapsed();
    assert!(matches!(result, Err(CaError::Timeout { operation: "get", .. })));
    assert!(elapsed >= Duration::from_secs(1), "不得早于超时返回: {elapsed:?}");
    responder.join().expect("响应线程");
    assert_eq!(h.context.stats().stale_completions, 1);

    // 后续请求只收到属于自己的应答。
    let responder = thread::spawn(move || {
        let ioid = wait_for_read(&link);
        link.message(read_reply(ioid, 2.0));
    });
    let reading = bridge
        .get(channel, DbrType::Double, 1, Duration::from_secs(5))
        .expect("按时应答");
    assert_eq!(reading.value, Value::Doubles(vec![2.0]));
    responder.join().expect("响应线程");
    assert_eq!(h.context.stats().stale_completions, 1);
}

/// 服务器拒绝写入时返回 `Rejected`。
#[test]
fn put_surfaces_rejection() {
    let h = Harness::new();
    let (channel, link) = h.connected_channel("SB:LOCKED", server(5064));
    let bridge = SyncBridge::new(h.context.clone());
    let responder = thread::spawn(move || {
        for _ in 0..400 {
            let found = link.take_outbound().into_iter().find_map(|message| match message {
                Message::WriteNotify { ioid, .. } => Some(ioid),
                _ => None,
            });
            if let Some(ioid) = found {
                link.message(Message::WriteNotifyReply {
                    ioid,
                    status: status::PUT_FAIL,
                });
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("客户端未发出写入请求");
    });
    let err = bridge
        .put(channel, Value::Doubles(vec![3.0]), Duration::from_secs(5))
        .expect_err("服务器拒绝");
    assert!(matches!(err, CaError::Rejected { status: status::PUT_FAIL, .. }));
    responder.join().expect("响应线程");
}

/// 阻塞式连接：另一线程驱动定时器并扮演服务器完成搜索与握手。
#[test]
fn connect_blocks_until_channel_is_ready() {
    let h = Harness::new();
    let bridge = SyncBridge::new(h.context.clone());
    let timers = h.timers.clone();
    let clock = h.clock.clone();
    let search = Arc::clone(&h.search);
    let connector = Arc::clone(&h.connector);
    let context = h.context.clone();
    let responder = thread::spawn(move || {
        let mut request = None;
        for _ in 0..400 {
            timers.process(clock.now());
            request = search.sent.lock().first().cloned();
            if request.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        let request = request.expect("客户端未发出搜索");
        context.on_search_reply(request.search_id, server(5064));
        let link = connector.links.lock().last().cloned().expect("已请求建连");
        link.connected();
        for message in link.take_outbound() {
            if let Message::CreateChannel { cid, .. } = message {
                link.message(Message::CreateChannelReply {
                    cid,
                    sid: 5,
                    native_type: DbrType::Double,
                    element_count: 1,
                });
            }
        }
    });

    let channel = bridge
        .connect("SB:REMOTE", Duration::from_secs(5))
        .expect("连接成功");
    responder.join().expect("响应线程");
    let info = h.context.channel_info(channel).expect("已连接");
    assert_eq!(&*info.name, "SB:REMOTE");
}

/// 连接超时后通道被销毁，不留下持续搜索的通道。
#[test]
fn connect_timeout_destroys_channel() {
    let h = Harness::new();
    let bridge = SyncBridge::new(h.context.clone());
    let err = bridge
        .connect("SB:NOBODY", Duration::from_millis(100))
        .expect_err("无人应答");
    assert!(matches!(err, CaError::Timeout { operation: "connect", .. }));
    assert_eq!(h.context.channel_count(), 0);
}

/// `async` 读取在按时应答时返回读数。
#[tokio::test]
async fn async_get_completes() {
    let h = Harness::new();
    let (channel, link) = h.connected_channel("SB:ASYNC", server(5064));
    let bridge = SyncBridge::new(h.context.clone());
    let responder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let ioid = link
            .take_outbound()
            .into_iter()
            .find_map(|message| match message {
                Message::ReadNotify { ioid, .. } => Some(ioid),
                _ => None,
            })
            .expect("读取请求");
        link.message(read_reply(ioid, 8.0));
    });
    let reading = bridge
        .get_async(channel, DbrType::Double, 1, Duration::from_secs(5))
        .await
        .expect("按时应答");
    assert_eq!(reading.value, Value::Doubles(vec![8.0]));
    responder.await.expect("响应任务");
}

/// `async` 变体的超时语义与阻塞版本一致。
#[tokio::test]
async fn async_get_timeout_discards_late_reply() {
    let h = Harness::new();
    let (channel, link) = h.connected_channel("SB:ASYNC-SLOW", server(5064));
    let bridge = SyncBridge::new(h.context.clone());
    let responder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        let ioid = link
            .take_outbound()
            .into_iter()
            .find_map(|message| match message {
                Message::ReadNotify { ioid, .. } => Some(ioid),
                _ => None,
            })
            .expect("读取请求");
        link.message(read_reply(ioid, 0.5));
    });
    let err = bridge
        .get_async(channel, DbrType::Double, 1, Duration::from_millis(100))
        .await
        .expect_err("超时");
    assert!(matches!(err, CaError::Timeout { .. }));
    responder.await.expect("响应任务");
    assert_eq!(h.context.stats().stale_completions, 1);
}

/// 通道在等待期间被销毁时，`async` 读取以“已取消”结束。
#[tokio::test]
async fn async_get_reports_cancellation() {
    let h = Harness::new();
    let (channel, _link) = h.connected_channel("SB:CANCEL", server(5064));
    let bridge = SyncBridge::new(h.context.clone());
    let context = h.context.clone();
    let destroyer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        context.destroy_channel(channel).expect("销毁");
    });
    let err = bridge
        .get_async(channel, DbrType::Double, 1, Duration::from_secs(5))
        .await
        .expect_err("已取消");
    assert!(matches!(err, CaError::Cancelled { .. }));
    destroyer.await.expect("销毁任务");
}
