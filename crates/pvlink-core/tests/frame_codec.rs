//! 分帧编解码的行为测试。
//!
//! # 教案式说明
//! - **Why**：Circuit 的读循环依赖“不足一帧返回 None、畸形帧立即报错”两条契约；
//!   前者保证 TCP 任意切分下不丢帧，后者保证损坏的流被整体拆除而不是被误读。
//! - **How**：服务器侧编码、客户端侧解码，覆盖方向复用的命令码与若干边界。

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, BytesMut};
use proptest::prelude::*;
use pvlink_core::wire::{
    AlarmSeverity, AlarmStatus, DbrType, EventMask, FrameCodec, HEADER_SIZE, Message, Reading,
    TimeStamp, Value, command, status,
};

fn encode_all(codec: &FrameCodec, messages: &[Message]) -> BytesMut {
    let mut buf = BytesMut::new();
    for message in messages {
        codec.encode(message, &mut buf).expect("编码应成功");
    }
    buf
}

fn server_burst() -> Vec<Message> {
    vec![
        Message::Version {
            priority: 0,
            minor: 13,
        },
        Message::CreateChannelReply {
            cid: 3,
            sid: 900,
            native_type: DbrType::Double,
            element_count: 1,
        },
        Message::EventData {
            subid: 11,
            status: status::NORMAL,
            data_type: DbrType::Double,
            reading: Some(Reading {
                value: Value::Doubles(vec![1.5]),
                status: AlarmStatus::HIGH,
                severity: AlarmSeverity::Minor,
                stamp: TimeStamp {
                    secs: 1_000_000,
                    nanos: 42,
                },
            }),
        },
        Message::ReadNotifyReply {
            ioid: 5,
            status: status::NORMAL,
            data_type: DbrType::String,
            reading: Some(Reading::new(Value::Strings(vec!["on".into(), "off".into()]))),
        },
        Message::WriteNotifyReply {
            ioid: 6,
            status: status::NO_WRITE_ACCESS,
        },
        Message::Echo,
    ]
}

/// 同一缓冲中的多帧依序解出，不足一帧时保留字节等待后续输入。
#[test]
fn decodes_back_to_back_frames_and_waits_for_partial_tail() {
    let server = FrameCodec::server(16 * 1024);
    let client = FrameCodec::client(16 * 1024);
    let mut wire = encode_all(&server, &server_burst());
    let tail = wire.split_off(wire.len() - 3);

    let mut decoded = Vec::new();
    while let Some(message) = client.decode(&mut wire).expect("解码应成功") {
        decoded.push(message);
    }
    assert_eq!(decoded.len(), server_burst().len() - 1);
    assert_eq!(wire.len(), HEADER_SIZE - 3, "残缺的回声帧必须保留在缓冲中");

    wire.unsplit(tail);
    decoded.push(client.decode(&mut wire).expect("解码应成功").expect("完整帧"));
    assert_eq!(decoded, server_burst());
    assert!(wire.is_empty());
}

/// 搜索命令码在两个方向上含义不同：请求携带名称，应答携带服务器地址。
#[test]
fn search_command_is_interpreted_by_role() {
    let client = FrameCodec::client(1024);
    let server = FrameCodec::server(1024);

    let mut request = encode_all(
        &client,
        &[Message::Search {
            search_id: 77,
            name: "SR:CURRENT".into(),
            reply_wanted: true,
        }],
    );
    assert_eq!(
        server.decode(&mut request).expect("解码"),
        Some(Message::Search {
            search_id: 77,
            name: "SR:CURRENT".into(),
            reply_wanted: true,
        })
    );

    let from_sender = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 5064);
    let mut reply = encode_all(
        &server,
        &[Message::SearchReply {
            search_id: 77,
            server: from_sender,
        }],
    );
    assert_eq!(
        client.decode(&mut reply).expect("解码"),
        Some(Message::SearchReply {
            search_id: 77,
            server: from_sender,
        }),
        "未指定地址表示使用报文来源地址"
    );
}

/// 订阅请求携带事件掩码。
#[test]
fn event_add_carries_mask() {
    let client = FrameCodec::client(1024);
    let server = FrameCodec::server(1024);
    let add = Message::EventAdd {
        sid: 1,
        subid: 2,
        data_type: DbrType::Long,
        count: 4,
        mask: EventMask::VALUE | EventMask::ALARM,
    };
    let mut wire = encode_all(&client, std::slice::from_ref(&add));
    assert_eq!(server.decode(&mut wire).expect("解码"), Some(add));
}

/// 未知命令码与超长负载都是协议错误。
#[test]
fn unknown_command_and_oversized_payload_are_protocol_errors() {
    let client = FrameCodec::client(64);

    let mut unknown = BytesMut::new();
    unknown.put_u16(999);
    unknown.put_bytes(0, HEADER_SIZE - 2);
    let err = client.decode(&mut unknown).expect_err("未知命令必须报错");
    assert_eq!(err.code(), "pvlink.wire.malformed");
    assert!(err.category().is_recoverable());

    let mut oversized = BytesMut::new();
    oversized.put_u16(command::EVENT_ADD);
    oversized.put_u16(DbrType::Double.code());
    oversized.put_u32(1 << 20);
    oversized.put_bytes(0, 12);
    let err = client.decode(&mut oversized).expect_err("超长负载必须在读到负载前报错");
    assert_eq!(err.code(), "pvlink.wire.malformed");

    let mut misaligned = BytesMut::new();
    misaligned.put_u16(command::ECHO);
    misaligned.put_u16(0);
    misaligned.put_u32(3);
    misaligned.put_bytes(0, 12);
    assert!(client.decode(&mut misaligned).is_err(), "未对齐负载必须报错");
}

/// 元素数大于负载容量的回复被拒绝。
#[test]
fn count_larger_than_payload_is_rejected() {
    let client = FrameCodec::client(1024);
    let mut wire = BytesMut::new();
    wire.put_u16(command::READ_NOTIFY);
    wire.put_u16(DbrType::Double.code());
    wire.put_u32(16);
    wire.put_u32(10);
    wire.put_u32(status::NORMAL);
    wire.put_u32(1);
    wire.put_bytes(0, 16);
    assert!(client.decode(&mut wire).is_err());
}

proptest! {
    /// 无论 TCP 如何切分字节流，逐段喂入都解出相同的报文序列。
    #[test]
    fn arbitrary_chunking_yields_identical_messages(cuts in proptest::collection::vec(1usize..64, 1..16)) {
        let server = FrameCodec::server(16 * 1024);
        let client = FrameCodec::client(16 * 1024);
        let mut wire = encode_all(&server, &server_burst());

        let mut inbound = BytesMut::new();
        let mut decoded = Vec::new();
        let mut cut_iter = cuts.iter().cycle();
        while !wire.is_empty() {
            let take = (*cut_iter.next().unwrap_or(&1)).min(wire.len());
            inbound.extend_from_slice(&wire.split_to(take));
            while let Some(message) = client.decode(&mut inbound).expect("解码应成功") {
                decoded.push(message);
            }
        }
        prop_assert_eq!(decoded, server_burst());
        prop_assert!(inbound.is_empty());
    }
}
