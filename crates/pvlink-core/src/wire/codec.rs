use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::message::{ADDRESS_FROM_SENDER, MINOR_VERSION, Message, command};
use super::value::{CONTROL_DATA_TYPE, ControlInfo, DbrType, EventMask, Reading, Value};
use crate::error::{CaError, Result};

/// 定长报文头字节数。
pub const HEADER_SIZE: usize = 20;

/// 负载对齐粒度。
pub const PAYLOAD_ALIGN: usize = 8;

/// 负载上限在数组上限之外额外预留的余量（元数据、名称等）。
const PAYLOAD_SLACK: usize = 64;

const SEARCH_REPLY_WANTED: u16 = 10;
const SEARCH_NO_REPLY: u16 = 5;

/// 本端在连接中的角色，决定入站命令码的解释方式。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

/// 解析后的报文头。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub command: u16,
    pub data_type: u16,
    pub payload_len: u32,
    pub count: u32,
    pub param1: u32,
    pub param2: u32,
}

impl Header {
    fn put(&self, dst: &mut BytesMut) {
        dst.put_u16(self.command);
        dst.put_u16(self.data_type);
        dst.put_u32(self.payload_len);
        dst.put_u32(self.count);
        dst.put_u32(self.param1);
        dst.put_u32(self.param2);
    }

    fn peek(src: &[u8]) -> Option<Self> {
        let mut raw = src.get(..HEADER_SIZE)?;
        Some(Self {
            command: raw.get_u16(),
            data_type: raw.get_u16(),
            payload_len: raw.get_u32(),
            count: raw.get_u32(),
            param1: raw.get_u32(),
            param2: raw.get_u32(),
        })
    }
}

/// 定长头 + 8 字节对齐负载的分帧编解码器。
///
/// # 设计动机（Why）
/// - Circuit 的 TCP 字节流与搜索的 UDP 数据报使用同一种帧形状，一个编解码器同时服务两者；
/// - 解码是增量的：缓冲不足一帧时返回 `Ok(None)`，由 I/O 路径继续读取后重试。
///
/// # 契约说明（What）
/// - 头部 20 字节大端：`command u16`、`data_type u16`、`payload_len u32`、`count u32`、
///   `param1 u32`、`param2 u32`；
/// - `payload_len` 含填充，必须是 8 的倍数且不超过 `max_payload`；
/// - 未知命令码、长度越界、元素数与负载不符均为协议错误，调用方应拆除所在连接，
///   不尝试在流中间重新同步。
///
/// # 权衡（Trade-offs）
/// - 只保证帧的形状，不追求与历史实现逐字节一致。
#[derive(Clone, Debug)]
pub struct FrameCodec {
    role: Role,
    max_payload: usize,
}

impl FrameCodec {
    /// 客户端侧：编码请求，解码服务器发来的应答与事件。
    pub fn client(max_array_bytes: usize) -> Self {
        Self::new(Role::Client, max_array_bytes)
    }

    /// 服务器侧；供测试替身与工具使用。
    pub fn server(max_array_bytes: usize) -> Self {
        Self::new(Role::Server, max_array_bytes)
    }

    pub fn new(role: Role, max_array_bytes: usize) -> Self {
        Self {
            role,
            max_payload: align(max_array_bytes.saturating_add(PAYLOAD_SLACK)),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// 将报文追加写入 `dst`。负载超限时不写入任何字节。
    pub fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let mut payload = BytesMut::new();
        let mut header = Header {
            command: message.command(),
            data_type: 0,
            payload_len: 0,
            count: 0,
            param1: 0,
            param2: 0,
        };

        match message {
            Message::Version { priority, minor } => {
                header.data_type = *priority;
                header.count = u32::from(*minor);
            }
            Message::ClientName { name } | Message::HostName { name } => {
                put_cstring(&mut payload, name);
            }
            Message::Search {
                search_id,
                name,
                reply_wanted,
            } => {
                header.data_type = if *reply_wanted {
                    SEARCH_REPLY_WANTED
                } else {
                    SEARCH_NO_REPLY
                };
                header.count = u32::from(MINOR_VERSION);
                header.param1 = *search_id;
                header.param2 = *search_id;
                put_cstring(&mut payload, name);
            }
            Message::SearchReply { search_id, server } => {
                header.data_type = server.port();
                header.param1 = if server.ip().is_unspecified() {
                    ADDRESS_FROM_SENDER
                } else {
                    u32::from(*server.ip())
                };
                header.param2 = *search_id;
            }
            Message::NotFound { search_id } => {
                header.data_type = SEARCH_REPLY_WANTED;
                header.count = u32::from(MINOR_VERSION);
                header.param1 = *search_id;
                header.param2 = *search_id;
            }
            Message::CreateChannel { cid, name } => {
                header.param1 = *cid;
                header.param2 = u32::from(MINOR_VERSION);
                put_cstring(&mut payload, name);
            }
            Message::CreateChannelReply {
                cid,
                sid,
                native_type,
                element_count,
            } => {
                header.data_type = native_type.code();
                header.count = *element_count;
                header.param1 = *cid;
                header.param2 = *sid;
            }
            Message::CreateChannelFailed { cid } | Message::ServerDisconnect { cid } => {
                header.param1 = *cid;
            }
            Message::ClearChannel { sid, cid } => {
                header.param1 = *sid;
                header.param2 = *cid;
            }
            Message::EventAdd {
                sid,
                subid,
                data_type,
                count,
                mask,
            } => {
                header.data_type = data_type.code();
                header.count = *count;
                header.param1 = *sid;
                header.param2 = *subid;
                payload.put_u16(mask.bits());
            }
            Message::EventCancel {
                sid,
                subid,
                data_type,
                count,
            } => {
                header.data_type = data_type.code();
                header.count = *count;
                header.param1 = *sid;
                header.param2 = *subid;
            }
            Message::EventData {
                subid,
                status,
                data_type,
                reading,
            } => {
                header.data_type = data_type.code();
                header.param1 = *status;
                header.param2 = *subid;
                if let Some(reading) = reading {
                    header.data_type = reading.value.dbr_type().code();
                    header.count = count_u32(reading.value.count())?;
                    reading.encode(&mut payload);
                }
            }
            Message::ReadNotify {
                sid,
                ioid,
                data_type,
                count,
            } => {
                header.data_type = data_type.code();
                header.count = *count;
                header.param1 = *sid;
                header.param2 = *ioid;
            }
            Message::ReadNotifyReply {
                ioid,
                status,
                data_type,
                reading,
            } => {
                header.data_type = data_type.code();
                header.param1 = *status;
                header.param2 = *ioid;
                if let Some(reading) = reading {
                    header.data_type = reading.value.dbr_type().code();
                    header.count = count_u32(reading.value.count())?;
                    reading.encode(&mut payload);
                }
            }
            Message::ReadControl { sid, ioid } => {
                header.data_type = CONTROL_DATA_TYPE;
                header.count = 1;
                header.param1 = *sid;
                header.param2 = *ioid;
            }
            Message::ReadControlReply { ioid, status, info } => {
                header.data_type = CONTROL_DATA_TYPE;
                header.param1 = *status;
                header.param2 = *ioid;
                if let Some(info) = info {
                    header.count = 1;
                    info.encode(&mut payload);
                }
            }
            Message::Write { sid, ioid, value } | Message::WriteNotify { sid, ioid, value } => {
                header.data_type = value.dbr_type().code();
                header.count = count_u32(value.count())?;
                header.param1 = *sid;
                header.param2 = *ioid;
                value.encode(&mut payload);
            }
            Message::WriteNotifyReply { ioid, status } => {
                header.param1 = *status;
                header.param2 = *ioid;
            }
            Message::Echo => {}
            Message::Error {
                cid,
                status,
                message,
            } => {
                header.param1 = *cid;
                header.param2 = *status;
                put_cstring(&mut payload, message);
            }
            Message::Beacon { beacon_id, server } => {
                header.data_type = server.port();
                header.param1 = *beacon_id;
                header.param2 = u32::from(*server.ip());
            }
        }

        let padded = align(payload.len());
        if padded > self.max_payload {
            return Err(CaError::ArrayTooLarge {
                bytes: padded,
                limit: self.max_payload,
            });
        }
        payload.put_bytes(0, padded - payload.len());
        header.payload_len = count_u32(padded)?;

        dst.reserve(HEADER_SIZE + padded);
        header.put(dst);
        dst.put_slice(&payload);
        Ok(())
    }

    /// 从 `src` 前端解码一帧；不足一帧时返回 `Ok(None)` 且不消费字节。
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        // === 教案级注释 ===
        // Why: 先看头部再决定是否等待更多字节，避免攻击者用超长 payload_len 诱使缓冲无限增长。
        // How:
        // 1. 头部不足 20 字节直接返回 None；
        // 2. 校验 payload_len 的对齐与上限，超限立即报错；
        // 3. 整帧到齐后 split 出头与负载，再按角色解释命令码。
        let Some(header) = Header::peek(src) else {
            return Ok(None);
        };
        let payload_len = header.payload_len as usize;
        if payload_len > self.max_payload {
            return Err(CaError::malformed(format!(
                "payload of {payload_len} bytes exceeds limit {}",
                self.max_payload
            )));
        }
        if payload_len % PAYLOAD_ALIGN != 0 {
            return Err(CaError::malformed(format!(
                "payload length {payload_len} is not {PAYLOAD_ALIGN}-byte aligned"
            )));
        }
        if src.len() < HEADER_SIZE + payload_len {
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        let message = match self.role {
            Role::Client => decode_from_server(&header, payload)?,
            Role::Server => decode_from_client(&header, payload)?,
        };
        Ok(Some(message))
    }
}

fn decode_from_server(header: &Header, mut payload: Bytes) -> Result<Message> {
    Ok(match header.command {
        command::VERSION => Message::Version {
            priority: header.data_type,
            minor: u16::try_from(header.count).unwrap_or(u16::MAX),
        },
        command::SEARCH => {
            let ip = if header.param1 == ADDRESS_FROM_SENDER {
                Ipv4Addr::UNSPECIFIED
            } else {
                Ipv4Addr::from(header.param1)
            };
            Message::SearchReply {
                search_id: header.param2,
                server: SocketAddrV4::new(ip, header.data_type),
            }
        }
        command::NOT_FOUND => Message::NotFound {
            search_id: header.param1,
        },
        command::CREATE_CHANNEL => Message::CreateChannelReply {
            cid: header.param1,
            sid: header.param2,
            native_type: DbrType::from_code(header.data_type)?,
            element_count: header.count,
        },
        command::CREATE_CHANNEL_FAILED => Message::CreateChannelFailed {
            cid: header.param1,
        },
        command::CLEAR_CHANNEL => Message::ClearChannel {
            sid: header.param1,
            cid: header.param2,
        },
        command::SERVER_DISCONNECT => Message::ServerDisconnect {
            cid: header.param1,
        },
        command::EVENT_ADD => {
            let data_type = DbrType::from_code(header.data_type)?;
            Message::EventData {
                subid: header.param2,
                status: header.param1,
                data_type,
                reading: decode_reading(header, data_type, &mut payload)?,
            }
        }
        command::READ_NOTIFY if header.data_type == CONTROL_DATA_TYPE => {
            let info = if header.count == 0 || payload.is_empty() {
                None
            } else {
                Some(ControlInfo::decode(&mut payload)?)
            };
            Message::ReadControlReply {
                ioid: header.param2,
                status: header.param1,
                info,
            }
        }
        command::READ_NOTIFY => {
            let data_type = DbrType::from_code(header.data_type)?;
            Message::ReadNotifyReply {
                ioid: header.param2,
                status: header.param1,
                data_type,
                reading: decode_reading(header, data_type, &mut payload)?,
            }
        }
        command::WRITE_NOTIFY => Message::WriteNotifyReply {
            ioid: header.param2,
            status: header.param1,
        },
        command::ECHO => Message::Echo,
        command::BEACON => Message::Beacon {
            beacon_id: header.param1,
            server: SocketAddrV4::new(Ipv4Addr::from(header.param2), header.data_type),
        },
        command::ERROR => Message::Error {
            cid: header.param1,
            status: header.param2,
            message: take_cstring(&mut payload)?,
        },
        other => {
            return Err(CaError::malformed(format!(
                "unknown command {other} from server"
            )));
        }
    })
}

fn decode_from_client(header: &Header, mut payload: Bytes) -> Result<Message> {
    Ok(match header.command {
        command::VERSION => Message::Version {
            priority: header.data_type,
            minor: u16::try_from(header.count).unwrap_or(u16::MAX),
        },
        command::CLIENT_NAME => Message::ClientName {
            name: take_cstring(&mut payload)?,
        },
        command::HOST_NAME => Message::HostName {
            name: take_cstring(&mut payload)?,
        },
        command::SEARCH => Message::Search {
            search_id: header.param1,
            name: take_cstring(&mut payload)?,
            reply_wanted: header.data_type == SEARCH_REPLY_WANTED,
        },
        command::CREATE_CHANNEL => Message::CreateChannel {
            cid: header.param1,
            name: take_cstring(&mut payload)?,
        },
        command::CLEAR_CHANNEL => Message::ClearChannel {
            sid: header.param1,
            cid: header.param2,
        },
        command::EVENT_ADD => {
            if payload.remaining() < 2 {
                return Err(CaError::malformed("event add without mask"));
            }
            Message::EventAdd {
                sid: header.param1,
                subid: header.param2,
                data_type: DbrType::from_code(header.data_type)?,
                count: header.count,
                mask: EventMask::from_bits_truncate(payload.get_u16()),
            }
        }
        command::EVENT_CANCEL => Message::EventCancel {
            sid: header.param1,
            subid: header.param2,
            data_type: DbrType::from_code(header.data_type)?,
            count: header.count,
        },
        command::READ_NOTIFY if header.data_type == CONTROL_DATA_TYPE => Message::ReadControl {
            sid: header.param1,
            ioid: header.param2,
        },
        command::READ_NOTIFY => Message::ReadNotify {
            sid: header.param1,
            ioid: header.param2,
            data_type: DbrType::from_code(header.data_type)?,
            count: header.count,
        },
        command::WRITE | command::WRITE_NOTIFY => {
            let value = Value::decode(
                DbrType::from_code(header.data_type)?,
                header.count as usize,
                &mut payload,
            )?;
            if header.command == command::WRITE {
                Message::Write {
                    sid: header.param1,
                    ioid: header.param2,
                    value,
                }
            } else {
                Message::WriteNotify {
                    sid: header.param1,
                    ioid: header.param2,
                    value,
                }
            }
        }
        command::ECHO => Message::Echo,
        other => {
            return Err(CaError::malformed(format!(
                "unknown command {other} from client"
            )));
        }
    })
}

fn decode_reading(header: &Header, data_type: DbrType, payload: &mut Bytes) -> Result<Option<Reading>> {
    if header.count == 0 || payload.is_empty() {
        return Ok(None);
    }
    Reading::decode(data_type, header.count as usize, payload).map(Some)
}

fn align(len: usize) -> usize {
    len.div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN
}

fn count_u32(count: usize) -> Result<u32> {
    u32::try_from(count).map_err(|_| CaError::malformed("element count exceeds u32"))
}

fn put_cstring(dst: &mut BytesMut, value: &str) {
    dst.put_slice(value.as_bytes());
    dst.put_u8(0);
}

fn take_cstring(src: &mut Bytes) -> Result<String> {
    let end = src
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| CaError::malformed("string payload is not NUL-terminated"))?;
    let raw = src.split_to(end);
    src.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| CaError::malformed("string payload is not utf-8"))
}
