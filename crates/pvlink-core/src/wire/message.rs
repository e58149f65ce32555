//! 线上报文模型。
//!
//! 命令码按方向复用：同一命令码在客户端→服务器与服务器→客户端两个方向上语义不同
//! （例如 `CREATE_CHANNEL` 既是请求也是应答），因此解码需要知道本端角色，见
//! [`FrameCodec`](super::FrameCodec)。

use std::net::SocketAddrV4;

use super::value::{ControlInfo, DbrType, EventMask, Reading, Value};

/// 命令码。
pub mod command {
    pub const VERSION: u16 = 0;
    pub const EVENT_ADD: u16 = 1;
    pub const EVENT_CANCEL: u16 = 2;
    pub const WRITE: u16 = 4;
    pub const SEARCH: u16 = 6;
    pub const ERROR: u16 = 11;
    pub const CLEAR_CHANNEL: u16 = 12;
    pub const BEACON: u16 = 13;
    pub const NOT_FOUND: u16 = 14;
    pub const READ_NOTIFY: u16 = 15;
    pub const CREATE_CHANNEL: u16 = 18;
    pub const WRITE_NOTIFY: u16 = 19;
    pub const CLIENT_NAME: u16 = 20;
    pub const HOST_NAME: u16 = 21;
    pub const ECHO: u16 = 23;
    pub const CREATE_CHANNEL_FAILED: u16 = 26;
    pub const SERVER_DISCONNECT: u16 = 27;
}

/// 请求完成状态码。
pub mod status {
    pub const NORMAL: u32 = 1;
    pub const BAD_TYPE: u32 = 114;
    pub const BAD_COUNT: u32 = 176;
    pub const GET_FAIL: u32 = 320;
    pub const PUT_FAIL: u32 = 328;
    pub const NO_READ_ACCESS: u32 = 392;
    pub const NO_WRITE_ACCESS: u32 = 400;

    pub fn is_success(code: u32) -> bool {
        code == NORMAL
    }
}

/// 本实现宣称的协议次版本。
pub const MINOR_VERSION: u16 = 13;

/// 服务器在搜索应答中以该地址表示“使用报文来源地址”。
pub const ADDRESS_FROM_SENDER: u32 = u32::MAX;

/// 一帧报文。
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Version {
        priority: u16,
        minor: u16,
    },
    ClientName {
        name: String,
    },
    HostName {
        name: String,
    },
    /// 客户端 → 服务器的名称查询。
    Search {
        search_id: u32,
        name: String,
        reply_wanted: bool,
    },
    /// 服务器 → 客户端。`server` 的 IP 为 `0.0.0.0` 时由接收方替换为报文来源地址。
    SearchReply {
        search_id: u32,
        server: SocketAddrV4,
    },
    NotFound {
        search_id: u32,
    },
    CreateChannel {
        cid: u32,
        name: String,
    },
    CreateChannelReply {
        cid: u32,
        sid: u32,
        native_type: DbrType,
        element_count: u32,
    },
    CreateChannelFailed {
        cid: u32,
    },
    ClearChannel {
        sid: u32,
        cid: u32,
    },
    ServerDisconnect {
        cid: u32,
    },
    EventAdd {
        sid: u32,
        subid: u32,
        data_type: DbrType,
        count: u32,
        mask: EventMask,
    },
    EventCancel {
        sid: u32,
        subid: u32,
        data_type: DbrType,
        count: u32,
    },
    /// 订阅更新；`reading` 为 `None` 表示无值（取消确认或错误状态）。
    EventData {
        subid: u32,
        status: u32,
        data_type: DbrType,
        reading: Option<Reading>,
    },
    ReadNotify {
        sid: u32,
        ioid: u32,
        data_type: DbrType,
        count: u32,
    },
    ReadNotifyReply {
        ioid: u32,
        status: u32,
        data_type: DbrType,
        reading: Option<Reading>,
    },
    /// 读取通道的控制元数据（单位、精度与上下限）。
    ReadControl {
        sid: u32,
        ioid: u32,
    },
    ReadControlReply {
        ioid: u32,
        status: u32,
        info: Option<ControlInfo>,
    },
    Write {
        sid: u32,
        ioid: u32,
        value: Value,
    },
    WriteNotify {
        sid: u32,
        ioid: u32,
        value: Value,
    },
    WriteNotifyReply {
        ioid: u32,
        status: u32,
    },
    Echo,
    Error {
        cid: u32,
        status: u32,
        message: String,
    },
    /// 服务器周期性广播的存活信标。`server` 的 IP 为 `0.0.0.0` 时取报文来源地址。
    Beacon {
        beacon_id: u32,
        server: SocketAddrV4,
    },
}

impl Message {
    pub fn command(&self) -> u16 {
        match self {
            Message::Version { .. } => command::VERSION,
            Message::ClientName { .. } => command::CLIENT_NAME,
            Message::HostName { .. } => command::HOST_NAME,
            Message::Search { .. } | Message::SearchReply { .. } => command::SEARCH,
            Message::NotFound { .. } => command::NOT_FOUND,
            Message::CreateChannel { .. } | Message::CreateChannelReply { .. } => {
                command::CREATE_CHANNEL
            }
            Message::CreateChannelFailed { .. } => command::CREATE_CHANNEL_FAILED,
            Message::ClearChannel { .. } => command::CLEAR_CHANNEL,
            Message::ServerDisconnect { .. } => command::SERVER_DISCONNECT,
            Message::EventAdd { .. } | Message::EventData { .. } => command::EVENT_ADD,
            Message::EventCancel { .. } => command::EVENT_CANCEL,
            Message::ReadNotify { .. }
            | Message::ReadNotifyReply { .. }
            | Message::ReadControl { .. }
            | Message::ReadControlReply { .. } => command::READ_NOTIFY,
            Message::Write { .. } => command::WRITE,
            Message::WriteNotify { .. } | Message::WriteNotifyReply { .. } => {
                command::WRITE_NOTIFY
            }
            Message::Echo => command::ECHO,
            Message::Error { .. } => command::ERROR,
            Message::Beacon { .. } => command::BEACON,
        }
    }

    /// 日志用的短名称。
    pub fn name(&self) -> &'static str {
        match self {
            Message::Version { .. } => "version",
            Message::ClientName { .. } => "client_name",
            Message::HostName { .. } => "host_name",
            Message::Search { .. } => "search",
            Message::SearchReply { .. } => "search_reply",
            Message::NotFound { .. } => "not_found",
            Message::CreateChannel { .. } => "create_channel",
            Message::CreateChannelReply { .. } => "create_channel_reply",
            Message::CreateChannelFailed { .. } => "create_channel_failed",
            Message::ClearChannel { .. } => "clear_channel",
            Message::ServerDisconnect { .. } => "server_disconnect",
            Message::EventAdd { .. } => "event_add",
            Message::EventCancel { .. } => "event_cancel",
            Message::EventData { .. } => "event_data",
            Message::ReadNotify { .. } => "read_notify",
            Message::ReadNotifyReply { .. } => "read_notify_reply",
            Message::ReadControl { .. } => "read_control",
            Message::ReadControlReply { .. } => "read_control_reply",
            Message::Write { .. } => "write",
            Message::WriteNotify { .. } => "write_notify",
            Message::WriteNotifyReply { .. } => "write_notify_reply",
            Message::Echo => "echo",
            Message::Error { .. } => "error",
            Message::Beacon { .. } => "beacon",
        }
    }
}
