//! 线协议：取值模型、报文模型与分帧编解码。

mod codec;
mod message;
mod value;

pub use codec::{FrameCodec, HEADER_SIZE, Header, PAYLOAD_ALIGN, Role};
pub use message::{ADDRESS_FROM_SENDER, MINOR_VERSION, Message, command, status};
pub use value::{
    AlarmSeverity, AlarmStatus, CONTROL_DATA_TYPE, ControlInfo, DbrType, EventMask, Limits,
    MAX_STRING_SIZE, MAX_UNITS_SIZE, Reading, TimeStamp, Value,
};
