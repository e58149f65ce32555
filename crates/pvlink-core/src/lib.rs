#![deny(unsafe_code)]
#![doc = "pvlink-core: 过程变量客户端引擎的基础契约。"]
#![doc = ""]
#![doc = "本 crate 不做任何网络 I/O，只提供客户端引擎与 I/O 驱动共享的构件："]
#![doc = "- [`error`]：带稳定错误码与处置类别的统一错误域；"]
#![doc = "- [`config`]：只读的客户端配置及其 TOML 解析；"]
#![doc = "- [`time`]：可注入时钟与事件驱动的定时器队列；"]
#![doc = "- [`arena`]：代际校验句柄，替代裸指针与手工引用计数；"]
#![doc = "- [`backoff`]：名称搜索的指数退避；"]
#![doc = "- [`wire`]：报文模型与定长头分帧编解码。"]

pub mod arena;
pub mod backoff;
pub mod config;
pub mod error;
pub mod time;
pub mod wire;

pub use arena::{Arena, Handle};
pub use backoff::SearchBackoff;
pub use config::ClientConfig;
pub use error::{CaError, ErrorCategory, Result};
pub use time::{Clock, Expire, MockClock, SystemClock, Timer, TimerNotify, TimerQueue};
