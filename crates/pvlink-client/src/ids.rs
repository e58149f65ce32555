//! 对外暴露的类型化句柄。
//!
//! 句柄只是 `(index, generation)` 的包装：对象被销毁后，旧句柄在注册表中解析失败，
//! 调用方得到 `Misuse` 类错误而不是访问到复用槽位上的新对象。

use std::fmt;

use pvlink_core::Handle;

use crate::channel::{Channel, Request};
use crate::circuit::CircuitCell;
use crate::subscription::Subscription;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident => $target:ty, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(pub(crate) Handle<$target>);

        impl $name {
            /// 协议中携带的 32 位标识。
            pub fn wire(self) -> u32 {
                self.0.to_wire()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

typed_id!(
    /// 通道句柄；其线上标识同时用作搜索 id 与 cid。
    ChannelId => Channel, "channel"
);
typed_id!(
    /// 订阅句柄。
    SubscriptionId => Subscription, "subscription"
);
typed_id!(
    /// 一次性 get/put 请求的关联标识。
    RequestId => Request, "request"
);
typed_id!(
    /// Circuit 句柄。
    CircuitId => std::sync::Arc<CircuitCell>, "circuit"
);
