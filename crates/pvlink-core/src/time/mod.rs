//! 时间相关设施：可注入时钟与基于截止时间的定时器队列。

mod clock;
mod queue;

pub use clock::{Clock, MockClock, SystemClock};
pub use queue::{Expire, Timer, TimerNotify, TimerQueue};
