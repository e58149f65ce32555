use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 可注入的单调时钟。
///
/// # 设计背景（Why）
/// - 搜索退避、连接超时与 Kill Timer 的截止时间都以 [`Instant`] 表达；若直接调用
///   `Instant::now()`，场景测试将依赖真实流逝的时间而难以复现。
/// - 通过 trait 注入时钟，生产环境使用 [`SystemClock`]，测试注入 [`MockClock`] 手动推进。
///
/// # 接口约束（What）
/// - `now` 必须单调不减；
/// - 实现需 `Send + Sync`，以便在 I/O 任务与应用线程间共享 `Arc<dyn Clock>`。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;
}

/// 直接委托 [`Instant::now`] 的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 虚拟时钟：仅在调用 [`MockClock::advance`] 时前进。
///
/// # 行为概览（How）
/// - 记录构造时的基准点 `origin` 与累计偏移 `elapsed`；
/// - `now()` 返回 `origin + elapsed`，克隆体共享同一偏移。
///
/// 虚拟时钟本身不唤醒任何等待者；驱动定时器需显式调用
/// [`TimerQueue::process`](crate::time::TimerQueue::process)。
#[derive(Clone, Debug)]
pub struct MockClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::with_start(Instant::now())
    }

    /// 以指定起始时间构造虚拟时钟。
    pub fn with_start(origin: Instant) -> Self {
        Self {
            origin,
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, delta: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = elapsed.saturating_add(delta);
    }

    /// 自构造起累计推进的时长。
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }

    /// 当前虚拟时间；与 [`Clock::now`] 相同，免去调用方引入 trait。
    pub fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        MockClock::now(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_only_moves_when_advanced() {
        let clock = MockClock::new();
        let before = clock.now();
        assert_eq!(clock.now(), before, "未推进时虚拟时钟不应前进");

        let shared = clock.clone();
        shared.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - before, Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }
}
