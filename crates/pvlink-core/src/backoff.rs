use std::time::Duration;

/// 名称搜索的指数退避。
///
/// # 教案式说明
/// - **意图 (Why)**：未命中的搜索请求以逐步拉长的间隔重发，既能在服务器刚启动时快速
///   命中，又不会在目标长期不存在时持续占用广播带宽。
/// - **契约 (What)**：`current()` 单调不减，且恒不超过 `ceiling`；`reset()` 回到
///   `initial` 并清零尝试计数。
/// - **执行逻辑 (How)**：每次 `advance` 把当前周期翻倍，再与上限取小。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SearchBackoff {
    initial: Duration,
    ceiling: Duration,
    current: Duration,
    attempts: u32,
}

impl SearchBackoff {
    /// `ceiling` 小于 `initial` 时按 `initial` 处理。
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(initial);
        Self {
            initial,
            ceiling,
            current: initial,
            attempts: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// 自上次 `reset` 以来发送的搜索次数。
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 记录一次发送并返回下一次等待的周期。
    pub fn advance(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}
