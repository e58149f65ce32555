//! 截止时间驱动的定时器队列。
//!
//! # 教案式说明
//! - **意图 (Why)**：搜索重试、回声探测、连接超时与 Kill Timer 共享同一个调度原语，
//!   不再各自轮询。队列本身不理解任何协议语义，只负责“到点回调”。
//! - **契约 (What)**：
//!   - 同一时刻到期的多个定时器按调度顺序触发；
//!   - 回调执行期间不持有队列锁，回调内部可以安全地启动、取消其他定时器或自身；
//!   - 回调返回 [`Expire::Restart`] 时以触发时刻为基准重新排期，形成周期定时器；
//!   - 回调执行过程中若定时器被取消，则忽略其 `Restart` 请求。
//! - **执行逻辑 (How)**：`BTreeMap<(deadline, seq), handle>` 维护排期，[`Arena`] 保存条目；
//!   [`TimerQueue::run`] 在下一个截止时间与“新排期”通知之间 `select!`，事件驱动而非固定间隔。

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::arena::{Arena, Handle};
use crate::error::{CaError, Result};
use crate::time::Clock;

/// 回调返回值：结束或在给定延迟后再次触发。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expire {
    Done,
    Restart(Duration),
}

/// 定时器到期回调。
///
/// 实现必须快速返回且不得阻塞：它运行在驱动队列的任务上。
pub trait TimerNotify: Send + Sync + 'static {
    fn expire(&self, now: Instant) -> Expire;
}

impl<F> TimerNotify for F
where
    F: Fn(Instant) -> Expire + Send + Sync + 'static,
{
    fn expire(&self, now: Instant) -> Expire {
        self(now)
    }
}

type ScheduleKey = (Instant, u64);

#[derive(Clone, Copy, Debug)]
enum TimerState {
    Idle,
    Pending(ScheduleKey),
    Firing { cancelled: bool },
}

struct TimerEntry {
    state: TimerState,
    notify: Option<Arc<dyn TimerNotify>>,
}

struct QueueState {
    entries: Arena<TimerEntry>,
    schedule: BTreeMap<ScheduleKey, Handle<TimerEntry>>,
    next_seq: u64,
}

impl QueueState {
    fn schedule(&mut self, handle: Handle<TimerEntry>, deadline: Instant) {
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        if let Some(entry) = self.entries.get_mut(handle) {
            if let TimerState::Pending(old) = entry.state {
                self.schedule.remove(&old);
            }
            entry.state = TimerState::Pending(key);
            self.schedule.insert(key, handle);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.schedule.keys().next().map(|(deadline, _)| *deadline)
    }
}

struct QueueShared {
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    wakeup: Notify,
}

/// 定时器队列；克隆体共享同一调度表。
#[derive(Clone)]
pub struct TimerQueue {
    shared: Arc<QueueShared>,
}

impl TimerQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                clock,
                state: Mutex::new(QueueState {
                    entries: Arena::default(),
                    schedule: BTreeMap::new(),
                    next_seq: 0,
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.shared.clock)
    }

    pub fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    /// 创建一个空闲定时器。
    pub fn create_timer(&self) -> Result<Timer> {
        let mut state = self.shared.state.lock();
        let limit = state.entries.limit();
        let handle = state
            .entries
            .try_insert(TimerEntry {
                state: TimerState::Idle,
                notify: None,
            })
            .map_err(|_| CaError::ResourceExhausted {
                resource: "timer",
                limit,
            })?;
        Ok(Timer {
            queue: Arc::downgrade(&self.shared),
            handle,
        })
    }

    /// 当前排期中的定时器数量。
    pub fn pending(&self) -> usize {
        self.shared.state.lock().schedule.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared.state.lock().next_deadline()
    }

    /// 触发所有截止时间不晚于 `now` 的定时器，返回下一个截止时间。
    ///
    /// 本轮新排入的条目（包括回调以零延迟重启自身）留到下一轮处理，避免死循环。
    pub fn process(&self, now: Instant) -> Option<Instant> {
        let barrier = self.shared.state.lock().next_seq;
        loop {
            let fired = {
                let mut state = self.shared.state.lock();
                let due = state
                    .schedule
                    .iter()
                    .take_while(|(key, _)| key.0 <= now)
                    .find(|(key, _)| key.1 < barrier)
                    .map(|(key, handle)| (*key, *handle));
                match due {
                    None => None,
                    Some((key, handle)) => {
                        state.schedule.remove(&key);
                        state.entries.get_mut(handle).and_then(|entry| {
                            entry.state = TimerState::Firing { cancelled: false };
                            entry.notify.clone().map(|notify| (handle, notify))
                        })
                    }
                }
            };
            let Some((handle, notify)) = fired else {
                let state = self.shared.state.lock();
                let more_due = state
                    .schedule
                    .iter()
                    .take_while(|(key, _)| key.0 <= now)
                    .any(|(key, _)| key.1 < barrier);
                if more_due {
                    continue;
                }
                return state.next_deadline();
            };

            let outcome = notify.expire(now);

            let mut state = self.shared.state.lock();
            let Some(entry) = state.entries.get_mut(handle) else {
                continue;
            };
            let TimerState::Firing { cancelled } = entry.state else {
                // 回调内部已重新 start，新排期优先。
                continue;
            };
            match outcome {
                Expire::Restart(delay) if !cancelled => state.schedule(handle, now + delay),
                _ => {
                    entry.state = TimerState::Idle;
                    entry.notify = None;
                }
            }
        }
    }

    /// 事件驱动的队列主循环：睡眠到下一个截止时间，或被更早的新排期提前唤醒。
    ///
    /// 循环不会自行退出，调用方通过中止所在任务来停止它。
    pub async fn run(&self) {
        loop {
            let next = self.process(self.shared.clock.now());
            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline.into()) => {}
                        _ = self.shared.wakeup.notified() => {}
                    }
                }
                None => self.shared.wakeup.notified().await,
            }
        }
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

/// 队列中的单个定时器；Drop 时自动从队列移除。
///
/// 只持有队列的弱引用：回调对象可以安全地反向持有自己的 `Timer`。
pub struct Timer {
    queue: Weak<QueueShared>,
    handle: Handle<TimerEntry>,
}

impl Timer {
    /// 在 `delay` 之后触发 `notify`；已排期时改为新的截止时间。
    pub fn start(&self, notify: Arc<dyn TimerNotify>, delay: Duration) {
        let Some(shared) = self.queue.upgrade() else {
            return;
        };
        let deadline = shared.clock.now() + delay;
        self.start_at_inner(&shared, notify, deadline);
    }

    /// 在绝对时间点触发。
    pub fn start_at(&self, notify: Arc<dyn TimerNotify>, deadline: Instant) {
        let Some(shared) = self.queue.upgrade() else {
            return;
        };
        self.start_at_inner(&shared, notify, deadline);
    }

    fn start_at_inner(
        &self,
        shared: &QueueShared,
        notify: Arc<dyn TimerNotify>,
        deadline: Instant,
    ) {
        let previous = {
            let mut state = shared.state.lock();
            let Some(entry) = state.entries.get_mut(self.handle) else {
                return;
            };
            let previous = entry.notify.replace(notify);
            state.schedule(self.handle, deadline);
            previous
        };
        // 旧回调可能持有其他 Timer，必须在释放队列锁之后析构。
        drop(previous);
        shared.wakeup.notify_one();
    }

    /// 取消排期，返回取消前是否处于排期状态。
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.queue.upgrade() else {
            return false;
        };
        let mut state = shared.state.lock();
        let Some(entry) = state.entries.get_mut(self.handle) else {
            return false;
        };
        let (was_pending, released) = match entry.state {
            TimerState::Pending(key) => {
                entry.state = TimerState::Idle;
                let released = entry.notify.take();
                state.schedule.remove(&key);
                (true, released)
            }
            TimerState::Firing { .. } => {
                entry.state = TimerState::Firing { cancelled: true };
                (false, None)
            }
            TimerState::Idle => (false, None),
        };
        drop(state);
        drop(released);
        was_pending
    }

    pub fn is_pending(&self) -> bool {
        self.expires_at().is_some()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        let shared = self.queue.upgrade()?;
        let state = shared.state.lock();
        match state.entries.get(self.handle)?.state {
            TimerState::Pending((deadline, _)) => Some(deadline),
            _ => None,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let Some(shared) = self.queue.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        let removed = state.entries.remove(self.handle);
        if let Some(TimerEntry {
            state: TimerState::Pending(key),
            ..
        }) = &removed
        {
            state.schedule.remove(key);
        }
        drop(state);
        drop(removed);
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("handle", &self.handle)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}
