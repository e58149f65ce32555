//! # Kill Timer
//!
//! ## 核心意图（Why）
//! - 对端停止响应却没有关闭套接字时（例如防火墙静默丢弃），读循环永远等不到 EOF；
//!   Kill Timer 在不活动时长超过上限后请求上下文强制拆除 Circuit，保证前向进展。
//!
//! ## 契约（What）
//! - `start` 幂等：`armed` 门闩以 CAS 从 `false` 置为 `true`，只有赢得 CAS 的调用方会
//!   向定时器队列登记，重复调用不会产生第二个排期；
//! - `expire` 由定时器队列调用，唯一副作用是请求 [`CircuitEvictor`] 驱逐所属 Circuit；
//!   它不释放 Circuit，也不持有 Circuit 的强引用；
//! - 一次触发后门闩归零：未显式重新 `start` 前不会再次驱逐；
//! - Circuit 已经通过正常路径销毁或进入新 epoch 时，驱逐请求由上下文按 `(circuit, epoch)`
//!   校验后忽略。
//!
//! ## 实现要点（How）
//! - 每个 `Connected` epoch 新建一个 Kill Timer；入站流量通过 [`KillTimer::touch`]
//!   把截止时间推迟到 `now + bound`；
//! - 到期回调只捕获自身的 `Weak`，上下文通过 `Weak<dyn CircuitEvictor>` 访问，二者都不会
//!   延长对方的生命周期。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use pvlink_core::{Expire, Result, Timer, TimerNotify, TimerQueue};

use crate::ids::CircuitId;

/// 接收驱逐请求的一方，通常是客户端上下文。
pub trait CircuitEvictor: Send + Sync + 'static {
    /// 请求以“未经请求的断开”处理 `circuit` 的第 `epoch` 次连接。
    ///
    /// 实现必须校验 epoch，并且不得阻塞。
    fn evict(&self, circuit: CircuitId, epoch: u64);
}

pub struct KillTimer {
    timer: Timer,
    armed: AtomicBool,
    bound: Duration,
    evictor: Weak<dyn CircuitEvictor>,
    circuit: CircuitId,
    epoch: u64,
    weak_self: Weak<KillTimer>,
}

impl KillTimer {
    pub fn new(
        timers: &TimerQueue,
        evictor: Weak<dyn CircuitEvictor>,
        circuit: CircuitId,
        epoch: u64,
        bound: Duration,
    ) -> Result<Arc<Self>> {
        let timer = timers.create_timer()?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            timer,
            armed: AtomicBool::new(false),
            bound,
            evictor,
            circuit,
            epoch,
            weak_self: weak_self.clone(),
        }))
    }

    /// 装填定时器；返回本次调用是否真正完成了登记。
    pub fn start(&self) -> bool {
        if self
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.timer.start(self.notify(), self.bound);
        true
    }

    /// 记录一次入站活动：已装填时把截止时间推迟一个完整的不活动上限。
    pub fn touch(&self) {
        if self.armed.load(Ordering::Acquire) {
            self.timer.start(self.notify(), self.bound);
        }
    }

    /// 解除装填；所属 Circuit 断开或销毁前必须调用。
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
        self.timer.cancel();
    }

    /// 到期处理。未装填时为空操作。
    pub fn expire(&self) -> Expire {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return Expire::Done;
        }
        tracing::debug!(circuit = %self.circuit, epoch = self.epoch, "kill timer fired");
        if let Some(evictor) = self.evictor.upgrade() {
            evictor.evict(self.circuit, self.epoch);
        }
        Expire::Done
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.timer.expires_at()
    }

    pub fn circuit(&self) -> CircuitId {
        self.circuit
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn notify(&self) -> Arc<dyn TimerNotify> {
        let weak = self.weak_self.clone();
        Arc::new(move |_now: Instant| match weak.upgrade() {
            Some(timer) => timer.expire(),
            None => Expire::Done,
        })
    }
}

impl fmt::Debug for KillTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KillTimer")
            .field("circuit", &self.circuit)
            .field("epoch", &self.epoch)
            .field("armed", &self.is_armed())
            .field("bound", &self.bound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Circuit, CircuitCell};
    use parking_lot::Mutex;
    use pvlink_core::{Arena, MockClock, SearchBackoff};
    use tracing_test::traced_test;

    #[derive(Default)]
    struct RecordingEvictor {
        evicted: Mutex<Vec<(CircuitId, u64)>>,
    }

    impl CircuitEvictor for RecordingEvictor {
        fn evict(&self, circuit: CircuitId, epoch: u64) {
            self.evicted.lock().push((circuit, epoch));
        }
    }

    struct Fixture {
        clock: MockClock,
        queue: TimerQueue,
        evictor: Arc<RecordingEvictor>,
        circuit: CircuitId,
        _circuits: Arena<Arc<CircuitCell>>,
    }

    fn fixture() -> Fixture {
        let clock = MockClock::new();
        let queue = TimerQueue::new(Arc::new(clock.clone()));
        let mut circuits = Arena::default();
        let cell = Arc::new(CircuitCell::new(Circuit::new(
            "127.0.0.1:5064".parse().expect("地址"),
            clock.now(),
            SearchBackoff::new(Duration::from_millis(500), Duration::from_secs(5)),
            queue.create_timer().expect("定时器"),
            queue.create_timer().expect("定时器"),
        )));
        let circuit = CircuitId(circuits.try_insert(cell).ok().expect("容量充足"));
        Fixture {
            clock,
            queue,
            evictor: Arc::new(RecordingEvictor::default()),
            circuit,
            _circuits: circuits,
        }
    }

    fn kill_timer(fx: &Fixture) -> Arc<KillTimer> {
        let evictor: Arc<dyn CircuitEvictor> = fx.evictor.clone();
        KillTimer::new(
            &fx.queue,
            Arc::downgrade(&evictor),
            fx.circuit,
            3,
            Duration::from_secs(30),
        )
        .expect("创建 Kill Timer")
    }

    /// 连续两次 `start` 只登记一个排期。
    #[test]
    #[traced_test]
    fn start_twice_arms_exactly_one_timer() {
        let fx = fixture();
        let timer = kill_timer(&fx);
        assert!(timer.start(), "首次 start 应完成登记");
        assert!(!timer.start(), "重复 start 不得再次登记");
        assert_eq!(fx.queue.pending(), 1);

        fx.clock.advance(Duration::from_secs(30));
        fx.queue.process(fx.clock.now());
        assert_eq!(*fx.evictor.evicted.lock(), vec![(fx.circuit, 3)]);
        assert!(logs_contain("kill timer fired"));
    }

    /// 触发后门闩归零：再次调用 `expire` 不会重复驱逐。
    #[test]
    fn firing_is_idempotent_until_rearmed() {
        let fx = fixture();
        let timer = kill_timer(&fx);
        timer.start();
        fx.clock.advance(Duration::from_secs(31));
        fx.queue.process(fx.clock.now());
        assert!(!timer.is_armed());
        assert_eq!(timer.expire(), Expire::Done);
        assert_eq!(fx.evictor.evicted.lock().len(), 1, "未重新装填不得二次驱逐");

        assert!(timer.start(), "显式重新装填应成功");
        timer.expire();
        assert_eq!(fx.evictor.evicted.lock().len(), 2);
    }

    /// 入站活动推迟截止时间；解除装填后既不排期也不驱逐。
    #[test]
    fn touch_defers_deadline_and_disarm_cancels() {
        let fx = fixture();
        let timer = kill_timer(&fx);
        timer.start();
        fx.clock.advance(Duration::from_secs(20));
        timer.touch();
        assert_eq!(timer.expires_at(), Some(fx.clock.now() + Duration::from_secs(30)));

        fx.clock.advance(Duration::from_secs(20));
        fx.queue.process(fx.clock.now());
        assert!(fx.evictor.evicted.lock().is_empty(), "被推迟的截止时间尚未到达");

        timer.disarm();
        assert_eq!(fx.queue.pending(), 0);
        timer.touch();
        assert_eq!(fx.queue.pending(), 0, "未装填时 touch 不得重新排期");
        assert_eq!(timer.expire(), Expire::Done);
        assert!(fx.evictor.evicted.lock().is_empty());
    }

    /// 上下文已释放时触发是安全的空操作。
    #[test]
    fn expire_after_evictor_dropped_is_noop() {
        let fx = fixture();
        let timer = {
            let evictor: Arc<dyn CircuitEvictor> = Arc::new(RecordingEvictor::default());
            let timer = KillTimer::new(
                &fx.queue,
                Arc::downgrade(&evictor),
                fx.circuit,
                1,
                Duration::from_secs(1),
            )
            .expect("创建 Kill Timer");
            timer.start();
            timer
        };
        fx.clock.advance(Duration::from_secs(2));
        assert_eq!(fx.queue.process(fx.clock.now()), None);
        assert!(!timer.is_armed());
    }
}
