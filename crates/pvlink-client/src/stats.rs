use std::sync::atomic::{AtomicU64, Ordering};

/// 上下文运行统计的快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ContextStats {
    /// 已发出的名称查询条数。
    pub searches_sent: u64,
    /// 被采纳的查询应答数（重复与过期应答不计）。
    pub search_replies: u64,
    /// 因调用方已放弃或标识过期而丢弃的请求完成数。
    pub stale_completions: u64,
    pub kill_timer_evictions: u64,
    pub protocol_errors: u64,
    /// 同一 Circuit 第二次及以后进入 `Connected` 的次数。
    pub reconnects: u64,
    pub disconnects: u64,
    /// 发出的订阅下发报文数。
    pub subscriptions_armed: u64,
    /// 发出的订阅撤销报文数。
    pub subscriptions_cancelled: u64,
    /// 触发搜索复位的信标异常次数。
    pub beacon_anomalies: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) searches_sent: AtomicU64,
    pub(crate) search_replies: AtomicU64,
    pub(crate) stale_completions: AtomicU64,
    pub(crate) kill_timer_evictions: AtomicU64,
    pub(crate) protocol_errors: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) disconnects: AtomicU64,
    pub(crate) subscriptions_armed: AtomicU64,
    pub(crate) subscriptions_cancelled: AtomicU64,
    pub(crate) beacon_anomalies: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn add(counter: &AtomicU64, delta: u64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub(crate) fn snapshot(&self) -> ContextStats {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ContextStats {
            searches_sent: read(&self.searches_sent),
            search_replies: read(&self.search_replies),
            stale_completions: read(&self.stale_completions),
            kill_timer_evictions: read(&self.kill_timer_evictions),
            protocol_errors: read(&self.protocol_errors),
            reconnects: read(&self.reconnects),
            disconnects: read(&self.disconnects),
            subscriptions_armed: read(&self.subscriptions_armed),
            subscriptions_cancelled: read(&self.subscriptions_cancelled),
            beacon_anomalies: read(&self.beacon_anomalies),
        }
    }
}
