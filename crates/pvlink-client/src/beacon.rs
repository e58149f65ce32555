//! 服务器信标的异常检测。
//!
//! # 教案式说明
//! - **Why**：服务器重启或网段恢复后，仍在退避中的搜索可能要等到上限周期才会再发一次；
//!   信标节奏的突变是“有服务器刚刚可达”的廉价信号，借此把搜索退避复位；
//! - **How**：按服务器地址记录上一次信标的时间、序号与平滑后的平均周期；
//!   - 序号停滞、回退或只前进 2~3 视为重复路由或排队溢出，整条丢弃；
//!   - 第二次看到信标时只建立平均周期；若首个信标在程序启动之后才出现，则视为新服务器；
//!   - 之后周期不短于平均值 3.25 倍（连续丢失）或不长于 0.8 倍（重启后的密集信标）即为异常；
//!   - 平均周期按 1/8 权重滑动；
//! - **What**：[`BeaconTracker::observe`] 返回本次信标是否构成异常。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// 序号落后这么多以内按“重复”处理。
const DUPLICATE_WINDOW: u32 = 256;

struct BeaconEntry {
    last_seen: Instant,
    last_id: u32,
    average: Option<Duration>,
}

pub(crate) struct BeaconTracker {
    started: Instant,
    servers: HashMap<SocketAddr, BeaconEntry>,
}

impl BeaconTracker {
    pub(crate) fn new(started: Instant) -> Self {
        Self {
            started,
            servers: HashMap::new(),
        }
    }

    /// 记录一次信标，返回它是否意味着网络拓扑发生了变化。
    pub(crate) fn observe(&mut self, server: SocketAddr, beacon_id: u32, now: Instant) -> bool {
        let Some(entry) = self.servers.get_mut(&server) else {
            self.servers.insert(
                server,
                BeaconEntry {
                    last_seen: now,
                    last_id: beacon_id,
                    average: None,
                },
            );
            return false;
        };

        let advance = beacon_id.wrapping_sub(entry.last_id);
        entry.last_id = beacon_id;
        if advance == 0 || advance > u32::MAX - DUPLICATE_WINDOW || (2..4).contains(&advance) {
            return false;
        }

        let period = now.saturating_duration_since(entry.last_seen);
        let anomaly = match entry.average {
            None => {
                entry.average = Some(period);
                // 程序刚启动时陆续听到的老服务器不算变化。
                period <= entry.last_seen.saturating_duration_since(self.started)
            }
            Some(average) => {
                let anomaly = period >= average.mul_f64(3.25) || period <= average.mul_f64(0.8);
                entry.average = Some(period.mul_f64(0.125) + average.mul_f64(0.875));
                anomaly
            }
        };
        entry.last_seen = now;
        anomaly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 5064))
    }

    #[test]
    fn steady_beacons_are_not_anomalies() {
        let started = Instant::now();
        let mut tracker = BeaconTracker::new(started);
        let period = Duration::from_secs(15);
        let mut now = started;
        for id in 0..6 {
            assert!(!tracker.observe(server(), id, now), "第 {id} 个信标节奏稳定");
            now += period;
        }
        assert_eq!(tracker.servers.len(), 1);
    }

    #[test]
    fn restart_burst_and_long_silence_are_anomalies() {
        let started = Instant::now();
        let mut tracker = BeaconTracker::new(started);
        let mut now = started;
        for id in 0..3 {
            tracker.observe(server(), id, now);
            now += Duration::from_secs(15);
        }
        // 重启后的服务器从新序号开始密集广播。
        now -= Duration::from_secs(13);
        assert!(tracker.observe(server(), 3, now), "周期骤降");

        let mut tracker = BeaconTracker::new(started);
        let mut now = started;
        for id in 0..3 {
            tracker.observe(server(), id, now);
            now += Duration::from_secs(15);
        }
        now += Duration::from_secs(60);
        assert!(tracker.observe(server(), 3, now), "连续丢失多个信标后重新出现");
    }

    #[test]
    fn duplicate_or_skipped_ids_are_discarded() {
        let started = Instant::now();
        let mut tracker = BeaconTracker::new(started);
        let now = started + Duration::from_secs(100);
        tracker.observe(server(), 10, now);
        assert!(!tracker.observe(server(), 10, now + Duration::from_millis(1)), "重复");
        assert!(!tracker.observe(server(), 12, now + Duration::from_millis(2)), "跳号 2");
        assert!(!tracker.observe(server(), 11, now + Duration::from_millis(3)), "回退");
    }

    #[test]
    fn server_appearing_after_startup_is_a_change() {
        let started = Instant::now();
        let mut tracker = BeaconTracker::new(started);
        let first = started + Duration::from_secs(120);
        assert!(!tracker.observe(server(), 0, first));
        assert!(
            tracker.observe(server(), 1, first + Duration::from_secs(15)),
            "启动两分钟后才出现的服务器是新上线的"
        );

        let mut tracker = BeaconTracker::new(started);
        let first = started + Duration::from_secs(1);
        tracker.observe(server(), 0, first);
        assert!(
            !tracker.observe(server(), 1, first + Duration::from_secs(15)),
            "启动时就在的服务器不算变化"
        );
    }
}
