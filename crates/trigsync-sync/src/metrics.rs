//! 协调器指标

use std::sync::atomic::{AtomicU64, Ordering};

/// 协调器实时指标
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// publish() 调用次数（即收到的触发数）
    pub published: AtomicU64,
    /// 成功投递次数（按客户端计）
    pub delivered: AtomicU64,
    /// 投递失败次数
    pub delivery_failures: AtomicU64,
    /// 投递时客户端处于未就绪状态的次数
    ///
    /// 就绪只是提示，不会阻止投递；此计数反映慢速前端错过的触发。
    pub delivered_while_busy: AtomicU64,
    pub clients_registered: AtomicU64,
    /// 因连续投递失败或心跳超时被移除的客户端数
    pub clients_dropped: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            delivered_while_busy: self.delivered_while_busy.load(Ordering::Relaxed),
            clients_registered: self.clients_registered.load(Ordering::Relaxed),
            clients_dropped: self.clients_dropped.load(Ordering::Relaxed),
        }
    }
}

/// 协调器指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncMetricsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
    pub delivered_while_busy: u64,
    pub clients_registered: u64,
    pub clients_dropped: u64,
}

impl SyncMetricsSnapshot {
    /// 未就绪投递占比（百分比），无投递时为 0
    pub fn busy_rate(&self) -> f64 {
        if self.delivered == 0 {
            return 0.0;
        }
        (self.delivered_while_busy as f64 / self.delivered as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_busy_rate() {
        let metrics = SyncMetrics::new();
        assert_eq!(metrics.snapshot().busy_rate(), 0.0);

        metrics.delivered.fetch_add(4, Ordering::Relaxed);
        metrics.delivered_while_busy.fetch_add(1, Ordering::Relaxed);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.delivered, 4);
        assert!((snapshot.busy_rate() - 25.0).abs() < 1e-9);
    }
}
