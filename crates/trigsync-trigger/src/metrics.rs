//! 触发循环指标
//!
//! 原子计数器，控制器线程写入，任意线程读取快照，不引入锁竞争。
//! 每次运行启动新的控制器，计数器随之从零开始。

use std::sync::atomic::{AtomicU64, Ordering};

/// 触发循环实时指标
#[derive(Debug, Default)]
pub struct TriggerMetrics {
    /// 成功发射的脉冲数
    pub fired_total: AtomicU64,

    /// 板卡发射失败次数（失败的脉冲不重试、不发布事件）
    pub fire_errors: AtomicU64,

    /// 已发布的触发事件数
    pub events_published: AtomicU64,

    /// 本地订阅者通道已满而丢弃的事件数
    pub local_dropped: AtomicU64,

    /// 最大发射延迟（超过周期的微秒数）
    ///
    /// 持续偏大说明分辨率过粗或线程被抢占。
    pub max_lateness_us: AtomicU64,
}

impl TriggerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_lateness(&self, lateness_us: u64) {
        self.max_lateness_us.fetch_max(lateness_us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            fired_total: self.fired_total.load(Ordering::Relaxed),
            fire_errors: self.fire_errors.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            local_dropped: self.local_dropped.load(Ordering::Relaxed),
            max_lateness_us: self.max_lateness_us.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub fired_total: u64,
    pub fire_errors: u64,
    pub events_published: u64,
    pub local_dropped: u64,
    pub max_lateness_us: u64,
}

impl MetricsSnapshot {
    /// 发射失败率（百分比），无尝试时为 0
    pub fn error_rate(&self) -> f64 {
        let attempts = self.fired_total + self.fire_errors;
        if attempts == 0 {
            return 0.0;
        }
        (self.fire_errors as f64 / attempts as f64) * 100.0
    }
}
