//! 发射节拍器
//!
//! 纯函数式的节拍判断：只依赖传入的时钟读数，不睡眠、不访问硬件。
//! 控制器线程每次循环调用一次 [`Pacer::poll`]，根据结果决定发射还是睡眠。
//!
//! 判断依据是“距上次发射的经过时间”，而不是“下一次的计划时刻”。
//! 因此长时间暂停后恢复只会发射一次，不会补发积压的触发。

use crate::config::TriggerConfig;

/// 单次轮询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// 应当立即发射；`lateness_us` 为超过周期的时间
    Fire { lateness_us: u64 },
    /// 未到周期，睡眠一个分辨率后再查
    Wait,
}

/// 发射节拍器
#[derive(Debug, Clone)]
pub struct Pacer {
    period_us: u64,
    resolution_us: u64,
    last_fired_us: u64,
}

impl Pacer {
    /// 创建节拍器，`start_us` 作为首次发射的计时起点
    pub fn new(period_us: u64, resolution_us: u64, start_us: u64) -> Self {
        Self {
            period_us: period_us.max(1),
            resolution_us: resolution_us.max(1),
            last_fired_us: start_us,
        }
    }

    pub fn from_config(config: &TriggerConfig, start_us: u64) -> Self {
        Self::new(config.period_us(), config.resolution_us as u64, start_us)
    }

    pub fn period_us(&self) -> u64 {
        self.period_us
    }

    pub fn resolution_us(&self) -> u64 {
        self.resolution_us
    }

    pub fn last_fired_us(&self) -> u64 {
        self.last_fired_us
    }

    /// 最早的下一次发射时刻
    pub fn next_due_us(&self) -> u64 {
        self.last_fired_us.saturating_add(self.period_us)
    }

    pub fn is_due(&self, now_us: u64) -> bool {
        now_us.saturating_sub(self.last_fired_us) >= self.period_us
    }

    /// 判断是否发射；发射时把计时起点移到 `now_us`
    pub fn poll(&mut self, now_us: u64) -> Tick {
        let elapsed = now_us.saturating_sub(self.last_fired_us);
        if elapsed < self.period_us {
            return Tick::Wait;
        }
        self.last_fired_us = now_us;
        Tick::Fire {
            lateness_us: elapsed - self.period_us,
        }
    }
}
