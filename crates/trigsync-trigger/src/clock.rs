//! 单调时钟
//!
//! 触发时刻统一用“进程启动以来的微秒数”表示：
//! - 单调递增，不受系统时间调整（NTP、手动修改）影响
//! - 可直接存入 `AtomicU64`，无锁读写
//!
//! 测试使用 [`ManualClock`] 手动推进时间。

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// 单调时间锚点，首次访问时设置，之后不变
static PROCESS_START: OnceLock<std::time::Instant> = OnceLock::new();

/// 进程单调时钟的当前读数（微秒）
pub fn monotonic_micros() -> u64 {
    let start = PROCESS_START.get_or_init(std::time::Instant::now);
    start.elapsed().as_micros() as u64
}

/// 时钟抽象
pub trait Clock: Send + Sync {
    /// 当前时刻（微秒，单调）
    fn now_us(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }
}

/// 基于 [`monotonic_micros`] 的真实时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        monotonic_micros()
    }
}

/// 手动推进的时钟
///
/// # Example
///
/// ```
/// use trigsync_trigger::{Clock, ManualClock};
///
/// let clock = ManualClock::new(0);
/// clock.advance(250);
/// assert_eq!(clock.now_us(), 250);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(start_us),
        }
    }

    /// 前进 `delta_us` 微秒，返回新的读数
    pub fn advance(&self, delta_us: u64) -> u64 {
        self.now_us.fetch_add(delta_us, Ordering::AcqRel) + delta_us
    }

    /// 直接设置读数（不允许倒退）
    pub fn set(&self, now_us: u64) {
        self.now_us.fetch_max(now_us, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::Acquire)
    }
}
