//! 运行状态定义
//!
//! 控制器线程与外部控制方之间共享的运行状态。只有控制器写入，
//! 其他线程通过 [`RunStateHandle`] 只读观察。

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// 触发循环运行状态
///
/// - **Stopped**: 循环退出（或尚未启动）
/// - **Running**: 按周期发射触发
/// - **Paused**: 循环保持存活但不发射，恢复时无需重新握手
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RunState {
    #[default]
    Stopped = 0,
    Running = 1,
    Paused = 2,
}

impl RunState {
    /// 从 u8 转换，无效值视为 Stopped
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Paused,
            _ => Self::Stopped,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    pub fn is_paused(self) -> bool {
        self == Self::Paused
    }

    pub fn is_stopped(self) -> bool {
        self == Self::Stopped
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// 运行状态（原子版本，用于线程间共享）
#[derive(Debug)]
pub struct AtomicRunState {
    inner: AtomicU8,
}

impl AtomicRunState {
    pub fn new(state: RunState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self, ordering: Ordering) -> RunState {
        RunState::from_u8(self.inner.load(ordering))
    }

    pub fn set(&self, state: RunState, ordering: Ordering) {
        self.inner.store(state.as_u8(), ordering);
    }

    /// 比较并交换
    ///
    /// 当前值等于 `current` 时设置为 `new` 并返回 true，否则返回 false。
    pub fn compare_exchange(
        &self,
        current: RunState,
        new: RunState,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.inner
            .compare_exchange(current.as_u8(), new.as_u8(), success, failure)
            .is_ok()
    }
}

impl Default for AtomicRunState {
    fn default() -> Self {
        Self::new(RunState::Stopped)
    }
}

/// 运行状态的只读句柄
///
/// 可自由克隆并跨线程传递；读取的是控制器写入的最新值。
#[derive(Debug, Clone)]
pub struct RunStateHandle {
    inner: Arc<AtomicRunState>,
}

impl RunStateHandle {
    pub(crate) fn new(inner: Arc<AtomicRunState>) -> Self {
        Self { inner }
    }

    pub fn get(&self) -> RunState {
        self.inner.get(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.get().is_running()
    }
}
