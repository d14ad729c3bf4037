//! 触发速率控制器
//!
//! 独占板卡句柄，在专用线程中按目标频率发射脉冲：
//!
//! ```text
//! start() ──► trigger_loop 线程
//!               │  Running: Pacer::poll(now) ─► Fire ─► board.fire_pulses(mask)
//!               │                              │         └► TriggerEvent ─► publisher
//!               │                              └► Wait ─► sleep(resolution)
//!               │  Paused:  sleep(min(resolution, 1ms))
//!               └  Stopped: 退出
//! ```
//!
//! 控制器是序号与 `last_fired_at` 的唯一写入者。`stop()` 在线程退出后才返回，
//! 之后不会再有任何脉冲。

use crate::clock::{Clock, MonotonicClock};
use crate::config::TriggerConfig;
use crate::error::TriggerError;
use crate::metrics::{MetricsSnapshot, TriggerMetrics};
use crate::pacer::{Pacer, Tick};
use crate::publisher::TriggerPublisher;
use crate::state::{AtomicRunState, RunState, RunStateHandle};
use spin_sleep::SpinSleeper;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace};
use trigsync_board::TriggerBoard;
use trigsync_protocol::TriggerEvent;

/// 暂停时的最长睡眠时间
const PAUSED_SLEEP_CAP: Duration = Duration::from_millis(1);

/// 睡眠全部交给操作系统，不自旋；计时精度以 `resolution_us` 为下限
fn os_sleeper() -> SpinSleeper {
    SpinSleeper::new(0)
}

/// 控制器线程与外部共享的状态
#[derive(Debug, Default)]
struct Shared {
    metrics: TriggerMetrics,
    /// 最近一次成功发射的序号（0 表示尚未发射）
    last_sequence: AtomicU64,
    /// 最近一次成功发射的时刻（微秒）
    last_fired_us: AtomicU64,
}

/// 触发速率控制器
///
/// # Example
///
/// ```no_run
/// use trigsync_board::SimulatedBoard;
/// use trigsync_protocol::BoardId;
/// use trigsync_trigger::{TriggerConfig, TriggerController, TriggerPublisher};
///
/// let config = TriggerConfig {
///     rate_hz: 10.0,
///     board_id: BoardId::A,
///     channel_mask: 0xff,
///     resolution_us: 100,
///     port: 6,
/// };
/// let board = SimulatedBoard::new(config.board_id, config.port);
/// let mut controller = TriggerController::start(config, board, TriggerPublisher::new())?;
/// std::thread::sleep(std::time::Duration::from_secs(1));
/// controller.stop()?;
/// # Ok::<(), trigsync_trigger::TriggerError>(())
/// ```
#[derive(Debug)]
pub struct TriggerController {
    config: TriggerConfig,
    shared: Arc<Shared>,
    state: Arc<AtomicRunState>,
    thread: Option<JoinHandle<()>>,
}

impl TriggerController {
    /// 使用进程单调时钟启动
    pub fn start<B>(
        config: TriggerConfig,
        board: B,
        publisher: TriggerPublisher,
    ) -> Result<Self, TriggerError>
    where
        B: TriggerBoard + 'static,
    {
        Self::start_with_clock(config, board, publisher, MonotonicClock)
    }

    /// 使用指定时钟启动
    ///
    /// 配置在创建线程之前校验；非法配置不会启动任何线程。
    pub fn start_with_clock<B, C>(
        config: TriggerConfig,
        board: B,
        publisher: TriggerPublisher,
        clock: C,
    ) -> Result<Self, TriggerError>
    where
        B: TriggerBoard + 'static,
        C: Clock + 'static,
    {
        config.validate()?;

        let shared = Arc::new(Shared::default());
        let state = Arc::new(AtomicRunState::new(RunState::Running));

        let loop_shared = Arc::clone(&shared);
        let loop_state = Arc::clone(&state);
        let loop_config = config.clone();
        let thread = thread::Builder::new()
            .name("trigger_loop".into())
            .spawn(move || {
                trigger_loop(board, publisher, loop_config, loop_state, loop_shared, clock);
            })
            .map_err(TriggerError::ThreadSpawn)?;

        info!(
            "Trigger controller started: board {} port {} mask 0x{:X}, {} Hz (period {} us, resolution {} us)",
            config.board_id,
            config.port,
            config.channel_mask,
            config.rate_hz,
            config.period_us(),
            config.resolution_us
        );

        Ok(Self {
            config,
            shared,
            state,
            thread: Some(thread),
        })
    }

    /// 暂停发射（线程保持存活）
    ///
    /// 仅在 Running 时生效，返回是否发生了切换。
    pub fn pause(&self) -> bool {
        let switched = self.state.compare_exchange(
            RunState::Running,
            RunState::Paused,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if switched {
            debug!("Trigger controller paused");
        }
        switched
    }

    /// 恢复发射
    ///
    /// 仅在 Paused 时生效。上次发射时刻保持不变，恢复后不会补发。
    pub fn resume(&self) -> bool {
        let switched = self.state.compare_exchange(
            RunState::Paused,
            RunState::Running,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if switched {
            debug!("Trigger controller resumed");
        }
        switched
    }

    /// 停止并等待线程退出（可重复调用）
    pub fn stop(&mut self) -> Result<(), TriggerError> {
        self.state.set(RunState::Stopped, Ordering::Release);

        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        if handle.join().is_err() {
            error!("Trigger thread panicked");
            return Err(TriggerError::ThreadPanicked);
        }

        let snapshot = self.metrics();
        info!(
            "Trigger controller stopped: {} fired, {} errors, max lateness {} us",
            snapshot.fired_total, snapshot.fire_errors, snapshot.max_lateness_us
        );
        Ok(())
    }

    pub fn run_state(&self) -> RunState {
        self.state.get(Ordering::Acquire)
    }

    /// 只读状态句柄
    pub fn state_handle(&self) -> RunStateHandle {
        RunStateHandle::new(Arc::clone(&self.state))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.config
    }

    /// 最近一次成功发射的事件
    ///
    /// 序号与时刻分别存放，读取期间恰好发生新的发射时可能取到相邻两次的组合，
    /// 仅用于显示。
    pub fn last_event(&self) -> Option<TriggerEvent> {
        let sequence = self.shared.last_sequence.load(Ordering::Acquire);
        if sequence == 0 {
            return None;
        }
        let fired_at_us = self.shared.last_fired_us.load(Ordering::Acquire);
        Some(TriggerEvent::new(sequence, fired_at_us))
    }
}

impl Drop for TriggerController {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Failed to stop trigger controller on drop: {}", e);
        }
    }
}

/// 触发线程主循环
fn trigger_loop<B, C>(
    mut board: B,
    mut publisher: TriggerPublisher,
    config: TriggerConfig,
    state: Arc<AtomicRunState>,
    shared: Arc<Shared>,
    clock: C,
) where
    B: TriggerBoard,
    C: Clock,
{
    let resolution = config.resolution();
    let paused_sleep = resolution.min(PAUSED_SLEEP_CAP);
    let sleeper = os_sleeper();
    let mut pacer = Pacer::from_config(&config, clock.now_us());
    let mut sequence: u64 = 0;
    let metrics = &shared.metrics;

    loop {
        // Acquire: 看到 Stopped 时，stop() 之前的写入都可见
        match state.get(Ordering::Acquire) {
            RunState::Stopped => {
                trace!("Trigger loop: stopped, exiting");
                break;
            },
            RunState::Paused => {
                sleeper.sleep(paused_sleep);
                continue;
            },
            RunState::Running => {},
        }

        let now = clock.now_us();
        let lateness_us = match pacer.poll(now) {
            Tick::Fire { lateness_us } => lateness_us,
            Tick::Wait => {
                sleeper.sleep(resolution);
                continue;
            },
        };

        // 失败的脉冲不重试，计时起点照常前移，不发布事件
        if let Err(e) = board.fire_pulses(config.channel_mask) {
            metrics.fire_errors.fetch_add(1, Ordering::Relaxed);
            error!(
                fatal = e.is_fatal(),
                "Failed to fire trigger on board {} port {}: {}", config.board_id, config.port, e
            );
            continue;
        }

        sequence += 1;
        metrics.fired_total.fetch_add(1, Ordering::Relaxed);
        metrics.record_lateness(lateness_us);
        shared.last_fired_us.store(now, Ordering::Release);
        shared.last_sequence.store(sequence, Ordering::Release);

        let event = TriggerEvent::new(sequence, now);
        let outcome = publisher.publish(&event);
        metrics.events_published.fetch_add(1, Ordering::Relaxed);
        if outcome.dropped > 0 {
            metrics
                .local_dropped
                .fetch_add(outcome.dropped as u64, Ordering::Relaxed);
        }
        trace!(sequence, fired_at_us = now, lateness_us, "trigger fired");
    }
}
