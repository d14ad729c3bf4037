//! 模拟触发板卡
//!
//! 没有数字 I/O 硬件时使用：记录每次发射的时刻与掩码，并支持故障注入。
//! 板卡本身会被移交给控制器线程，测试通过 [`BoardProbe`] 在外部观察。

use crate::{BoardError, BoardErrorKind, TriggerBoard};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use trigsync_protocol::BoardId;
use tracing::trace;

#[derive(Debug)]
struct Shared {
    pulses: AtomicU64,
    failures: AtomicU64,
    last_mask: AtomicU32,
    fail_next: AtomicU32,
    fail_always: AtomicBool,
    fired_at: Mutex<Vec<Instant>>,
}

/// 模拟板卡
#[derive(Debug)]
pub struct SimulatedBoard {
    board_id: BoardId,
    port: u32,
    shared: Arc<Shared>,
}

impl SimulatedBoard {
    pub fn new(board_id: BoardId, port: u32) -> Self {
        Self {
            board_id,
            port,
            shared: Arc::new(Shared {
                pulses: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                last_mask: AtomicU32::new(0),
                fail_next: AtomicU32::new(0),
                fail_always: AtomicBool::new(false),
                fired_at: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn board_id(&self) -> BoardId {
        self.board_id
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// 获取观察句柄（可在板卡移交后继续使用）
    pub fn probe(&self) -> BoardProbe {
        BoardProbe {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl TriggerBoard for SimulatedBoard {
    fn fire_pulses(&mut self, mask: u32) -> Result<(), BoardError> {
        let shared = &self.shared;

        let injected = shared
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected || shared.fail_always.load(Ordering::Acquire) {
            shared.failures.fetch_add(1, Ordering::Relaxed);
            return Err(BoardError::new(
                BoardErrorKind::Io,
                format!("simulated misfire on board {} port {}", self.board_id, self.port),
            ));
        }

        shared.fired_at.lock().push(Instant::now());
        shared.last_mask.store(mask, Ordering::Relaxed);
        shared.pulses.fetch_add(1, Ordering::Release);
        trace!(board = %self.board_id, port = self.port, mask, "pulse");
        Ok(())
    }
}

/// [`SimulatedBoard`] 的外部观察与故障注入句柄
#[derive(Debug, Clone)]
pub struct BoardProbe {
    shared: Arc<Shared>,
}

impl BoardProbe {
    /// 成功发射的次数
    pub fn pulses(&self) -> u64 {
        self.shared.pulses.load(Ordering::Acquire)
    }

    /// 注入故障的次数
    pub fn failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    pub fn last_mask(&self) -> u32 {
        self.shared.last_mask.load(Ordering::Relaxed)
    }

    /// 每次成功发射的时刻（按发射顺序）
    pub fn fired_at(&self) -> Vec<Instant> {
        self.shared.fired_at.lock().clone()
    }

    /// 让接下来的 `n` 次发射失败
    pub fn fail_next(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::Release);
    }

    /// 持续失败开关
    pub fn set_fail_always(&self, fail: bool) {
        self.shared.fail_always.store(fail, Ordering::Release);
    }
}
