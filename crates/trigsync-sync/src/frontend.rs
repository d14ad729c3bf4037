//! 受触发同步的前端
//!
//! 读出循环：轮询触发 → 报告忙 → 读出 → 重新报告就绪。
//! 读出失败只计数并记录日志，前端仍重新报告就绪，不会卡在忙状态。

use crate::endpoint::TriggerEndpoint;
use thiserror::Error;
use tracing::{debug, info, warn};
use trigsync_protocol::TriggerEvent;

/// 读出错误
#[derive(Error, Debug)]
pub enum ReadoutError {
    #[error("Readout failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 一次触发对应的读出动作（数字化仪、ADC 等）
pub trait Readout: Send {
    fn read(&mut self, event: &TriggerEvent) -> Result<(), ReadoutError>;
}

impl<F> Readout for F
where
    F: FnMut(&TriggerEvent) -> Result<(), ReadoutError> + Send,
{
    fn read(&mut self, event: &TriggerEvent) -> Result<(), ReadoutError> {
        self(event)
    }
}

/// 单次轮询的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// 没有新触发
    Idle,
    /// 完成一次读出
    Read(TriggerEvent),
    /// 读出失败
    Failed(TriggerEvent),
    /// 链路不可用
    Disconnected,
}

/// 受触发同步的前端
pub struct SyncedFrontend<E: TriggerEndpoint, R: Readout> {
    endpoint: E,
    readout: R,
    running: bool,
    events_read: u64,
    readout_errors: u64,
    last_event: Option<TriggerEvent>,
}

impl<E: TriggerEndpoint, R: Readout> SyncedFrontend<E, R> {
    pub fn new(endpoint: E, readout: R) -> Self {
        Self {
            endpoint,
            readout,
            running: false,
            events_read: 0,
            readout_errors: 0,
            last_event: None,
        }
    }

    /// 开始运行：报告就绪
    pub fn begin_of_run(&mut self) {
        self.running = true;
        self.events_read = 0;
        self.readout_errors = 0;
        self.endpoint.set_ready();
        info!("Frontend run started");
    }

    /// 结束运行：报告忙，不再接受触发
    pub fn end_of_run(&mut self) {
        self.running = false;
        self.endpoint.unset_ready();
        info!(
            "Frontend run ended: {} event(s) read, {} readout error(s)",
            self.events_read, self.readout_errors
        );
    }

    /// 轮询一次，有触发时执行读出
    pub fn poll(&mut self) -> PollOutcome {
        if !self.endpoint.is_connected() {
            // 让端点丢弃链路丢失前的待处理触发
            let _ = self.endpoint.take_trigger();
            return PollOutcome::Disconnected;
        }
        let Some(event) = self.endpoint.take_trigger() else {
            return PollOutcome::Idle;
        };

        self.endpoint.unset_ready();
        let outcome = match self.readout.read(&event) {
            Ok(()) => {
                self.events_read += 1;
                debug!("Read out trigger #{}", event.sequence);
                PollOutcome::Read(event)
            },
            Err(e) => {
                self.readout_errors += 1;
                warn!("Readout of trigger #{} failed: {}", event.sequence, e);
                PollOutcome::Failed(event)
            },
        };
        self.last_event = Some(event);
        if self.running {
            self.endpoint.set_ready();
        }
        outcome
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn events_read(&self) -> u64 {
        self.events_read
    }

    pub fn readout_errors(&self) -> u64 {
        self.readout_errors
    }

    pub fn last_event(&self) -> Option<TriggerEvent> {
        self.last_event
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// 可变访问端点（例如链路丢失后重连）
    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    pub fn into_parts(self) -> (E, R) {
        (self.endpoint, self.readout)
    }
}
