//! 稳定触发前端的运行生命周期
//!
//! 把配置存储、板卡打开与触发控制器串成一次“运行”：
//!
//! - `init()`: 读取一次配置并记录
//! - `begin_of_run(run)`: 重新读取配置，`use_steady_trigger` 为真时打开板卡并启动控制器
//! - `pause_run()` / `resume_run()`: 暂停与恢复，不重建线程
//! - `end_of_run()`: 停止并等待触发线程退出
//!
//! 本进程也可以读取自己产生的触发（`poll_trigger` / `read_trigger`），
//! 用于 master 自身也要读出数据的场景。不读取时只保留最新一个触发，不会堆积。

use crate::config::{TriggerConfig, TriggerSettings};
use crate::controller::TriggerController;
use crate::error::TriggerError;
use crate::metrics::MetricsSnapshot;
use crate::publisher::{LatestTrigger, TriggerPublisher};
use crate::state::RunState;
use crate::store::ConfigStore;
use std::sync::Arc;
use tracing::{debug, info};
use trigsync_board::{BoardError, TriggerBoard};
use trigsync_protocol::{TriggerEvent, TriggerSink};

/// 按配置打开板卡
pub type BoardOpener =
    Box<dyn FnMut(&TriggerConfig) -> Result<Box<dyn TriggerBoard>, BoardError> + Send>;

/// 稳定触发前端
pub struct SteadyTrigger {
    store: Box<dyn ConfigStore>,
    open_board: BoardOpener,
    sinks: Vec<Arc<dyn TriggerSink>>,
    settings: Option<TriggerSettings>,
    controller: Option<TriggerController>,
    local: Arc<LatestTrigger>,
    last_read: Option<TriggerEvent>,
    run_number: Option<u32>,
}

impl SteadyTrigger {
    pub fn new<S, F>(store: S, open_board: F) -> Self
    where
        S: ConfigStore + 'static,
        F: FnMut(&TriggerConfig) -> Result<Box<dyn TriggerBoard>, BoardError> + Send + 'static,
    {
        Self {
            store: Box::new(store),
            open_board: Box::new(open_board),
            sinks: Vec::new(),
            settings: None,
            controller: None,
            local: Arc::new(LatestTrigger::new()),
            last_read: None,
            run_number: None,
        }
    }

    /// 注册下游 sink（对之后开始的运行生效）
    pub fn add_sink(&mut self, sink: Arc<dyn TriggerSink>) {
        self.sinks.push(sink);
    }

    /// 读取并记录配置
    pub fn init(&mut self) -> Result<(), TriggerError> {
        let settings = self.store.load()?;
        info!(
            "Steady trigger initialised: enabled={} rate={} Hz board={} port={} mask=0x{:X}",
            settings.use_steady_trigger,
            settings.trigger_rate,
            settings.board_id,
            settings.trigger_port,
            settings.trigger_mask
        );
        self.settings = Some(settings);
        Ok(())
    }

    /// 最近一次读取的配置
    pub fn settings(&self) -> Option<&TriggerSettings> {
        self.settings.as_ref()
    }

    /// 开始一次运行
    ///
    /// 返回是否启动了触发线程（`use_steady_trigger` 为假时不启动）。
    /// 配置非法或板卡打开失败时返回错误，不会启动线程。
    pub fn begin_of_run(&mut self, run: u32) -> Result<bool, TriggerError> {
        if self.controller.is_some() {
            return Err(TriggerError::AlreadyRunning);
        }

        let settings = self.store.load()?;
        let enabled = settings.use_steady_trigger;
        let config = TriggerConfig::try_from(&settings)?;
        self.settings = Some(settings);
        self.last_read = None;
        self.local.clear();

        if !enabled {
            info!("Run {}: steady trigger disabled, not starting", run);
            return Ok(false);
        }

        let board = (self.open_board)(&config)?;

        let mut publisher = TriggerPublisher::new();
        for sink in &self.sinks {
            publisher.add_sink(Arc::clone(sink));
        }
        publisher.add_sink(self.local.clone());

        let controller = TriggerController::start(config, board, publisher)?;
        info!("Run {}: steady trigger started", run);

        self.controller = Some(controller);
        self.run_number = Some(run);
        Ok(true)
    }

    pub fn pause_run(&self) -> bool {
        self.controller.as_ref().is_some_and(TriggerController::pause)
    }

    pub fn resume_run(&self) -> bool {
        self.controller.as_ref().is_some_and(TriggerController::resume)
    }

    /// 结束运行（停止并等待触发线程退出）
    pub fn end_of_run(&mut self) -> Result<(), TriggerError> {
        let Some(mut controller) = self.controller.take() else {
            debug!("end_of_run without an active trigger loop");
            return Ok(());
        };
        controller.stop()?;

        let metrics = controller.metrics();
        info!(
            "Run {}: steady trigger ended after {} triggers ({} errors, {:.1}%)",
            self.run_number.unwrap_or_default(),
            metrics.fired_total,
            metrics.fire_errors,
            metrics.error_rate()
        );
        Ok(())
    }

    /// 是否有尚未读取的触发
    pub fn poll_trigger(&self) -> bool {
        self.local.is_pending()
    }

    /// 读取最新的触发（每个触发只能读取一次）
    pub fn read_trigger(&mut self) -> Option<TriggerEvent> {
        let latest = self.local.take()?;
        self.last_read = Some(latest);
        Some(latest)
    }

    /// 最近一次触发（未读取的也算）
    pub fn last_trigger(&self) -> Option<TriggerEvent> {
        self.controller
            .as_ref()
            .and_then(TriggerController::last_event)
            .or(self.last_read)
    }

    pub fn run_state(&self) -> RunState {
        self.controller
            .as_ref()
            .map_or(RunState::Stopped, TriggerController::run_state)
    }

    pub fn is_active(&self) -> bool {
        self.controller.is_some()
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.controller.as_ref().map(TriggerController::metrics)
    }
}

impl std::fmt::Debug for SteadyTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SteadyTrigger")
            .field("settings", &self.settings)
            .field("run_state", &self.run_state())
            .field("run_number", &self.run_number)
            .finish()
    }
}
