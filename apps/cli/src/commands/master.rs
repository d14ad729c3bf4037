//! master 命令
//!
//! 启动同步服务端和稳定触发（模拟板卡），执行一次运行，直到 Ctrl+C 或时长到期。

use crate::config::LoadedConfig;
use crate::shutdown::Shutdown;
use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use trigsync_board::{BoardError, SimulatedBoard, TriggerBoard};
use trigsync_sync::{SyncCoordinator, SyncServer};
use trigsync_trigger::{SteadyTrigger, TriggerConfig};

/// master 命令参数
#[derive(Args, Debug)]
pub struct MasterCommand {
    /// 监听地址（覆盖配置）
    #[arg(short, long)]
    pub bind: Option<String>,

    /// 触发频率 Hz（覆盖配置）
    #[arg(short, long)]
    pub rate: Option<f64>,

    /// 运行时长（秒），0 表示直到 Ctrl+C
    #[arg(short, long, default_value_t = 0)]
    pub duration: u64,

    /// 运行号
    #[arg(long, default_value_t = 1)]
    pub run: u32,

    /// 指标打印间隔（秒）
    #[arg(long, default_value_t = 5)]
    pub report_interval: u64,
}

impl MasterCommand {
    pub fn execute(&self, loaded: &LoadedConfig, shutdown: &Shutdown) -> Result<()> {
        let sync = &loaded.config.sync;
        let bind = self.bind.as_deref().unwrap_or(&sync.bind);

        let coordinator = Arc::new(SyncCoordinator::new(sync.coordinator_config()));
        let mut server = SyncServer::bind(bind, Arc::clone(&coordinator), sync.server_config())
            .with_context(|| format!("Failed to start sync server on {}", bind))?;

        let mut trigger = SteadyTrigger::new(
            loaded.trigger_store(self.rate),
            |config: &TriggerConfig| -> Result<Box<dyn TriggerBoard>, BoardError> {
                Ok(Box::new(SimulatedBoard::new(config.board_id, config.port)))
            },
        );
        trigger.add_sink(coordinator.clone());
        trigger.init().context("Failed to load trigger settings")?;

        let started = trigger
            .begin_of_run(self.run)
            .with_context(|| format!("Failed to begin run {}", self.run))?;
        if !started {
            warn!("use_steady_trigger is false: serving subscribers without generating triggers");
        }

        println!(
            "trigsync master on {} (run {}). Press Ctrl+C to stop.",
            server.local_addr(),
            self.run
        );

        let start = Instant::now();
        let deadline = (self.duration > 0).then(|| start + Duration::from_secs(self.duration));
        let report_interval = Duration::from_secs(self.report_interval.max(1));
        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    report_interval.min(deadline - now)
                },
                None => report_interval,
            };
            if shutdown.sleep(wait) {
                break;
            }
            report(&trigger, &coordinator);
        }

        trigger.end_of_run().context("Failed to end run")?;
        server.shutdown();
        report(&trigger, &coordinator);
        info!("Master stopped after {:.1}s", start.elapsed().as_secs_f64());
        Ok(())
    }
}

fn report(trigger: &SteadyTrigger, coordinator: &SyncCoordinator) {
    let sync = coordinator.metrics();
    match trigger.metrics() {
        Some(metrics) => info!(
            "state={} fired={} errors={} ({:.1}%) max_lateness={}us clients={} delivered={} busy={:.1}%",
            trigger.run_state(),
            metrics.fired_total,
            metrics.fire_errors,
            metrics.error_rate(),
            metrics.max_lateness_us,
            coordinator.client_count(),
            sync.delivered,
            sync.busy_rate()
        ),
        None => info!(
            "state={} published={} clients={} delivered={} dropped_clients={}",
            trigger.run_state(),
            sync.published,
            coordinator.client_count(),
            sync.delivered,
            sync.clients_dropped
        ),
    }
    for client in coordinator.clients() {
        info!(
            "  client {} ({}): ready={} last=#{} failures={}",
            client.id, client.name, client.ready, client.last_sequence, client.consecutive_failures
        );
    }
}
