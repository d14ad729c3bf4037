//! listen 命令
//!
//! 作为前端订阅 master 的触发，每个触发执行一次（模拟的）读出并记录采样时刻。
//! 链路丢失时自动重连。

use crate::config::LoadedConfig;
use crate::shutdown::Shutdown;
use anyhow::{Context, Result};
use clap::Args;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use trigsync_protocol::TriggerEvent;
use trigsync_sync::{
    PollOutcome, Readout, ReadoutError, SyncClient, SyncedFrontend, TriggerEndpoint,
};

/// listen 命令参数
#[derive(Args, Debug)]
pub struct ListenCommand {
    /// master 地址（覆盖配置）
    #[arg(short, long)]
    pub master: Option<String>,

    /// 订阅名（覆盖配置）
    #[arg(short, long)]
    pub name: Option<String>,

    /// 运行时长（秒），0 表示直到 Ctrl+C
    #[arg(short, long, default_value_t = 0)]
    pub duration: u64,

    /// 模拟每次读出的耗时（毫秒）
    #[arg(long, default_value_t = 0)]
    pub readout_ms: u64,

    /// 无触发时的轮询间隔（毫秒）
    #[arg(long, default_value_t = 1)]
    pub poll_ms: u64,

    /// 每次重连的最大尝试次数
    #[arg(long, default_value_t = 3)]
    pub reconnect_retries: u32,
}

/// 记录采样时刻的读出
struct LoggingReadout {
    delay: Duration,
}

impl Readout for LoggingReadout {
    fn read(&mut self, event: &TriggerEvent) -> Result<(), ReadoutError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        info!(
            "Trigger #{} fired at {:.6}s",
            event.sequence,
            event.fired_at_secs()
        );
        Ok(())
    }
}

impl ListenCommand {
    pub fn execute(&self, loaded: &LoadedConfig, shutdown: &Shutdown) -> Result<()> {
        let sync = &loaded.config.sync;
        let master = self.master.as_deref().unwrap_or(&sync.master);
        let name = self.name.as_deref().unwrap_or(&sync.name);

        let client = SyncClient::connect(master, name, sync.client_config())
            .with_context(|| format!("Failed to subscribe to master at {}", master))?;
        println!(
            "trigsync listener '{}' subscribed to {} as client {}. Press Ctrl+C to stop.",
            name,
            master,
            client.client_id()
        );

        let readout = LoggingReadout {
            delay: Duration::from_millis(self.readout_ms),
        };
        let mut frontend = SyncedFrontend::new(client, readout);
        frontend.begin_of_run();

        let poll_interval = Duration::from_millis(self.poll_ms);
        let deadline =
            (self.duration > 0).then(|| Instant::now() + Duration::from_secs(self.duration));
        while !shutdown.is_requested() && deadline.is_none_or(|d| Instant::now() < d) {
            match frontend.poll() {
                PollOutcome::Idle => thread::sleep(poll_interval),
                PollOutcome::Read(_) | PollOutcome::Failed(_) => {},
                PollOutcome::Disconnected => {
                    warn!("Link to master lost, reconnecting");
                    let retry_interval = frontend.endpoint().config().heartbeat_interval;
                    if let Err(e) = frontend
                        .endpoint_mut()
                        .reconnect_with_retry(self.reconnect_retries, retry_interval)
                    {
                        warn!("Reconnect failed: {}", e);
                        if shutdown.sleep(retry_interval) {
                            break;
                        }
                    }
                },
            }
        }

        frontend.end_of_run();
        let stats = frontend.endpoint().stats();
        info!(
            "Listener stopped: read={} errors={} overwritten={} discarded={} stale={}",
            frontend.events_read(),
            frontend.readout_errors(),
            stats.endpoint.overwritten,
            stats.endpoint.discarded,
            stats.stale_dropped
        );
        if !frontend.endpoint().is_connected() {
            warn!("Listener exited without a live link to the master");
        }
        Ok(())
    }
}
