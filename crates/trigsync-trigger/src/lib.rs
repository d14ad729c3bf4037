//! # trigsync Trigger
//!
//! 触发产生侧：按目标频率驱动触发板卡发射脉冲，并把每次发射作为
//! [`TriggerEvent`](trigsync_protocol::TriggerEvent) 发布出去。
//!
//! ## 模块
//!
//! - `config` / `store`: 触发参数与配置存储
//! - `pacer` / `clock`: 与硬件无关的节拍判断及时钟抽象
//! - `controller`: 独占板卡的触发线程
//! - `publisher`: 事件分发（sink、本地订阅与最新触发槽）
//! - `frontend`: 运行生命周期（begin/pause/resume/end of run）
//!
//! ## 线程模型
//!
//! 每个控制器一个触发线程，是序号与上次发射时刻的唯一写入者；
//! 运行状态通过原子变量共享，外部只能经由 [`RunStateHandle`] 读取。

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod frontend;
pub mod metrics;
pub mod pacer;
pub mod publisher;
pub mod state;
pub mod store;

pub use clock::{Clock, ManualClock, MonotonicClock, monotonic_micros};
pub use config::{ConfigError, TriggerConfig, TriggerSettings};
pub use controller::TriggerController;
pub use error::TriggerError;
pub use frontend::{BoardOpener, SteadyTrigger};
pub use metrics::{MetricsSnapshot, TriggerMetrics};
pub use pacer::{Pacer, Tick};
pub use publisher::{LatestTrigger, PublishOutcome, TriggerPublisher};
pub use state::{AtomicRunState, RunState, RunStateHandle};
pub use store::{ConfigStore, FileConfigStore, StaticConfigStore};
