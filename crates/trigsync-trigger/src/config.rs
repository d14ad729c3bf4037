//! 触发配置
//!
//! `TriggerSettings` 是配置存储中的原始键值（JSON 中也接受 `use-steady-trigger`），
//! `TriggerConfig` 是校验后的不可变运行配置。转换在 begin-of-run 时进行，
//! 任何非法值都在启动线程之前报错，不会静默使用默认值。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use trigsync_protocol::{BoardId, ProtocolError};

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid trigger rate: {0} Hz (must be finite and > 0)")]
    InvalidRate(f64),

    #[error("Invalid resolution: {0} us (must be > 0)")]
    InvalidResolution(u32),

    #[error("Invalid board id: {0}")]
    InvalidBoard(#[from] ProtocolError),

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported config format: {0:?} (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),
}

/// 配置存储中的原始触发参数
///
/// 字段名即存储中的键名。缺失的键使用默认值，但值本身的合法性
/// 由 [`TriggerConfig::try_from`] 检查。
///
/// # Example
///
/// ```
/// use trigsync_trigger::TriggerSettings;
///
/// let settings: TriggerSettings = toml::from_str(
///     r#"
///     trigger_rate = 10.0
///     board_id = "b"
///     "#,
/// )
/// .unwrap();
/// assert_eq!(settings.board_id, "b");
/// assert_eq!(settings.resolution_us, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    /// 是否由本进程产生稳定触发
    #[serde(alias = "use-steady-trigger")]
    pub use_steady_trigger: bool,
    /// 目标触发频率（Hz）
    pub trigger_rate: f64,
    /// 板卡标识（`a`..`d`）
    pub board_id: String,
    /// 轮询睡眠粒度（微秒）
    pub resolution_us: u32,
    /// 板卡上的数字 I/O 端口
    pub trigger_port: u32,
    /// 通道掩码
    pub trigger_mask: u32,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            use_steady_trigger: true,
            trigger_rate: 10.0,
            board_id: "a".to_string(),
            resolution_us: 100,
            trigger_port: 6,
            trigger_mask: 0xff,
        }
    }
}

/// 校验后的触发配置（运行期间不可变）
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub rate_hz: f64,
    pub board_id: BoardId,
    pub channel_mask: u32,
    pub resolution_us: u32,
    pub port: u32,
}

impl TriggerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate_hz.is_finite() || self.rate_hz <= 0.0 {
            return Err(ConfigError::InvalidRate(self.rate_hz));
        }
        if self.resolution_us == 0 {
            return Err(ConfigError::InvalidResolution(self.resolution_us));
        }
        if self.period_us() < self.resolution_us as u64 {
            warn!(
                "Trigger period {} us is shorter than the polling resolution {} us; \
                 the achieved rate will be limited by the resolution",
                self.period_us(),
                self.resolution_us
            );
        }
        Ok(())
    }

    /// 触发周期（微秒），`1_000_000 / rate_hz` 向下取整，至少为 1
    pub fn period_us(&self) -> u64 {
        ((1.0e6 / self.rate_hz) as u64).max(1)
    }

    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us())
    }

    pub fn resolution(&self) -> Duration {
        Duration::from_micros(self.resolution_us as u64)
    }
}

impl TryFrom<&TriggerSettings> for TriggerConfig {
    type Error = ConfigError;

    fn try_from(settings: &TriggerSettings) -> Result<Self, Self::Error> {
        let config = TriggerConfig {
            rate_hz: settings.trigger_rate,
            board_id: settings.board_id.parse()?,
            channel_mask: settings.trigger_mask,
            resolution_us: settings.resolution_us,
            port: settings.trigger_port,
        };
        config.validate()?;
        Ok(config)
    }
}
