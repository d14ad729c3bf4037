//! 配置文件
//!
//! 一个 TOML 文件同时描述触发参数和同步链路：
//!
//! ```toml
//! [trigger]
//! use_steady_trigger = true
//! trigger_rate = 10.0
//! board_id = "a"
//!
//! [sync]
//! bind = "0.0.0.0:18900"
//! master = "192.168.1.10:18900"
//! ```
//!
//! 未指定 `--config` 时尝试读取 `<config_dir>/trigsync/config.toml`，不存在则使用默认值。
//! 命令行参数覆盖文件中的值。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use trigsync_sync::{ServerConfig, SyncClientConfig, SyncConfig};
use trigsync_trigger::{ConfigError, ConfigStore, FileConfigStore, StaticConfigStore, TriggerSettings};

/// 默认配置文件路径
pub fn default_config_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    path.push("trigsync");
    path.push("config.toml");
    Some(path)
}

/// `[sync]` 节
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// master 的监听地址
    pub bind: String,
    /// listener 连接的 master 地址
    pub master: String,
    /// listener 的订阅名
    pub name: String,
    pub client_timeout_secs: u64,
    pub max_clients: usize,
    pub heartbeat_interval_ms: u64,
    pub link_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:18900".to_string(),
            master: "127.0.0.1:18900".to_string(),
            name: "frontend".to_string(),
            client_timeout_secs: 30,
            max_clients: 64,
            heartbeat_interval_ms: 1000,
            link_timeout_ms: 3000,
            connect_timeout_ms: 2000,
        }
    }
}

impl SyncSection {
    pub fn coordinator_config(&self) -> SyncConfig {
        SyncConfig {
            client_timeout: Duration::from_secs(self.client_timeout_secs),
            ..Default::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_clients: self.max_clients,
            ..Default::default()
        }
    }

    pub fn client_config(&self) -> SyncClientConfig {
        SyncClientConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            link_timeout: Duration::from_millis(self.link_timeout_ms),
            ..Default::default()
        }
    }
}

/// 完整配置文件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub trigger: TriggerSettings,
    pub sync: SyncSection,
}

/// 已加载的配置及其来源
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: CliConfig,
    /// 配置文件路径（使用默认值时为 None）
    pub path: Option<PathBuf>,
}

impl LoadedConfig {
    /// 加载配置：显式路径必须存在，默认路径不存在时使用默认值
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Ok(Self {
                config: read_config(path)?,
                path: Some(path.to_path_buf()),
            });
        }

        match default_config_path() {
            Some(path) if path.exists() => Ok(Self {
                config: read_config(&path)?,
                path: Some(path),
            }),
            _ => {
                debug!("No config file, using defaults");
                Ok(Self {
                    config: CliConfig::default(),
                    path: None,
                })
            },
        }
    }

    /// 触发参数存储：有配置文件时每次 begin-of-run 重新读取文件
    pub fn trigger_store(&self, rate: Option<f64>) -> OverrideStore {
        let inner: Box<dyn ConfigStore> = match &self.path {
            Some(path) => Box::new(FileConfigStore::new(path)),
            None => Box::new(StaticConfigStore::new(self.config.trigger.clone())),
        };
        OverrideStore { inner, rate }
    }
}

fn read_config(path: &Path) -> Result<CliConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// 在底层存储之上应用命令行覆盖
pub struct OverrideStore {
    inner: Box<dyn ConfigStore>,
    rate: Option<f64>,
}

impl ConfigStore for OverrideStore {
    fn load(&self) -> Result<TriggerSettings, ConfigError> {
        let mut settings = self.inner.load()?;
        if let Some(rate) = self.rate {
            settings.trigger_rate = rate;
        }
        Ok(settings)
    }
}
