//! 配置存储
//!
//! 触发参数的只读来源。在 init 与每次 begin-of-run 时读取一次。

use crate::config::{ConfigError, TriggerSettings};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 触发参数来源
pub trait ConfigStore: Send {
    fn load(&self) -> Result<TriggerSettings, ConfigError>;
}

/// 固定参数（测试或命令行覆盖）
#[derive(Debug, Clone, Default)]
pub struct StaticConfigStore {
    settings: TriggerSettings,
}

impl StaticConfigStore {
    pub fn new(settings: TriggerSettings) -> Self {
        Self { settings }
    }
}

impl ConfigStore for StaticConfigStore {
    fn load(&self) -> Result<TriggerSettings, ConfigError> {
        Ok(self.settings.clone())
    }
}

/// 文件配置（`.toml` 或 `.json`）
///
/// 参数可以放在顶层，也可以放在 `trigger` 节下：
///
/// ```toml
/// [trigger]
/// trigger_rate = 10.0
/// board_id = "a"
/// ```
///
/// 每次 `load()` 都重新读取文件，因此两次运行之间修改文件即可生效。
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<TriggerSettings, ConfigError> {
        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;

        let extension = self.path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let settings = match extension {
            "toml" => parse_toml(&content)?,
            "json" => parse_json(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat(self.path.clone())),
        };

        debug!("Loaded trigger settings from {}: {:?}", self.path.display(), settings);
        Ok(settings)
    }
}

fn parse_toml(content: &str) -> Result<TriggerSettings, ConfigError> {
    let mut table: toml::Table = toml::from_str(content)?;
    let settings = match table.remove("trigger") {
        Some(section) => section.try_into()?,
        None => toml::Value::Table(table).try_into()?,
    };
    Ok(settings)
}

fn parse_json(content: &str) -> Result<TriggerSettings, ConfigError> {
    let mut value: serde_json::Value = serde_json::from_str(content)?;
    let section = match value.get_mut("trigger").map(serde_json::Value::take) {
        Some(section) => section,
        None => value,
    };
    Ok(serde_json::from_value(section)?)
}
