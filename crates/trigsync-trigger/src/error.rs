//! 触发层错误类型定义

use crate::config::ConfigError;
use thiserror::Error;
use trigsync_board::BoardError;

/// 触发层错误类型
#[derive(Error, Debug)]
pub enum TriggerError {
    /// 配置错误（在启动任何线程之前返回）
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 板卡打开失败
    #[error("Board error: {0}")]
    Board(#[from] BoardError),

    /// 触发线程创建失败
    #[error("Failed to spawn trigger thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// 触发线程 panic
    #[error("Trigger thread panicked")]
    ThreadPanicked,

    /// 已有运行中的触发循环
    #[error("A run is already in progress")]
    AlreadyRunning,
}
