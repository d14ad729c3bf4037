//! 同步层错误类型定义

use crate::ClientId;
use std::time::Duration;
use thiserror::Error;
use trigsync_protocol::{ErrorCode, ProtocolError};

/// 同步层错误类型
#[derive(Error, Debug)]
pub enum SyncError {
    /// 协调器中没有该客户端（未订阅或已被清理）
    #[error("Unknown client id: {0}")]
    UnknownClient(ClientId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 在超时时间内没有收到 SubscribeAck
    #[error("No subscribe ack from coordinator within {0:?}")]
    ConnectTimeout(Duration),

    /// 协调器拒绝订阅
    #[error("Subscription rejected by coordinator (status {0})")]
    Rejected(u8),

    /// 协调器返回的错误报文
    #[error("Coordinator error {code:?}: {message}")]
    Remote { code: ErrorCode, message: String },

    /// 链路不可用
    #[error("Link to coordinator is not connected")]
    NotConnected,

    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
