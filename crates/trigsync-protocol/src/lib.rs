//! # trigsync Protocol
//!
//! 触发同步的共享类型定义（无硬件依赖、无线程）
//!
//! ## 模块
//!
//! - `event`: `TriggerEvent`、`BoardId` 与 `TriggerSink`
//! - `wire`: 协调器与前端之间的 UDP 报文编解码
//!
//! ## 字节序
//!
//! 线上格式统一使用小端字节序。

pub mod event;
pub mod wire;

pub use event::{BoardId, TriggerEvent, TriggerSink};
pub use wire::{ErrorCode, Message, MessageHeader, MessageType, decode_message};

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message too short: {actual} bytes")]
    TooShort { actual: usize },

    #[error("Invalid message type: 0x{0:02X}")]
    InvalidMessageType(u8),

    #[error("Incomplete message: expected {expected} bytes, got {actual}")]
    Incomplete { expected: usize, actual: usize },

    #[error("Buffer too small: need {needed} bytes")]
    BufferTooSmall { needed: usize },

    #[error("Client name too long: {len} bytes (max {max})")]
    NameTooLong { len: usize, max: usize },

    #[error("Invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("Invalid board id: {0:?}")]
    InvalidBoardId(String),
}
