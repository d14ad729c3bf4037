//! # trigsync Board Adapter Layer
//!
//! 触发板卡硬件抽象层。控制器只依赖一个同步操作：按通道掩码发射脉冲。
//! 寄存器级 I/O 属于外部驱动，本 crate 只提供 trait 与一个模拟实现。

pub mod sim;

pub use sim::{BoardProbe, SimulatedBoard};

use thiserror::Error;

/// 板卡错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardErrorKind {
    Unknown,
    NotFound,
    AccessDenied,
    Busy,
    Io,
}

/// 板卡层统一错误类型
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct BoardError {
    pub kind: BoardErrorKind,
    pub message: String,
}

impl BoardError {
    pub fn new(kind: BoardErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 致命错误：板卡已不可用，继续发射没有意义
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            BoardErrorKind::NotFound | BoardErrorKind::AccessDenied
        )
    }
}

impl From<std::io::Error> for BoardError {
    fn from(e: std::io::Error) -> Self {
        Self::new(BoardErrorKind::Io, e.to_string())
    }
}

impl From<&str> for BoardError {
    fn from(message: &str) -> Self {
        Self::new(BoardErrorKind::Unknown, message)
    }
}

/// 触发板卡
///
/// 实现方假定在微秒量级内同步返回。句柄由触发控制器线程独占持有。
pub trait TriggerBoard: Send {
    /// 在 `mask` 选中的通道上发射一组脉冲
    fn fire_pulses(&mut self, mask: u32) -> Result<(), BoardError>;
}

impl<T: TriggerBoard + ?Sized> TriggerBoard for Box<T> {
    fn fire_pulses(&mut self, mask: u32) -> Result<(), BoardError> {
        (**self).fire_pulses(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_error_display() {
        let err = BoardError::new(BoardErrorKind::Busy, "port 6 locked");
        assert_eq!(err.to_string(), "Busy: port 6 locked");
    }

    #[test]
    fn test_board_error_fatal() {
        assert!(BoardError::new(BoardErrorKind::NotFound, "").is_fatal());
        assert!(BoardError::new(BoardErrorKind::AccessDenied, "").is_fatal());
        assert!(!BoardError::new(BoardErrorKind::Busy, "").is_fatal());
        assert!(!BoardError::from("glitch").is_fatal());
    }

    #[test]
    fn test_from_io_error() {
        let err: BoardError = std::io::Error::other("ioctl failed").into();
        assert_eq!(err.kind, BoardErrorKind::Io);
        assert!(err.message.contains("ioctl failed"));
    }
}
