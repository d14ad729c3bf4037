//! 触发事件与板卡标识

use crate::ProtocolError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// 一次触发的逻辑通知
///
/// 由触发控制器在发射脉冲的瞬间创建，之后只读。
/// `Copy` 语义：分发给每个客户端时按值传递，不共享可变状态。
///
/// # Example
///
/// ```
/// use trigsync_protocol::TriggerEvent;
///
/// let event = TriggerEvent::new(1, 100_000);
/// assert_eq!(event.sequence, 1);
/// assert!(event.is_after(&TriggerEvent::new(0, 0)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TriggerEvent {
    /// 触发序号（单次运行内从 1 开始，每次发射严格 +1）
    pub sequence: u64,
    /// 发射时刻（进程单调时钟，微秒）
    pub fired_at_us: u64,
}

impl TriggerEvent {
    pub fn new(sequence: u64, fired_at_us: u64) -> Self {
        Self {
            sequence,
            fired_at_us,
        }
    }

    /// 是否比 `other` 更新（按序号比较）
    pub fn is_after(&self, other: &TriggerEvent) -> bool {
        self.sequence > other.sequence
    }

    /// 发射时刻（秒，浮点）
    pub fn fired_at_secs(&self) -> f64 {
        self.fired_at_us as f64 * 1.0e-6
    }
}

/// 数字 I/O 触发板卡标识
///
/// 配置中以单个字母给出（`a`..`d`，大小写均可）。
/// 未知字母在解析时直接报错，不回退到默认板卡。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BoardId {
    #[default]
    A,
    B,
    C,
    D,
}

impl BoardId {
    pub const ALL: [BoardId; 4] = [BoardId::A, BoardId::B, BoardId::C, BoardId::D];

    /// 小写字母形式（与配置文件一致）
    pub fn as_char(self) -> char {
        match self {
            BoardId::A => 'a',
            BoardId::B => 'b',
            BoardId::C => 'c',
            BoardId::D => 'd',
        }
    }
}

impl TryFrom<char> for BoardId {
    type Error = ProtocolError;

    fn try_from(value: char) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase() {
            'a' => Ok(BoardId::A),
            'b' => Ok(BoardId::B),
            'c' => Ok(BoardId::C),
            'd' => Ok(BoardId::D),
            _ => Err(ProtocolError::InvalidBoardId(value.to_string())),
        }
    }
}

impl FromStr for BoardId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => BoardId::try_from(c),
            _ => Err(ProtocolError::InvalidBoardId(s.to_string())),
        }
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// 触发事件的消费端
///
/// 发布者在控制器线程上同步调用 `publish()`，实现方必须是非阻塞的：
/// 不允许等待任何前端。
pub trait TriggerSink: Send + Sync {
    fn publish(&self, event: &TriggerEvent);
}

impl<T: TriggerSink + ?Sized> TriggerSink for Arc<T> {
    fn publish(&self, event: &TriggerEvent) {
        (**self).publish(event)
    }
}

impl<T: TriggerSink + ?Sized> TriggerSink for Box<T> {
    fn publish(&self, event: &TriggerEvent) {
        (**self).publish(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_board_id_parse() {
        assert_eq!("a".parse::<BoardId>().unwrap(), BoardId::A);
        assert_eq!("B".parse::<BoardId>().unwrap(), BoardId::B);
        assert_eq!(" c ".parse::<BoardId>().unwrap(), BoardId::C);
        assert_eq!(BoardId::try_from('d').unwrap(), BoardId::D);
    }

    #[test]
    fn test_board_id_rejects_unknown() {
        // 未知字母不回退到任何默认板卡
        assert!(matches!(
            "e".parse::<BoardId>(),
            Err(ProtocolError::InvalidBoardId(_))
        ));
        assert!("ab".parse::<BoardId>().is_err());
        assert!("".parse::<BoardId>().is_err());
    }

    #[test]
    fn test_board_id_display_roundtrip() {
        for id in BoardId::ALL {
            assert_eq!(id.to_string().parse::<BoardId>().unwrap(), id);
        }
    }

    #[test]
    fn test_trigger_event_ordering() {
        let first = TriggerEvent::new(1, 100);
        let second = TriggerEvent::new(2, 50);
        assert!(second.is_after(&first));
        assert!(!first.is_after(&second));
        assert!(!first.is_after(&first));
    }

    #[test]
    fn test_fired_at_secs() {
        let event = TriggerEvent::new(1, 1_500_000);
        assert!((event.fired_at_secs() - 1.5).abs() < 1e-9);
    }

    struct Collect(Mutex<Vec<u64>>);

    impl TriggerSink for Collect {
        fn publish(&self, event: &TriggerEvent) {
            self.0.lock().unwrap().push(event.sequence);
        }
    }

    #[test]
    fn test_sink_through_arc_and_box() {
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let boxed: Box<dyn TriggerSink> = Box::new(sink.clone());
        boxed.publish(&TriggerEvent::new(7, 0));
        sink.publish(&TriggerEvent::new(8, 0));
        assert_eq!(*sink.0.lock().unwrap(), vec![7, 8]);
    }
}
