//! 触发同步线上协议
//!
//! 协调器（trigger master）与前端之间的 UDP 报文格式。
//! 所有报文以 8 字节消息头开始：
//!
//! ```text
//! 0        1       2         4               8
//! +--------+-------+---------+---------------+
//! | type   | flags | length  | seq (u32, LE) |
//! +--------+-------+---------+---------------+
//! ```
//!
//! `seq` 仅在 `TriggerAvailable` 中有意义：它是每条客户端链路独立的递增序号，
//! 接收端据此丢弃乱序或重复的数据报。

use crate::ProtocolError;
use crate::event::TriggerEvent;

/// 消息头长度
pub const HEADER_LEN: usize = 8;
/// 仅携带 client_id 的消息长度（Heartbeat / Unsubscribe / ReadyForNext / Busy / HeartbeatAck）
pub const CLIENT_MESSAGE_LEN: usize = 12;
/// SubscribeAck 长度
pub const SUBSCRIBE_ACK_LEN: usize = 13;
/// TriggerAvailable 长度
pub const TRIGGER_MESSAGE_LEN: usize = 24;
/// 单个数据报的最大长度
pub const MAX_MESSAGE_LEN: usize = 256;
/// 客户端名称最大字节数
pub const MAX_NAME_LEN: usize = 64;

/// SubscribeAck 状态：成功
pub const STATUS_OK: u8 = 0;
/// SubscribeAck 状态：协调器拒绝注册
pub const STATUS_REJECTED: u8 = 1;

// ============================================================================
// Message Types
// ============================================================================

/// 消息类型枚举
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // 前端 → 协调器
    Heartbeat = 0x00,
    Subscribe = 0x01,
    Unsubscribe = 0x02,
    ReadyForNext = 0x03,
    Busy = 0x04,

    // 协调器 → 前端
    SubscribeAck = 0x81,
    TriggerAvailable = 0x83,
    HeartbeatAck = 0x84,
    Error = 0xFF,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(MessageType::Heartbeat),
            0x01 => Some(MessageType::Subscribe),
            0x02 => Some(MessageType::Unsubscribe),
            0x03 => Some(MessageType::ReadyForNext),
            0x04 => Some(MessageType::Busy),
            0x81 => Some(MessageType::SubscribeAck),
            0x83 => Some(MessageType::TriggerAvailable),
            0x84 => Some(MessageType::HeartbeatAck),
            0xFF => Some(MessageType::Error),
            _ => None,
        }
    }
}

/// 错误码
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown = 0x00,
    /// 客户端未注册（协调器重启或已清理超时客户端）
    NotSubscribed = 0x01,
    InvalidMessage = 0x02,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => ErrorCode::NotSubscribed,
            0x02 => ErrorCode::InvalidMessage,
            _ => ErrorCode::Unknown,
        }
    }
}

// ============================================================================
// Message Header
// ============================================================================

/// 消息头（8 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub flags: u8,
    pub length: u16,
    pub seq: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, length: u16, seq: u32) -> Self {
        Self {
            msg_type,
            flags: 0,
            length,
            seq,
        }
    }

    /// 编码消息头到缓冲区（前 8 字节）
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= HEADER_LEN);
        buf[0] = self.msg_type as u8;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.seq.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort { actual: buf.len() });
        }

        let msg_type =
            MessageType::from_u8(buf[0]).ok_or(ProtocolError::InvalidMessageType(buf[0]))?;

        Ok(Self {
            msg_type,
            flags: buf[1],
            length: u16::from_le_bytes([buf[2], buf[3]]),
            seq: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

// ============================================================================
// Message Enum
// ============================================================================

/// 协议消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Heartbeat { client_id: u32 },
    Subscribe { name: String },
    Unsubscribe { client_id: u32 },
    ReadyForNext { client_id: u32 },
    Busy { client_id: u32 },
    SubscribeAck { client_id: u32, status: u8 },
    TriggerAvailable { link_seq: u32, event: TriggerEvent },
    HeartbeatAck { client_id: u32 },
    Error { code: ErrorCode, message: String },
}

// ============================================================================
// Encoding Functions
// ============================================================================

fn encode_client_message(
    msg_type: MessageType,
    client_id: u32,
    buf: &mut [u8; CLIENT_MESSAGE_LEN],
) -> &[u8] {
    let header = MessageHeader::new(msg_type, CLIENT_MESSAGE_LEN as u16, 0);
    header.encode(&mut buf[..HEADER_LEN]);
    buf[8..12].copy_from_slice(&client_id.to_le_bytes());
    &buf[..]
}

/// 编码心跳
pub fn encode_heartbeat(client_id: u32, buf: &mut [u8; CLIENT_MESSAGE_LEN]) -> &[u8] {
    encode_client_message(MessageType::Heartbeat, client_id, buf)
}

/// 编码心跳确认（协调器 → 前端）
pub fn encode_heartbeat_ack(client_id: u32, buf: &mut [u8; CLIENT_MESSAGE_LEN]) -> &[u8] {
    encode_client_message(MessageType::HeartbeatAck, client_id, buf)
}

/// 编码取消订阅
pub fn encode_unsubscribe(client_id: u32, buf: &mut [u8; CLIENT_MESSAGE_LEN]) -> &[u8] {
    encode_client_message(MessageType::Unsubscribe, client_id, buf)
}

/// 编码 ReadyForNext（前端可以接受下一个触发）
pub fn encode_ready_for_next(client_id: u32, buf: &mut [u8; CLIENT_MESSAGE_LEN]) -> &[u8] {
    encode_client_message(MessageType::ReadyForNext, client_id, buf)
}

/// 编码 Busy（前端正在读出）
pub fn encode_busy(client_id: u32, buf: &mut [u8; CLIENT_MESSAGE_LEN]) -> &[u8] {
    encode_client_message(MessageType::Busy, client_id, buf)
}

/// 编码 Subscribe 消息
///
/// 布局：header + name_len(1) + name
pub fn encode_subscribe<'a>(
    name: &str,
    buf: &'a mut [u8; MAX_MESSAGE_LEN],
) -> Result<&'a [u8], ProtocolError> {
    let name_bytes = name.as_bytes();
    if name_bytes.len() > MAX_NAME_LEN {
        return Err(ProtocolError::NameTooLong {
            len: name_bytes.len(),
            max: MAX_NAME_LEN,
        });
    }

    let length = HEADER_LEN + 1 + name_bytes.len();
    let header = MessageHeader::new(MessageType::Subscribe, length as u16, 0);
    header.encode(&mut buf[..HEADER_LEN]);
    buf[8] = name_bytes.len() as u8;
    buf[9..length].copy_from_slice(name_bytes);

    Ok(&buf[..length])
}

/// 编码 SubscribeAck
pub fn encode_subscribe_ack(
    client_id: u32,
    status: u8,
    buf: &mut [u8; SUBSCRIBE_ACK_LEN],
) -> &[u8] {
    let header = MessageHeader::new(MessageType::SubscribeAck, SUBSCRIBE_ACK_LEN as u16, 0);
    header.encode(&mut buf[..HEADER_LEN]);
    buf[8..12].copy_from_slice(&client_id.to_le_bytes());
    buf[12] = status;
    &buf[..]
}

/// 编码 TriggerAvailable
///
/// `link_seq` 写入消息头的 seq 字段。
pub fn encode_trigger_available<'a>(
    link_seq: u32,
    event: &TriggerEvent,
    buf: &'a mut [u8; TRIGGER_MESSAGE_LEN],
) -> &'a [u8] {
    let header = MessageHeader::new(
        MessageType::TriggerAvailable,
        TRIGGER_MESSAGE_LEN as u16,
        link_seq,
    );
    header.encode(&mut buf[..HEADER_LEN]);
    buf[8..16].copy_from_slice(&event.sequence.to_le_bytes());
    buf[16..24].copy_from_slice(&event.fired_at_us.to_le_bytes());
    &buf[..]
}

/// 编码 Error 消息
///
/// 过长的文本在字符边界处截断，保证总长度不超过 `MAX_MESSAGE_LEN`。
pub fn encode_error<'a>(
    code: ErrorCode,
    message: &str,
    buf: &'a mut [u8; MAX_MESSAGE_LEN],
) -> &'a [u8] {
    let max_text = MAX_MESSAGE_LEN - HEADER_LEN - 1;
    let mut end = message.len().min(max_text);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    let text = &message.as_bytes()[..end];

    let length = HEADER_LEN + 1 + text.len();
    let header = MessageHeader::new(MessageType::Error, length as u16, 0);
    header.encode(&mut buf[..HEADER_LEN]);
    buf[8] = code as u8;
    buf[9..length].copy_from_slice(text);

    &buf[..length]
}

// ============================================================================
// Decoding
// ============================================================================

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn require(data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::Incomplete {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// 解码一个完整的数据报
pub fn decode_message(data: &[u8]) -> Result<Message, ProtocolError> {
    let header = MessageHeader::decode(data)?;
    require(data, header.length as usize)?;

    match header.msg_type {
        MessageType::Heartbeat
        | MessageType::Unsubscribe
        | MessageType::ReadyForNext
        | MessageType::Busy
        | MessageType::HeartbeatAck => {
            require(data, CLIENT_MESSAGE_LEN)?;
            let client_id = read_u32(data, 8);
            Ok(match header.msg_type {
                MessageType::Heartbeat => Message::Heartbeat { client_id },
                MessageType::Unsubscribe => Message::Unsubscribe { client_id },
                MessageType::ReadyForNext => Message::ReadyForNext { client_id },
                MessageType::Busy => Message::Busy { client_id },
                _ => Message::HeartbeatAck { client_id },
            })
        },
        MessageType::Subscribe => {
            require(data, HEADER_LEN + 1)?;
            let name_len = data[8] as usize;
            require(data, HEADER_LEN + 1 + name_len)?;
            let name = std::str::from_utf8(&data[9..9 + name_len])
                .map_err(|_| ProtocolError::InvalidUtf8 { field: "name" })?;
            Ok(Message::Subscribe {
                name: name.to_string(),
            })
        },
        MessageType::SubscribeAck => {
            require(data, SUBSCRIBE_ACK_LEN)?;
            Ok(Message::SubscribeAck {
                client_id: read_u32(data, 8),
                status: data[12],
            })
        },
        MessageType::TriggerAvailable => {
            require(data, TRIGGER_MESSAGE_LEN)?;
            Ok(Message::TriggerAvailable {
                link_seq: header.seq,
                event: TriggerEvent::new(read_u64(data, 8), read_u64(data, 16)),
            })
        },
        MessageType::Error => {
            require(data, HEADER_LEN + 1)?;
            let end = (header.length as usize).max(HEADER_LEN + 1);
            let message = String::from_utf8_lossy(&data[9..end]).into_owned();
            Ok(Message::Error {
                code: ErrorCode::from_u8(data[8]),
                message,
            })
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(MessageType::from_u8(0x03), Some(MessageType::ReadyForNext));
        assert_eq!(
            MessageType::from_u8(0x83),
            Some(MessageType::TriggerAvailable)
        );
        assert_eq!(MessageType::from_u8(0x42), None);
    }

    #[test]
    fn test_header_layout() {
        let header = MessageHeader::new(MessageType::TriggerAvailable, 24, 0x0102_0304);
        let mut buf = [0u8; 8];
        header.encode(&mut buf);
        assert_eq!(buf, [0x83, 0, 24, 0, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(MessageHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_trigger_available_carries_link_seq() {
        let mut buf = [0u8; TRIGGER_MESSAGE_LEN];
        let event = TriggerEvent::new(42, 1_234_567);
        let encoded = encode_trigger_available(7, &event, &mut buf);
        assert_eq!(encoded.len(), TRIGGER_MESSAGE_LEN);

        match decode_message(encoded).unwrap() {
            Message::TriggerAvailable { link_seq, event: decoded } => {
                assert_eq!(link_seq, 7);
                assert_eq!(decoded, event);
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_client_messages_decode_to_their_variant() {
        let mut buf = [0u8; CLIENT_MESSAGE_LEN];
        assert_eq!(
            decode_message(encode_ready_for_next(3, &mut buf)).unwrap(),
            Message::ReadyForNext { client_id: 3 }
        );
        assert_eq!(
            decode_message(encode_busy(4, &mut buf)).unwrap(),
            Message::Busy { client_id: 4 }
        );
        assert_eq!(
            decode_message(encode_heartbeat_ack(5, &mut buf)).unwrap(),
            Message::HeartbeatAck { client_id: 5 }
        );
    }

    #[test]
    fn test_subscribe_name() {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let encoded = encode_subscribe("sis3316-digitizer", &mut buf).unwrap();
        assert_eq!(encoded.len(), HEADER_LEN + 1 + 17);
        assert_eq!(
            decode_message(encoded).unwrap(),
            Message::Subscribe {
                name: "sis3316-digitizer".to_string()
            }
        );
    }

    #[test]
    fn test_subscribe_name_too_long() {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            encode_subscribe(&name, &mut buf),
            Err(ProtocolError::NameTooLong { len: 65, max: 64 })
        ));
    }

    #[test]
    fn test_error_message_truncated_on_char_boundary() {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let text = "é".repeat(200);
        let encoded = encode_error(ErrorCode::NotSubscribed, &text, &mut buf);
        assert!(encoded.len() <= MAX_MESSAGE_LEN);

        match decode_message(encoded).unwrap() {
            Message::Error { code, message } => {
                assert_eq!(code, ErrorCode::NotSubscribed);
                assert!(message.chars().all(|c| c == 'é'));
                assert!(!message.is_empty());
            },
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_short_and_unknown() {
        assert!(matches!(
            decode_message(&[0x00, 0x00]),
            Err(ProtocolError::TooShort { actual: 2 })
        ));
        assert!(matches!(
            decode_message(&[0x42, 0, 8, 0, 0, 0, 0, 0]),
            Err(ProtocolError::InvalidMessageType(0x42))
        ));
    }

    #[test]
    fn test_decode_truncated_trigger() {
        let mut buf = [0u8; TRIGGER_MESSAGE_LEN];
        let encoded = encode_trigger_available(1, &TriggerEvent::new(1, 1), &mut buf);
        assert!(matches!(
            decode_message(&encoded[..20]),
            Err(ProtocolError::Incomplete {
                expected: 24,
                actual: 20
            })
        ));
    }

    #[test]
    fn test_decode_subscribe_invalid_utf8() {
        let mut buf = [0u8; 11];
        MessageHeader::new(MessageType::Subscribe, 11, 0).encode(&mut buf);
        buf[8] = 2;
        buf[9] = 0xFF;
        buf[10] = 0xFE;
        assert!(matches!(
            decode_message(&buf),
            Err(ProtocolError::InvalidUtf8 { field: "name" })
        ));
    }
}
