//! UDP 同步服务端
//!
//! 把 [`SyncCoordinator`] 暴露到网络上。两个命名线程：
//! - `sync_rx`: 接收并处理前端报文（带读超时，便于检查停止标志）
//! - `sync_cleanup`: 周期性清理超时客户端
//!
//! 触发投递不经过这两个线程：`UdpLink` 在触发线程中直接 `send_to`。

use crate::ClientId;
use crate::coordinator::{ClientLink, SyncCoordinator};
use crate::error::SyncError;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use trigsync_protocol::wire::{
    self, CLIENT_MESSAGE_LEN, MAX_MESSAGE_LEN, STATUS_OK, STATUS_REJECTED, SUBSCRIBE_ACK_LEN,
    TRIGGER_MESSAGE_LEN,
};
use trigsync_protocol::{ErrorCode, Message, TriggerEvent, decode_message};

/// 服务端配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 超时清理周期
    pub cleanup_interval: Duration,
    /// 接收线程的读超时（决定 shutdown 的响应时间）
    pub recv_timeout: Duration,
    /// 最大订阅者数，超过后拒绝新的订阅
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(1),
            recv_timeout: Duration::from_millis(100),
            max_clients: 64,
        }
    }
}

/// 通过 UDP 投递触发的链路
struct UdpLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl ClientLink for UdpLink {
    fn deliver(&self, link_seq: u32, event: &TriggerEvent) -> Result<(), SyncError> {
        let mut buf = [0u8; TRIGGER_MESSAGE_LEN];
        let encoded = wire::encode_trigger_available(link_seq, event, &mut buf);
        self.socket.send_to(encoded, self.peer)?;
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// UDP 同步服务端
pub struct SyncServer {
    coordinator: Arc<SyncCoordinator>,
    local_addr: SocketAddr,
    is_running: Arc<AtomicBool>,
    rx_thread: Option<JoinHandle<()>>,
    cleanup_thread: Option<JoinHandle<()>>,
}

impl SyncServer {
    /// 绑定地址并启动服务线程
    pub fn bind(
        addr: impl ToSocketAddrs,
        coordinator: Arc<SyncCoordinator>,
        config: ServerConfig,
    ) -> Result<Self, SyncError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(config.recv_timeout))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let is_running = Arc::new(AtomicBool::new(true));

        let rx_thread = {
            let socket = Arc::clone(&socket);
            let coordinator = Arc::clone(&coordinator);
            let is_running = Arc::clone(&is_running);
            let max_clients = config.max_clients;
            thread::Builder::new()
                .name("sync_rx".into())
                .spawn(move || sync_rx_loop(socket, coordinator, is_running, max_clients))
                .map_err(|source| SyncError::ThreadSpawn {
                    name: "sync_rx",
                    source,
                })?
        };

        let cleanup_thread = {
            let coordinator = Arc::clone(&coordinator);
            let flag = Arc::clone(&is_running);
            let spawned = thread::Builder::new()
                .name("sync_cleanup".into())
                .spawn(move || sync_cleanup_loop(coordinator, flag, config.cleanup_interval));
            match spawned {
                Ok(handle) => handle,
                Err(source) => {
                    is_running.store(false, Ordering::Release);
                    let _ = rx_thread.join();
                    return Err(SyncError::ThreadSpawn {
                        name: "sync_cleanup",
                        source,
                    });
                },
            }
        };

        info!("Sync server listening on {}", local_addr);
        Ok(Self {
            coordinator,
            local_addr,
            is_running,
            rx_thread: Some(rx_thread),
            cleanup_thread: Some(cleanup_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 停止并等待服务线程退出（可重复调用）
    pub fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::Release);

        for (name, handle) in [
            ("sync_rx", self.rx_thread.take()),
            ("sync_cleanup", self.cleanup_thread.take()),
        ] {
            if let Some(handle) = handle
                && handle.join().is_err()
            {
                error!("{} thread panicked", name);
            }
        }
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

/// 接收线程主循环
fn sync_rx_loop(
    socket: Arc<UdpSocket>,
    coordinator: Arc<SyncCoordinator>,
    is_running: Arc<AtomicBool>,
    max_clients: usize,
) {
    let mut buf = [0u8; MAX_MESSAGE_LEN];

    while is_running.load(Ordering::Acquire) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            },
            Err(e) => {
                // 某些平台上对端不可达会以错误形式出现在 recv 上，不影响其他客户端
                debug!("Sync server recv error: {}", e);
                continue;
            },
        };

        match decode_message(&buf[..len]) {
            Ok(msg) => handle_message(msg, peer, &socket, &coordinator, max_clients),
            Err(e) => {
                warn!("Malformed datagram from {}: {}", peer, e);
                send_error(&socket, peer, ErrorCode::InvalidMessage, &e.to_string());
            },
        }
    }
    trace!("sync_rx: exiting");
}

/// 处理一条前端报文
fn handle_message(
    msg: Message,
    peer: SocketAddr,
    socket: &Arc<UdpSocket>,
    coordinator: &Arc<SyncCoordinator>,
    max_clients: usize,
) {
    match msg {
        Message::Subscribe { name } => {
            // 同一地址重新订阅（例如前端重连）时替换旧的注册
            for stale in coordinator.clients_at(peer) {
                debug!("Replacing stale subscription {} from {}", stale, peer);
                coordinator.unregister(stale);
            }

            let (client_id, status) = if coordinator.client_count() >= max_clients {
                warn!(
                    "Rejecting subscription '{}' from {}: {} clients already registered",
                    name, peer, max_clients
                );
                (0, STATUS_REJECTED)
            } else {
                let link = UdpLink {
                    socket: Arc::clone(socket),
                    peer,
                };
                (coordinator.register_link(name, Box::new(link)), STATUS_OK)
            };

            let mut ack = [0u8; SUBSCRIBE_ACK_LEN];
            let encoded = wire::encode_subscribe_ack(client_id, status, &mut ack);
            if let Err(e) = socket.send_to(encoded, peer) {
                warn!("Failed to send SubscribeAck to {}: {}", peer, e);
            }
        },
        Message::Unsubscribe { client_id } => {
            if !coordinator.unregister(client_id) {
                debug!("Unsubscribe for unknown client {} from {}", client_id, peer);
            }
        },
        Message::ReadyForNext { client_id } => {
            if coordinator.set_ready(client_id).is_err() {
                reply_not_subscribed(socket, peer, client_id);
            }
        },
        Message::Busy { client_id } => {
            if coordinator.unset_ready(client_id).is_err() {
                reply_not_subscribed(socket, peer, client_id);
            }
        },
        Message::Heartbeat { client_id } => match coordinator.touch(client_id) {
            Ok(()) => {
                let mut buf = [0u8; CLIENT_MESSAGE_LEN];
                let encoded = wire::encode_heartbeat_ack(client_id, &mut buf);
                if let Err(e) = socket.send_to(encoded, peer) {
                    debug!("Failed to send HeartbeatAck to {}: {}", peer, e);
                }
            },
            Err(_) => reply_not_subscribed(socket, peer, client_id),
        },
        other => {
            warn!("Unexpected message from {}: {:?}", peer, other);
            send_error(
                socket,
                peer,
                ErrorCode::InvalidMessage,
                "coordinator-bound messages only",
            );
        },
    }
}

fn reply_not_subscribed(socket: &UdpSocket, peer: SocketAddr, client_id: ClientId) {
    debug!("Message from unknown client {} at {}", client_id, peer);
    send_error(
        socket,
        peer,
        ErrorCode::NotSubscribed,
        &format!("client {} is not subscribed", client_id),
    );
}

fn send_error(socket: &UdpSocket, peer: SocketAddr, code: ErrorCode, message: &str) {
    let mut buf = [0u8; MAX_MESSAGE_LEN];
    let encoded = wire::encode_error(code, message, &mut buf);
    if let Err(e) = socket.send_to(encoded, peer) {
        debug!("Failed to send error to {}: {}", peer, e);
    }
}

/// 超时清理线程主循环
///
/// 分段睡眠，保证 shutdown 时能在 50ms 内退出。
fn sync_cleanup_loop(
    coordinator: Arc<SyncCoordinator>,
    is_running: Arc<AtomicBool>,
    interval: Duration,
) {
    const STEP: Duration = Duration::from_millis(50);

    while is_running.load(Ordering::Acquire) {
        let removed = coordinator.cleanup_timeout();
        if removed > 0 {
            info!("Cleaned up {} timed-out client(s)", removed);
        }

        let mut slept = Duration::ZERO;
        while slept < interval && is_running.load(Ordering::Acquire) {
            let step = STEP.min(interval - slept);
            thread::sleep(step);
            slept += step;
        }
    }
    trace!("sync_cleanup: exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::SyncConfig;

    fn test_server() -> SyncServer {
        let config = ServerConfig {
            recv_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        SyncServer::bind("127.0.0.1:0", Arc::new(SyncCoordinator::default()), config).unwrap()
    }

    fn raw_client() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn recv(socket: &UdpSocket) -> Message {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let len = socket.recv(&mut buf).unwrap();
        decode_message(&buf[..len]).unwrap()
    }

    fn subscribe(socket: &UdpSocket, server: SocketAddr, name: &str) -> ClientId {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let encoded = wire::encode_subscribe(name, &mut buf).unwrap();
        socket.send_to(encoded, server).unwrap();
        match recv(socket) {
            Message::SubscribeAck { client_id, status } => {
                assert_eq!(status, STATUS_OK);
                client_id
            },
            other => panic!("expected SubscribeAck, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_and_receive_trigger() {
        let server = test_server();
        let client = raw_client();
        let id = subscribe(&client, server.local_addr(), "adc");

        let view = server.coordinator().client_view(id).unwrap();
        assert_eq!(view.name, "adc");
        assert_eq!(view.peer_addr, Some(client.local_addr().unwrap()));

        server.coordinator().publish(&TriggerEvent::new(1, 123));
        match recv(&client) {
            Message::TriggerAvailable { link_seq, event } => {
                assert_eq!(link_seq, 1);
                assert_eq!(event, TriggerEvent::new(1, 123));
            },
            other => panic!("expected TriggerAvailable, got {:?}", other),
        }
    }

    #[test]
    fn test_ready_busy_and_heartbeat() {
        let server = test_server();
        let client = raw_client();
        let addr = server.local_addr();
        let id = subscribe(&client, addr, "adc");

        let mut buf = [0u8; CLIENT_MESSAGE_LEN];
        client
            .send_to(wire::encode_ready_for_next(id, &mut buf), addr)
            .unwrap();
        client.send_to(wire::encode_heartbeat(id, &mut buf), addr).unwrap();
        assert_eq!(recv(&client), Message::HeartbeatAck { client_id: id });
        // HeartbeatAck 在 ReadyForNext 之后处理，此时就绪状态已更新
        assert!(server.coordinator().client_view(id).unwrap().ready);

        client.send_to(wire::encode_busy(id, &mut buf), addr).unwrap();
        client.send_to(wire::encode_heartbeat(id, &mut buf), addr).unwrap();
        assert_eq!(recv(&client), Message::HeartbeatAck { client_id: id });
        assert!(!server.coordinator().client_view(id).unwrap().ready);
    }

    #[test]
    fn test_unknown_client_gets_not_subscribed() {
        let server = test_server();
        let client = raw_client();

        let mut buf = [0u8; CLIENT_MESSAGE_LEN];
        client
            .send_to(wire::encode_heartbeat(999, &mut buf), server.local_addr())
            .unwrap();
        match recv(&client) {
            Message::Error { code, message } => {
                assert_eq!(code, ErrorCode::NotSubscribed);
                assert!(message.contains("999"));
            },
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_resubscribe_replaces_old_registration() {
        let server = test_server();
        let client = raw_client();
        let first = subscribe(&client, server.local_addr(), "adc");
        let second = subscribe(&client, server.local_addr(), "adc");

        assert_ne!(first, second);
        assert!(!server.coordinator().contains(first));
        assert!(server.coordinator().contains(second));
        assert_eq!(server.coordinator().client_count(), 1);
    }

    #[test]
    fn test_unsubscribe_and_malformed() {
        let server = test_server();
        let client = raw_client();
        let addr = server.local_addr();
        let id = subscribe(&client, addr, "adc");

        client.send_to(&[0x01, 0x00], addr).unwrap();
        match recv(&client) {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
            other => panic!("expected Error, got {:?}", other),
        }

        let mut buf = [0u8; CLIENT_MESSAGE_LEN];
        client.send_to(wire::encode_unsubscribe(id, &mut buf), addr).unwrap();
        // 通过一次心跳确认 Unsubscribe 已被处理
        client.send_to(wire::encode_heartbeat(id, &mut buf), addr).unwrap();
        assert!(matches!(recv(&client), Message::Error { .. }));
        assert!(!server.coordinator().contains(id));
    }

    #[test]
    fn test_max_clients_rejects() {
        let config = ServerConfig {
            recv_timeout: Duration::from_millis(20),
            max_clients: 1,
            ..Default::default()
        };
        let server =
            SyncServer::bind("127.0.0.1:0", Arc::new(SyncCoordinator::default()), config).unwrap();
        let first = raw_client();
        subscribe(&first, server.local_addr(), "one");

        let second = raw_client();
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let encoded = wire::encode_subscribe("two", &mut buf).unwrap();
        second.send_to(encoded, server.local_addr()).unwrap();
        assert_eq!(
            recv(&second),
            Message::SubscribeAck {
                client_id: 0,
                status: STATUS_REJECTED
            }
        );
    }

    #[test]
    fn test_cleanup_thread_removes_silent_clients() {
        let coordinator = Arc::new(SyncCoordinator::new(SyncConfig {
            client_timeout: Duration::from_millis(50),
            ..Default::default()
        }));
        let config = ServerConfig {
            recv_timeout: Duration::from_millis(20),
            cleanup_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let server = SyncServer::bind("127.0.0.1:0", coordinator, config).unwrap();
        let client = raw_client();
        let id = subscribe(&client, server.local_addr(), "silent");

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.coordinator().contains(id) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!server.coordinator().contains(id));
    }

    #[test]
    fn test_shutdown_joins_threads() {
        let mut server = test_server();
        assert!(server.is_running());
        server.shutdown();
        assert!(!server.is_running());
        server.shutdown();
    }
}
