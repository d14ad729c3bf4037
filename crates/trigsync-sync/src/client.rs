//! UDP 订阅客户端（前端一侧）
//!
//! 连接流程：发送 Subscribe，等待 SubscribeAck（带超时），之后启动两个命名线程：
//! - `sync_client_rx`: 接收 TriggerAvailable / HeartbeatAck / Error
//! - `sync_heartbeat`: 周期性发送心跳（分段睡眠，保证快速退出）
//!
//! 链路在以下情况视为丢失：协调器回复 NotSubscribed、套接字报错、
//! 超过 `link_timeout` 没有收到任何报文。丢失后待处理的触发被丢弃，
//! `has_trigger()` 一直返回 false，直到 [`SyncClient::reconnect`] 成功。

use crate::ClientId;
use crate::endpoint::TriggerEndpoint;
use crate::error::SyncError;
use crate::handshake::{EndpointStats, HandshakeState};
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use trigsync_protocol::wire::{self, CLIENT_MESSAGE_LEN, MAX_MESSAGE_LEN, STATUS_OK};
use trigsync_protocol::{ErrorCode, Message, TriggerEvent, decode_message};

/// 客户端配置
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// 等待 SubscribeAck 的超时
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// 超过此时间未收到协调器的任何报文即视为链路丢失
    pub link_timeout: Duration,
    /// 接收线程的读超时
    pub recv_timeout: Duration,
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(1),
            link_timeout: Duration::from_secs(3),
            recv_timeout: Duration::from_millis(50),
        }
    }
}

/// 客户端统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncClientStats {
    pub client_id: ClientId,
    pub connected: bool,
    pub endpoint: EndpointStats,
    /// 因链路序号不递增而丢弃的报文数（乱序或重复）
    pub stale_dropped: u64,
    pub heartbeat_acks: u64,
}

/// 线程间共享的状态
struct Shared {
    socket: UdpSocket,
    client_id: AtomicU32,
    connected: AtomicBool,
    running: AtomicBool,
    handshake: HandshakeState,
    /// 已接受的最后一个链路序号（0 表示本次订阅尚未收到触发）
    last_link_seq: AtomicU32,
    last_heard_us: AtomicU64,
    epoch: Instant,
    stale_dropped: AtomicU64,
    heartbeat_acks: AtomicU64,
}

impl Shared {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn mark_heard(&self) {
        self.last_heard_us.store(self.now_us(), Ordering::Release);
    }

    fn silence(&self) -> Duration {
        let last = self.last_heard_us.load(Ordering::Acquire);
        Duration::from_micros(self.now_us().saturating_sub(last))
    }

    /// 标记链路丢失并丢弃待处理的触发；返回此前是否处于连接状态
    fn mark_disconnected(&self) -> bool {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        if self.handshake.clear() {
            debug!("Discarded pending trigger after link loss");
        }
        was_connected
    }

    fn send_client_message(
        &self,
        encode: fn(u32, &mut [u8; CLIENT_MESSAGE_LEN]) -> &[u8],
    ) -> Result<(), SyncError> {
        let mut buf = [0u8; CLIENT_MESSAGE_LEN];
        let encoded = encode(self.client_id.load(Ordering::Acquire), &mut buf);
        self.socket.send(encoded)?;
        Ok(())
    }

    fn handle_message(&self, msg: Message) {
        match msg {
            Message::TriggerAvailable { link_seq, event } => {
                self.mark_heard();
                if !self.connected.load(Ordering::Acquire) {
                    self.handshake.record_discarded(1);
                    return;
                }
                let last = self.last_link_seq.load(Ordering::Acquire);
                if !is_newer_link_seq(link_seq, last) {
                    self.stale_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Dropping stale trigger (link seq {} <= {})", link_seq, last);
                    return;
                }
                self.last_link_seq.store(link_seq, Ordering::Release);
                if self.handshake.deliver(event) {
                    trace!("Trigger #{} overwrote an unread trigger", event.sequence);
                }
            },
            Message::HeartbeatAck { .. } => {
                self.mark_heard();
                self.heartbeat_acks.fetch_add(1, Ordering::Relaxed);
            },
            Message::Error {
                code: ErrorCode::NotSubscribed,
                message,
            } => {
                if self.mark_disconnected() {
                    warn!("Coordinator no longer knows this client: {}", message);
                }
            },
            Message::Error { code, message } => {
                warn!("Coordinator error {:?}: {}", code, message);
            },
            Message::SubscribeAck { client_id, .. } => {
                debug!("Ignoring late SubscribeAck for client {}", client_id);
            },
            other => debug!("Ignoring unexpected message: {:?}", other),
        }
    }
}

/// 链路序号是否比 `last` 更新（按环绕序比较）
fn is_newer_link_seq(link_seq: u32, last: u32) -> bool {
    if last == 0 {
        return link_seq != 0;
    }
    let diff = link_seq.wrapping_sub(last);
    diff != 0 && diff < u32::MAX / 2
}

/// UDP 订阅客户端
pub struct SyncClient {
    shared: Arc<Shared>,
    name: String,
    coordinator_addr: SocketAddr,
    config: SyncClientConfig,
    rx_thread: Option<JoinHandle<()>>,
    heartbeat_thread: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// 连接协调器并完成订阅
    pub fn connect(
        addr: impl ToSocketAddrs,
        name: impl Into<String>,
        config: SyncClientConfig,
    ) -> Result<Self, SyncError> {
        let coordinator_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            SyncError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                "coordinator address resolved to nothing",
            ))
        })?;
        let local = if coordinator_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local)?;
        // connect 之后对端不可达会以错误形式出现在 recv 上
        socket.connect(coordinator_addr)?;
        socket.set_read_timeout(Some(config.recv_timeout))?;

        let name = name.into();
        let client_id = subscribe(&socket, &name, config.connect_timeout)?;

        let shared = Arc::new(Shared {
            socket,
            client_id: AtomicU32::new(client_id),
            connected: AtomicBool::new(true),
            running: AtomicBool::new(false),
            handshake: HandshakeState::new(),
            last_link_seq: AtomicU32::new(0),
            last_heard_us: AtomicU64::new(0),
            epoch: Instant::now(),
            stale_dropped: AtomicU64::new(0),
            heartbeat_acks: AtomicU64::new(0),
        });
        shared.mark_heard();

        let mut client = Self {
            shared,
            name,
            coordinator_addr,
            config,
            rx_thread: None,
            heartbeat_thread: None,
        };
        client.start_threads()?;
        info!(
            "Subscribed to {} as client {} ({})",
            coordinator_addr, client_id, client.name
        );
        Ok(client)
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coordinator_addr(&self) -> SocketAddr {
        self.coordinator_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SyncError> {
        Ok(self.shared.socket.local_addr()?)
    }

    pub fn config(&self) -> &SyncClientConfig {
        &self.config
    }

    pub fn stats(&self) -> SyncClientStats {
        SyncClientStats {
            client_id: self.client_id(),
            connected: self.is_connected(),
            endpoint: self.shared.handshake.stats(),
            stale_dropped: self.shared.stale_dropped.load(Ordering::Relaxed),
            heartbeat_acks: self.shared.heartbeat_acks.load(Ordering::Relaxed),
        }
    }

    /// 重新订阅
    ///
    /// 丢弃所有待处理的触发并重置链路序号；若此前已就绪，则在新订阅上重新报告就绪。
    /// 失败时客户端保持断开状态，可以再次调用。
    pub fn reconnect(&mut self) -> Result<(), SyncError> {
        self.stop_threads();

        let old_id = self.client_id();
        if old_id != 0 && self.shared.send_client_message(wire::encode_unsubscribe).is_err() {
            debug!("Failed to unsubscribe stale client {}", old_id);
        }
        self.shared.mark_disconnected();
        self.shared.last_link_seq.store(0, Ordering::Release);

        let client_id = subscribe(&self.shared.socket, &self.name, self.config.connect_timeout)?;
        self.shared.client_id.store(client_id, Ordering::Release);
        self.shared.mark_heard();
        self.shared.connected.store(true, Ordering::Release);
        self.start_threads()?;

        if self.shared.handshake.is_ready()
            && let Err(e) = self.shared.send_client_message(wire::encode_ready_for_next)
        {
            warn!("Client {}: failed to re-report ready: {}", client_id, e);
        }
        info!(
            "Re-subscribed to {} as client {} (was {})",
            self.coordinator_addr, client_id, old_id
        );
        Ok(())
    }

    /// 重新订阅（自动重试）
    pub fn reconnect_with_retry(
        &mut self,
        max_retries: u32,
        retry_interval: Duration,
    ) -> Result<(), SyncError> {
        let mut last_error = SyncError::NotConnected;
        for attempt in 1..=max_retries {
            match self.reconnect() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Reconnect attempt {}/{} failed: {}",
                        attempt, max_retries, e
                    );
                    last_error = e;
                    if attempt < max_retries {
                        thread::sleep(retry_interval);
                    }
                },
            }
        }
        Err(last_error)
    }

    fn start_threads(&mut self) -> Result<(), SyncError> {
        self.shared.running.store(true, Ordering::Release);

        let rx = {
            let shared = Arc::clone(&self.shared);
            let link_timeout = self.config.link_timeout;
            thread::Builder::new()
                .name("sync_client_rx".into())
                .spawn(move || sync_client_rx_loop(shared, link_timeout))
        };
        match rx {
            Ok(handle) => self.rx_thread = Some(handle),
            Err(source) => {
                self.shared.running.store(false, Ordering::Release);
                return Err(SyncError::ThreadSpawn {
                    name: "sync_client_rx",
                    source,
                });
            },
        }

        let heartbeat = {
            let shared = Arc::clone(&self.shared);
            let interval = self.config.heartbeat_interval;
            thread::Builder::new()
                .name("sync_heartbeat".into())
                .spawn(move || sync_heartbeat_loop(shared, interval))
        };
        match heartbeat {
            Ok(handle) => self.heartbeat_thread = Some(handle),
            Err(source) => {
                self.stop_threads();
                return Err(SyncError::ThreadSpawn {
                    name: "sync_heartbeat",
                    source,
                });
            },
        }
        Ok(())
    }

    fn stop_threads(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for (name, handle) in [
            ("sync_client_rx", self.rx_thread.take()),
            ("sync_heartbeat", self.heartbeat_thread.take()),
        ] {
            if let Some(handle) = handle
                && handle.join().is_err()
            {
                warn!("{} thread panicked", name);
            }
        }
    }
}

impl TriggerEndpoint for SyncClient {
    fn take_trigger(&self) -> Option<TriggerEvent> {
        if !self.is_connected() {
            self.shared.mark_disconnected();
            return None;
        }
        self.shared.handshake.take()
    }

    fn set_ready(&self) {
        self.shared.handshake.set_ready(true);
        if !self.shared.connected.load(Ordering::Acquire) {
            debug!("Client {}: not connected, ready not reported", self.client_id());
            return;
        }
        if let Err(e) = self.shared.send_client_message(wire::encode_ready_for_next) {
            warn!("Client {}: failed to report ready: {}", self.client_id(), e);
        }
    }

    fn unset_ready(&self) {
        self.shared.handshake.set_ready(false);
        if !self.shared.connected.load(Ordering::Acquire) {
            debug!("Client {}: not connected, busy not reported", self.client_id());
            return;
        }
        if let Err(e) = self.shared.send_client_message(wire::encode_busy) {
            warn!("Client {}: failed to report busy: {}", self.client_id(), e);
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
            && self.shared.silence() < self.config.link_timeout
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.stop_threads();
        if self.shared.connected.load(Ordering::Acquire) {
            let _ = self.shared.send_client_message(wire::encode_unsubscribe);
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("name", &self.name)
            .field("coordinator", &self.coordinator_addr)
            .field("stats", &self.stats())
            .finish()
    }
}

/// 发送 Subscribe 并等待 SubscribeAck
///
/// 只发送一次：协调器按地址替换旧订阅，重发会让先到的 ACK 失效。
fn subscribe(socket: &UdpSocket, name: &str, timeout: Duration) -> Result<ClientId, SyncError> {
    let mut buf = [0u8; MAX_MESSAGE_LEN];
    let encoded = wire::encode_subscribe(name, &mut buf)?;
    socket.send(encoded)?;

    let start = Instant::now();
    let mut ack_buf = [0u8; MAX_MESSAGE_LEN];
    loop {
        if start.elapsed() > timeout {
            return Err(SyncError::ConnectTimeout(timeout));
        }

        let len = match socket.recv(&mut ack_buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e.into()),
        };

        match decode_message(&ack_buf[..len]) {
            Ok(Message::SubscribeAck { client_id, status }) => {
                if status != STATUS_OK {
                    return Err(SyncError::Rejected(status));
                }
                return Ok(client_id);
            },
            Ok(Message::Error { code, message }) => {
                return Err(SyncError::Remote { code, message });
            },
            // 旧订阅的残留报文
            Ok(_) => continue,
            Err(e) => {
                debug!("Ignoring malformed datagram during subscribe: {}", e);
                continue;
            },
        }
    }
}

/// 接收线程主循环
fn sync_client_rx_loop(shared: Arc<Shared>, link_timeout: Duration) {
    let mut buf = [0u8; MAX_MESSAGE_LEN];

    while shared.running.load(Ordering::Acquire) {
        match shared.socket.recv(&mut buf) {
            Ok(len) => match decode_message(&buf[..len]) {
                Ok(msg) => shared.handle_message(msg),
                Err(e) => debug!("Ignoring malformed datagram: {}", e),
            },
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {},
            Err(e) => {
                if shared.mark_disconnected() {
                    warn!("Link to coordinator lost: {}", e);
                }
                // 避免在持续报错的套接字上空转
                thread::sleep(Duration::from_millis(10));
            },
        }

        if shared.connected.load(Ordering::Acquire)
            && shared.silence() >= link_timeout
            && shared.mark_disconnected()
        {
            warn!(
                "No message from coordinator for {:?}, link considered lost",
                link_timeout
            );
        }
    }
    trace!("sync_client_rx: exiting");
}

/// 心跳线程主循环
fn sync_heartbeat_loop(shared: Arc<Shared>, interval: Duration) {
    const STEP: Duration = Duration::from_millis(50);

    while shared.running.load(Ordering::Acquire) {
        if let Err(e) = shared.send_client_message(wire::encode_heartbeat) {
            debug!("Failed to send heartbeat: {}", e);
        }

        let mut slept = Duration::ZERO;
        while slept < interval && shared.running.load(Ordering::Acquire) {
            let step = STEP.min(interval - slept);
            thread::sleep(step);
            slept += step;
        }
    }
    trace!("sync_heartbeat: exiting");
}
