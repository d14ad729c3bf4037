//! 同步协调器（服务端）
//!
//! 维护订阅者表，把每个触发投递给所有订阅者，并记录各自的就绪状态。
//!
//! - 投递不看就绪状态：就绪只是提示，未就绪的客户端同样会收到触发（计入
//!   `delivered_while_busy`）
//! - 每个客户端有独立的链路序号，随每次投递递增，接收端据此丢弃乱序与重复报文
//! - `publish()` 只持有读锁，逐客户端计数器均为原子变量；投递失败不阻塞，
//!   连续失败达到上限后移除该客户端

use crate::ClientId;
use crate::endpoint::{LocalEndpoint, LocalLink};
use crate::error::SyncError;
use crate::metrics::{SyncMetrics, SyncMetricsSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use trigsync_protocol::{TriggerEvent, TriggerSink};

/// 协调器到单个客户端的投递通道
///
/// 实现必须是非阻塞的：`deliver` 在触发线程中被调用。
pub trait ClientLink: Send + Sync {
    /// 投递一个触发，`link_seq` 为该链路上的投递序号（从 1 开始）
    fn deliver(&self, link_seq: u32, event: &TriggerEvent) -> Result<(), SyncError>;

    /// 对端网络地址（进程内链路为 None）
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// 是否参与超时清理
    ///
    /// 进程内链路没有心跳，端点 drop 时注销，默认不参与。
    fn expires(&self) -> bool {
        self.peer_addr().is_some()
    }
}

/// 协调器配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 网络客户端无任何消息超过此时间即被清理
    pub client_timeout: Duration,
    /// 连续投递失败达到此次数即移除客户端
    pub max_consecutive_failures: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            client_timeout: Duration::from_secs(30),
            max_consecutive_failures: 1000,
        }
    }
}

/// 订阅者表项
struct ClientEntry {
    id: ClientId,
    name: String,
    link: Box<dyn ClientLink>,
    ready: AtomicBool,
    /// 已使用的最后一个链路序号
    link_seq: AtomicU32,
    last_sequence: AtomicU64,
    consecutive_failures: AtomicU32,
    /// 最后活动时刻（相对协调器创建时刻的微秒数）
    last_active_us: AtomicU64,
}

impl ClientEntry {
    fn view(&self) -> ClientView {
        ClientView {
            id: self.id,
            name: self.name.clone(),
            ready: self.ready.load(Ordering::Acquire),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            peer_addr: self.link.peer_addr(),
        }
    }
}

/// 订阅者的只读快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    pub id: ClientId,
    pub name: String,
    pub ready: bool,
    /// 最近一次成功投递的触发序号（0 表示尚无投递）
    pub last_sequence: u64,
    pub consecutive_failures: u32,
    pub peer_addr: Option<SocketAddr>,
}

/// 同步协调器
pub struct SyncCoordinator {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    /// 从 1 开始（0 保留为无效 ID），溢出后从 1 重新开始
    next_id: AtomicU32,
    config: SyncConfig,
    metrics: SyncMetrics,
    epoch: Instant,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            config,
            metrics: SyncMetrics::new(),
            epoch: Instant::now(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// 生成未被占用的客户端 ID（调用方持有写锁）
    fn generate_client_id(&self, clients: &HashMap<ClientId, ClientEntry>) -> ClientId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !clients.contains_key(&id) {
                return id;
            }
        }
    }

    /// 注册任意传输方式的客户端，初始为未就绪
    pub fn register_link(&self, name: impl Into<String>, link: Box<dyn ClientLink>) -> ClientId {
        let name = name.into();
        let peer = link.peer_addr();
        let mut clients = self.clients.write();
        let id = self.generate_client_id(&clients);
        clients.insert(
            id,
            ClientEntry {
                id,
                name: name.clone(),
                link,
                ready: AtomicBool::new(false),
                link_seq: AtomicU32::new(0),
                last_sequence: AtomicU64::new(0),
                consecutive_failures: AtomicU32::new(0),
                last_active_us: AtomicU64::new(self.now_us()),
            },
        );
        drop(clients);

        self.metrics.clients_registered.fetch_add(1, Ordering::Relaxed);
        match peer {
            Some(addr) => info!("Client {} ({}) subscribed from {}", id, name, addr),
            None => info!("Client {} ({}) subscribed in-process", id, name),
        }
        id
    }

    /// 注册进程内客户端
    pub fn register_client(self: &Arc<Self>, name: impl Into<String>) -> (ClientId, LocalEndpoint) {
        let (link, endpoint_parts) = LocalLink::pair();
        let id = self.register_link(name, Box::new(link));
        (id, LocalEndpoint::new(id, Arc::downgrade(self), endpoint_parts))
    }

    /// 注销客户端；返回该客户端此前是否存在
    pub fn unregister(&self, id: ClientId) -> bool {
        let removed = self.clients.write().remove(&id);
        match removed {
            Some(entry) => {
                info!("Client {} ({}) unsubscribed", id, entry.name);
                true
            },
            None => false,
        }
    }

    /// 向所有订阅者投递触发，返回成功投递的客户端数
    pub fn publish(&self, event: &TriggerEvent) -> usize {
        self.metrics.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let clients = self.clients.read();
            for entry in clients.values() {
                let link_seq = entry.link_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
                match entry.link.deliver(link_seq, event) {
                    Ok(()) => {
                        delivered += 1;
                        self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                        if !entry.ready.load(Ordering::Acquire) {
                            self.metrics
                                .delivered_while_busy
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        entry.last_sequence.store(event.sequence, Ordering::Relaxed);
                        entry.consecutive_failures.store(0, Ordering::Relaxed);
                    },
                    Err(e) => {
                        self.metrics.delivery_failures.fetch_add(1, Ordering::Relaxed);
                        let failures =
                            entry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        if failures == 1 {
                            warn!(
                                "Failed to deliver trigger #{} to client {} ({}): {}",
                                event.sequence, entry.id, entry.name, e
                            );
                        }
                        if failures >= self.config.max_consecutive_failures {
                            dead.push(entry.id);
                        }
                    },
                }
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write();
            for id in dead {
                if let Some(entry) = clients.remove(&id) {
                    self.metrics.clients_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Client {} ({}) dropped after {} consecutive delivery failures",
                        id, entry.name, self.config.max_consecutive_failures
                    );
                }
            }
        }

        delivered
    }

    fn with_client<T>(
        &self,
        id: ClientId,
        f: impl FnOnce(&ClientEntry) -> T,
    ) -> Result<T, SyncError> {
        let clients = self.clients.read();
        let entry = clients.get(&id).ok_or(SyncError::UnknownClient(id))?;
        entry.last_active_us.store(self.now_us(), Ordering::Relaxed);
        Ok(f(entry))
    }

    /// 客户端可以接受下一个触发
    pub fn set_ready(&self, id: ClientId) -> Result<(), SyncError> {
        self.with_client(id, |entry| entry.ready.store(true, Ordering::Release))?;
        debug!("Client {} ready", id);
        Ok(())
    }

    /// 客户端正忙（读出中）
    pub fn unset_ready(&self, id: ClientId) -> Result<(), SyncError> {
        self.with_client(id, |entry| entry.ready.store(false, Ordering::Release))?;
        debug!("Client {} busy", id);
        Ok(())
    }

    /// 更新活动时间（心跳）
    pub fn touch(&self, id: ClientId) -> Result<(), SyncError> {
        self.with_client(id, |_| ())
    }

    /// 清理超时的网络客户端，返回被清理的数量
    pub fn cleanup_timeout(&self) -> usize {
        let now = self.now_us();
        let timeout_us = self.config.client_timeout.as_micros() as u64;

        let expired: Vec<ClientId> = self
            .clients
            .read()
            .values()
            .filter(|entry| {
                entry.link.expires()
                    && now.saturating_sub(entry.last_active_us.load(Ordering::Relaxed))
                        >= timeout_us
            })
            .map(|entry| entry.id)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut clients = self.clients.write();
        let mut removed = 0;
        for id in expired {
            if let Some(entry) = clients.remove(&id) {
                removed += 1;
                self.metrics.clients_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Client {} ({}) timed out after {:?} without activity",
                    id, entry.name, self.config.client_timeout
                );
            }
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn client_view(&self, id: ClientId) -> Option<ClientView> {
        self.clients.read().get(&id).map(ClientEntry::view)
    }

    /// 所有订阅者快照（按 ID 排序）
    pub fn clients(&self) -> Vec<ClientView> {
        let mut views: Vec<ClientView> = self.clients.read().values().map(ClientEntry::view).collect();
        views.sort_by_key(|view| view.id);
        views
    }

    /// 某个网络地址上已注册的客户端
    pub fn clients_at(&self, addr: SocketAddr) -> Vec<ClientId> {
        self.clients
            .read()
            .values()
            .filter(|entry| entry.link.peer_addr() == Some(addr))
            .map(|entry| entry.id)
            .collect()
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}

impl TriggerSink for SyncCoordinator {
    fn publish(&self, event: &TriggerEvent) {
        SyncCoordinator::publish(self, event);
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("clients", &self.client_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::TriggerEndpoint;
    use parking_lot::Mutex;

    /// 记录投递的 Mock 链路，可切换为失败
    #[derive(Clone, Default)]
    struct MockLink {
        deliveries: Arc<Mutex<Vec<(u32, u64)>>>,
        fail: Arc<AtomicBool>,
        peer: Option<SocketAddr>,
    }

    impl MockLink {
        fn remote(port: u16) -> Self {
            Self {
                peer: Some(SocketAddr::from(([127, 0, 0, 1], port))),
                ..Default::default()
            }
        }
    }

    impl ClientLink for MockLink {
        fn peer_addr(&self) -> Option<SocketAddr> {
            self.peer
        }

        fn deliver(&self, link_seq: u32, event: &TriggerEvent) -> Result<(), SyncError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(SyncError::NotConnected);
            }
            self.deliveries.lock().push((link_seq, event.sequence));
            Ok(())
        }
    }

    #[test]
    fn test_register_starts_not_ready() {
        let coordinator = SyncCoordinator::default();
        let id = coordinator.register_link("adc", Box::new(MockLink::default()));
        assert_ne!(id, 0);

        let view = coordinator.client_view(id).unwrap();
        assert_eq!(view.name, "adc");
        assert!(!view.ready);
        assert_eq!(view.last_sequence, 0);
        assert_eq!(view.peer_addr, None);
    }

    #[test]
    fn test_publish_ignores_readiness_and_stamps_link_seq() {
        let coordinator = SyncCoordinator::default();
        let busy = MockLink::default();
        let ready = MockLink::default();
        let busy_id = coordinator.register_link("busy", Box::new(busy.clone()));
        let ready_id = coordinator.register_link("ready", Box::new(ready.clone()));
        coordinator.set_ready(ready_id).unwrap();

        for seq in 1..=3 {
            assert_eq!(coordinator.publish(&TriggerEvent::new(seq, 0)), 2);
        }

        assert_eq!(*busy.deliveries.lock(), vec![(1, 1), (2, 2), (3, 3)]);
        assert_eq!(*ready.deliveries.lock(), vec![(1, 1), (2, 2), (3, 3)]);

        let metrics = coordinator.metrics();
        assert_eq!(metrics.published, 3);
        assert_eq!(metrics.delivered, 6);
        assert_eq!(metrics.delivered_while_busy, 3);
        assert_eq!(coordinator.client_view(busy_id).unwrap().last_sequence, 3);
    }

    #[test]
    fn test_unknown_client_errors() {
        let coordinator = SyncCoordinator::default();
        assert!(matches!(
            coordinator.set_ready(42),
            Err(SyncError::UnknownClient(42))
        ));
        assert!(matches!(
            coordinator.unset_ready(42),
            Err(SyncError::UnknownClient(42))
        ));
        assert!(coordinator.touch(42).is_err());
        assert!(!coordinator.unregister(42));
    }

    #[test]
    fn test_ready_toggle() {
        let coordinator = SyncCoordinator::default();
        let id = coordinator.register_link("x", Box::new(MockLink::default()));
        coordinator.set_ready(id).unwrap();
        assert!(coordinator.client_view(id).unwrap().ready);
        coordinator.unset_ready(id).unwrap();
        assert!(!coordinator.client_view(id).unwrap().ready);
    }

    #[test]
    fn test_failing_client_is_retried_then_dropped() {
        let coordinator = SyncCoordinator::new(SyncConfig {
            max_consecutive_failures: 3,
            ..Default::default()
        });
        let flaky = MockLink::default();
        let healthy = MockLink::default();
        let flaky_id = coordinator.register_link("flaky", Box::new(flaky.clone()));
        coordinator.register_link("healthy", Box::new(healthy.clone()));

        flaky.fail.store(true, Ordering::Relaxed);
        coordinator.publish(&TriggerEvent::new(1, 0));
        coordinator.publish(&TriggerEvent::new(2, 0));
        assert_eq!(
            coordinator.client_view(flaky_id).unwrap().consecutive_failures,
            2
        );

        // 恢复后计数清零，链路序号继续递增
        flaky.fail.store(false, Ordering::Relaxed);
        coordinator.publish(&TriggerEvent::new(3, 0));
        assert_eq!(*flaky.deliveries.lock(), vec![(3, 3)]);
        assert_eq!(
            coordinator.client_view(flaky_id).unwrap().consecutive_failures,
            0
        );

        flaky.fail.store(true, Ordering::Relaxed);
        for seq in 4..=6 {
            coordinator.publish(&TriggerEvent::new(seq, 0));
        }
        assert!(!coordinator.contains(flaky_id));
        assert_eq!(healthy.deliveries.lock().len(), 6);

        let metrics = coordinator.metrics();
        assert_eq!(metrics.delivery_failures, 5);
        assert_eq!(metrics.clients_dropped, 1);
    }

    #[test]
    fn test_cleanup_timeout() {
        let coordinator = SyncCoordinator::new(SyncConfig {
            client_timeout: Duration::from_millis(30),
            ..Default::default()
        });
        let stale = coordinator.register_link("stale", Box::new(MockLink::remote(40001)));
        let alive = coordinator.register_link("alive", Box::new(MockLink::remote(40002)));

        std::thread::sleep(Duration::from_millis(20));
        coordinator.touch(alive).unwrap();
        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(coordinator.cleanup_timeout(), 1);
        assert!(!coordinator.contains(stale));
        assert!(coordinator.contains(alive));
        assert_eq!(coordinator.metrics().clients_dropped, 1);
    }

    #[test]
    fn test_in_process_client_survives_cleanup() {
        let coordinator = Arc::new(SyncCoordinator::new(SyncConfig {
            client_timeout: Duration::from_millis(100),
            ..Default::default()
        }));
        // 从不报告就绪，也没有心跳
        let (id, endpoint) = coordinator.register_client("adc");
        let remote = coordinator.register_link("remote", Box::new(MockLink::remote(40003)));

        for seq in 1..=5 {
            std::thread::sleep(Duration::from_millis(40));
            coordinator.cleanup_timeout();
            coordinator.publish(&TriggerEvent::new(seq, 0));
            assert!(endpoint.has_trigger(), "firing {}", seq);
            assert!(endpoint.is_connected());
        }
        assert!(coordinator.contains(id));
        assert!(!coordinator.contains(remote));
        assert_eq!(coordinator.client_view(id).unwrap().last_sequence, 5);
        assert!(coordinator.metrics().delivered_while_busy >= 5);
    }

    #[test]
    fn test_clients_sorted_and_unregister() {
        let coordinator = SyncCoordinator::default();
        let a = coordinator.register_link("a", Box::new(MockLink::default()));
        let b = coordinator.register_link("b", Box::new(MockLink::default()));
        let ids: Vec<ClientId> = coordinator.clients().iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![a, b]);

        assert!(coordinator.unregister(a));
        assert_eq!(coordinator.client_count(), 1);
    }

    #[test]
    fn test_coordinator_as_trigger_sink() {
        let coordinator = Arc::new(SyncCoordinator::default());
        let link = MockLink::default();
        coordinator.register_link("sink", Box::new(link.clone()));

        let sink: Arc<dyn TriggerSink> = coordinator.clone();
        sink.publish(&TriggerEvent::new(9, 900));
        assert_eq!(*link.deliveries.lock(), vec![(1, 9)]);
    }
}
