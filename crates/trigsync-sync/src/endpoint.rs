//! 订阅端握手接口
//!
//! 前端的读出路径只面对 [`TriggerEndpoint`]：轮询是否有触发（只消费一次），
//! 并报告自己的就绪状态。就绪状态的上报是尽力而为的，发送失败只记录日志。
//!
//! 链路不可用时 `has_trigger()` 返回 false 并丢弃待处理的触发，绝不阻塞。

use crate::ClientId;
use crate::coordinator::{ClientLink, SyncCoordinator};
use crate::error::SyncError;
use crate::handshake::{EndpointStats, HandshakeState};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use trigsync_protocol::TriggerEvent;

/// 订阅端握手接口
pub trait TriggerEndpoint: Send {
    /// 取走待处理的触发（只消费一次）
    fn take_trigger(&self) -> Option<TriggerEvent>;

    /// 是否有触发可读；返回 true 的同时消费该触发
    fn has_trigger(&self) -> bool {
        self.take_trigger().is_some()
    }

    /// 标记为可接受下一个触发
    fn set_ready(&self);

    /// 标记为忙
    fn unset_ready(&self);

    fn is_connected(&self) -> bool;
}

impl<T: TriggerEndpoint + Sync + ?Sized> TriggerEndpoint for Arc<T> {
    fn take_trigger(&self) -> Option<TriggerEvent> {
        (**self).take_trigger()
    }

    fn set_ready(&self) {
        (**self).set_ready()
    }

    fn unset_ready(&self) {
        (**self).unset_ready()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// 进程内链路的协调器一侧
///
/// 容量为 1 的通道：满时先取出旧触发再放入新触发（覆盖并计数）。
pub(crate) struct LocalLink {
    tx: Sender<TriggerEvent>,
    drain: Receiver<TriggerEvent>,
    state: Arc<HandshakeState>,
}

/// 进程内链路的端点一侧
pub(crate) struct LocalParts {
    rx: Receiver<TriggerEvent>,
    state: Arc<HandshakeState>,
}

impl LocalLink {
    pub(crate) fn pair() -> (Self, LocalParts) {
        let (tx, rx) = bounded(1);
        let state = Arc::new(HandshakeState::new());
        let link = Self {
            tx,
            drain: rx.clone(),
            state: Arc::clone(&state),
        };
        (link, LocalParts { rx, state })
    }
}

impl ClientLink for LocalLink {
    fn deliver(&self, _link_seq: u32, event: &TriggerEvent) -> Result<(), SyncError> {
        // 通道本身保序，链路序号无需随事件传递
        self.state.record_delivery(event);
        match self.tx.try_send(*event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                if self.drain.try_recv().is_ok() {
                    self.state.record_overwrite();
                }
                match self.tx.try_send(event) {
                    // 并发投递抢先填满时，新事件本身就被覆盖了
                    Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
                    Err(TrySendError::Disconnected(_)) => Err(SyncError::NotConnected),
                }
            },
            Err(TrySendError::Disconnected(_)) => Err(SyncError::NotConnected),
        }
    }
}

/// 进程内订阅端点
///
/// 由 [`SyncCoordinator::register_client`] 创建。协调器被销毁或该客户端被注销后，
/// 链路视为丢失。端点销毁时自动注销。
pub struct LocalEndpoint {
    id: ClientId,
    coordinator: Weak<SyncCoordinator>,
    rx: Receiver<TriggerEvent>,
    state: Arc<HandshakeState>,
}

impl LocalEndpoint {
    pub(crate) fn new(id: ClientId, coordinator: Weak<SyncCoordinator>, parts: LocalParts) -> Self {
        Self {
            id,
            coordinator,
            rx: parts.rx,
            state: parts.state,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    pub fn stats(&self) -> EndpointStats {
        self.state.stats()
    }

    fn discard_pending(&self) {
        let discarded = self.rx.try_iter().count() as u64;
        if discarded > 0 {
            self.state.record_discarded(discarded);
            debug!("Client {}: discarded {} trigger(s) after link loss", self.id, discarded);
        }
    }
}

impl TriggerEndpoint for LocalEndpoint {
    fn take_trigger(&self) -> Option<TriggerEvent> {
        if !self.is_connected() {
            self.discard_pending();
            return None;
        }
        let event = self.rx.try_recv().ok()?;
        self.state.record_consumed();
        Some(event)
    }

    fn set_ready(&self) {
        self.state.set_ready(true);
        match self.coordinator.upgrade() {
            Some(coordinator) => {
                if let Err(e) = coordinator.set_ready(self.id) {
                    warn!("Client {}: failed to report ready: {}", self.id, e);
                }
            },
            None => debug!("Client {}: coordinator gone, ready not reported", self.id),
        }
    }

    fn unset_ready(&self) {
        self.state.set_ready(false);
        match self.coordinator.upgrade() {
            Some(coordinator) => {
                if let Err(e) = coordinator.unset_ready(self.id) {
                    warn!("Client {}: failed to report busy: {}", self.id, e);
                }
            },
            None => debug!("Client {}: coordinator gone, busy not reported", self.id),
        }
    }

    fn is_connected(&self) -> bool {
        self.coordinator
            .upgrade()
            .is_some_and(|coordinator| coordinator.contains(self.id))
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.unregister(self.id);
        }
    }
}

impl std::fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEndpoint")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_trigger_true_once_per_event() {
        let coordinator = Arc::new(SyncCoordinator::default());
        let (_id, endpoint) = coordinator.register_client("adc");

        assert!(!endpoint.has_trigger());
        coordinator.publish(&TriggerEvent::new(1, 100));
        assert!(endpoint.has_trigger());
        assert!(!endpoint.has_trigger());

        coordinator.publish(&TriggerEvent::new(2, 200));
        assert_eq!(endpoint.take_trigger(), Some(TriggerEvent::new(2, 200)));
        assert_eq!(endpoint.take_trigger(), None);
    }

    #[test]
    fn test_never_ready_still_receives_every_trigger() {
        let coordinator = Arc::new(SyncCoordinator::default());
        let (_id, endpoint) = coordinator.register_client("lazy");

        for seq in 1..=5 {
            coordinator.publish(&TriggerEvent::new(seq, 0));
            assert!(endpoint.has_trigger(), "trigger {} not seen", seq);
        }
        assert_eq!(coordinator.metrics().delivered_while_busy, 5);
    }

    #[test]
    fn test_unread_trigger_is_overwritten() {
        let coordinator = Arc::new(SyncCoordinator::default());
        let (_id, endpoint) = coordinator.register_client("slow");

        coordinator.publish(&TriggerEvent::new(1, 0));
        coordinator.publish(&TriggerEvent::new(2, 0));
        coordinator.publish(&TriggerEvent::new(3, 0));

        assert_eq!(endpoint.take_trigger().unwrap().sequence, 3);
        assert!(endpoint.take_trigger().is_none());
        let stats = endpoint.stats();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.overwritten, 2);
        assert_eq!(stats.consumed, 1);
    }

    #[test]
    fn test_ready_forwarded_to_coordinator() {
        let coordinator = Arc::new(SyncCoordinator::default());
        let (id, endpoint) = coordinator.register_client("adc");

        endpoint.set_ready();
        assert!(coordinator.client_view(id).unwrap().ready);
        assert!(endpoint.stats().ready);
        endpoint.unset_ready();
        assert!(!coordinator.client_view(id).unwrap().ready);
    }

    #[test]
    fn test_link_loss_discards_pending() {
        let coordinator = Arc::new(SyncCoordinator::default());
        let (id, endpoint) = coordinator.register_client("adc");

        coordinator.publish(&TriggerEvent::new(1, 0));
        assert!(coordinator.unregister(id));
        assert!(!endpoint.is_connected());
        assert!(!endpoint.has_trigger());
        assert_eq!(endpoint.stats().discarded, 1);

        // 未注册时设置就绪只记录日志，不会 panic
        endpoint.set_ready();
    }

    #[test]
    fn test_coordinator_dropped() {
        let coordinator = Arc::new(SyncCoordinator::default());
        let (_id, endpoint) = coordinator.register_client("adc");
        coordinator.publish(&TriggerEvent::new(1, 0));
        drop(coordinator);

        assert!(!endpoint.is_connected());
        assert!(!endpoint.has_trigger());
        endpoint.unset_ready();
    }

    #[test]
    fn test_drop_unregisters() {
        let coordinator = Arc::new(SyncCoordinator::default());
        let (id, endpoint) = coordinator.register_client("adc");
        assert!(coordinator.contains(id));
        drop(endpoint);
        assert!(!coordinator.contains(id));
    }
}
