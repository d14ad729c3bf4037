//! 触发事件发布
//!
//! 控制器每次成功发射后调用 [`TriggerPublisher::publish`]，把事件转发给：
//! - 注册的 [`TriggerSink`]（例如同步协调器）
//! - 本进程内的通道订阅者（有界通道，满则丢弃，不阻塞触发线程）
//!
//! 只关心最新触发的读者用 [`LatestTrigger`]：它作为 sink 注册，旧事件被覆盖而不是堆积。
//!
//! 发布器在启动前配置好，随后移交给控制器线程独占使用。

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};
use trigsync_protocol::{TriggerEvent, TriggerSink};

/// 单次发布的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOutcome {
    /// 成功送达的本地订阅者数
    pub delivered: usize,
    /// 因通道已满被丢弃的次数
    pub dropped: usize,
}

/// 触发事件发布器
#[derive(Default)]
pub struct TriggerPublisher {
    sinks: Vec<Arc<dyn TriggerSink>>,
    subscribers: Vec<Sender<TriggerEvent>>,
}

impl TriggerPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个下游 sink（调用顺序即转发顺序）
    pub fn add_sink(&mut self, sink: Arc<dyn TriggerSink>) -> &mut Self {
        self.sinks.push(sink);
        self
    }

    /// 创建一个本地订阅，`capacity` 为缓存的事件数（至少 1）
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<TriggerEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// 发布一个事件
    ///
    /// 不会阻塞：sink 自身保证非阻塞，本地订阅使用 `try_send`。
    /// 接收端已关闭的订阅会被移除。
    pub fn publish(&mut self, event: &TriggerEvent) -> PublishOutcome {
        for sink in &self.sinks {
            sink.publish(event);
        }

        let mut outcome = PublishOutcome::default();
        self.subscribers.retain(|tx| match tx.try_send(*event) {
            Ok(()) => {
                outcome.delivered += 1;
                true
            },
            Err(TrySendError::Full(_)) => {
                outcome.dropped += 1;
                true
            },
            Err(TrySendError::Disconnected(_)) => {
                trace!("Local trigger subscriber closed, removing");
                false
            },
        });

        if outcome.dropped > 0 {
            debug!(
                "Trigger #{} dropped for {} slow local subscriber(s)",
                event.sequence, outcome.dropped
            );
        }
        outcome
    }
}

/// 最新触发槽
///
/// 每个事件只能取走一次；未取走的事件被下一个覆盖。
#[derive(Debug, Default)]
pub struct LatestTrigger {
    slot: Mutex<Option<TriggerEvent>>,
    overwritten: AtomicU64,
}

impl LatestTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否有尚未取走的事件
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// 取走最新事件
    pub fn take(&self) -> Option<TriggerEvent> {
        self.slot.lock().take()
    }

    /// 丢弃未取走的事件
    pub fn clear(&self) {
        self.slot.lock().take();
    }

    /// 未被取走就被覆盖的事件数
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl TriggerSink for LatestTrigger {
    fn publish(&self, event: &TriggerEvent) {
        if self.slot.lock().replace(*event).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for TriggerPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerPublisher")
            .field("sinks", &self.sinks.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
