//! 每个订阅者的握手状态
//!
//! 每个客户端最多持有一个待处理的触发：新的投递会覆盖旧的，覆盖只计数不阻止。
//! 待处理触发存放在 `ArcSwapOption` 中，投递与读取都是一次原子交换，
//! 因此读取严格“只消费一次”，不会与并发投递交错出重复事件。

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use trigsync_protocol::TriggerEvent;

/// 握手状态
#[derive(Debug, Default)]
pub struct HandshakeState {
    ready: AtomicBool,
    pending: ArcSwapOption<TriggerEvent>,
    last_delivered: AtomicU64,
    delivered: AtomicU64,
    consumed: AtomicU64,
    overwritten: AtomicU64,
    discarded: AtomicU64,
}

impl HandshakeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    /// 投递一个触发；若覆盖了尚未读取的触发则返回 true
    pub fn deliver(&self, event: TriggerEvent) -> bool {
        self.record_delivery(&event);
        let overwrote = self.pending.swap(Some(Arc::new(event))).is_some();
        if overwrote {
            self.record_overwrite();
        }
        overwrote
    }

    /// 取走待处理的触发（只消费一次）
    pub fn take(&self) -> Option<TriggerEvent> {
        let event = self.pending.swap(None).map(|event| *event)?;
        self.record_consumed();
        Some(event)
    }

    /// 是否有待处理的触发（不消费）
    pub fn has_pending(&self) -> bool {
        self.pending.load().is_some()
    }

    /// 丢弃待处理的触发（链路丢失时调用）；返回是否确有丢弃
    pub fn clear(&self) -> bool {
        let had = self.pending.swap(None).is_some();
        if had {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
        had
    }

    pub(crate) fn record_delivery(&self, event: &TriggerEvent) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.last_delivered.store(event.sequence, Ordering::Relaxed);
    }

    pub(crate) fn record_overwrite(&self) {
        self.overwritten.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self, count: u64) {
        self.discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            ready: self.is_ready(),
            last_delivered_sequence: self.last_delivered.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// 端点统计快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointStats {
    pub ready: bool,
    /// 最近一次投递的触发序号（0 表示尚无投递）
    pub last_delivered_sequence: u64,
    pub delivered: u64,
    pub consumed: u64,
    /// 未读取就被新触发覆盖的次数
    pub overwritten: u64,
    /// 因链路丢失被丢弃的次数
    pub discarded: u64,
}
