//! # trigsync Sync
//!
//! 触发主控与订阅前端之间的就绪握手。
//!
//! ## 模块
//!
//! - `coordinator`: 订阅者表，向每个订阅者投递触发并记录就绪状态
//! - `handshake`: 每个订阅者“最多一个待处理触发”的握手状态
//! - `endpoint`: 前端看到的 [`TriggerEndpoint`] 接口及进程内实现
//! - `server` / `client`: UDP 传输（协调器一侧 / 前端一侧）
//! - `frontend`: 读出循环（忙 → 读出 → 就绪）
//!
//! ## 语义
//!
//! - 就绪只是提示：未就绪的前端同样会收到触发，协调器只计数
//! - 每个触发只能被读取一次；未读取的触发会被更新的触发覆盖
//! - 链路丢失后待处理的触发被丢弃，直到重新订阅

pub mod client;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod frontend;
pub mod handshake;
pub mod metrics;
pub mod server;

/// 协调器分配的客户端 ID（0 保留为无效值）
pub type ClientId = u32;

pub use client::{SyncClient, SyncClientConfig, SyncClientStats};
pub use coordinator::{ClientLink, ClientView, SyncConfig, SyncCoordinator};
pub use endpoint::{LocalEndpoint, TriggerEndpoint};
pub use error::SyncError;
pub use frontend::{PollOutcome, Readout, ReadoutError, SyncedFrontend};
pub use handshake::{EndpointStats, HandshakeState};
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use server::{ServerConfig, SyncServer};
