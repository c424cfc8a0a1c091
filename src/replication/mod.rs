//! 主从复制模块
//!
//! primary → backup 的同步复制链路：
//!
//! ```text
//! Primary                              Backup
//!   |                                    |
//!   |-- handshake [magic|version|id] --->|
//!   |-- op frame (WAL 同款帧) ---------->|  按原始序列号应用
//!   |<------------- ACK [len|ack_seq] ---|
//!   |-- op frame ----------------------->|
//!   |<------------- ACK ----------------|
//! ```
//!
//! - sync-sync 模式：primary 的写入调用阻塞到对应序列号被 ACK 或超时
//! - 断线后指数退避重连，重连成功先按序重发未确认窗口
//! - backup 按序列号幂等：重复帧跳过但照常 ACK，跳号则断开连接

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ReplicationClient, ReplicationClientConfig};
pub use server::{ReplicationServer, ReplicationServerConfig};

use serde::Serialize;

/// 复制状态快照（HTTP 状态端点消费）
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationState {
    pub role: String,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sent_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_acked_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_seq: Option<u64>,
}

/// 复制指标快照
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops_acked: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops_applied: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops_skipped: Option<u64>,
}

/// 状态提供方能力
///
/// HTTP 门面只依赖本 trait；primary 客户端与 backup 服务端各自实现，
/// 避免门面感知复制内部结构。
pub trait ReplicationStatusProvider: Send + Sync {
    fn state(&self) -> ReplicationState;
    fn metrics(&self) -> ReplicationMetrics;
}
