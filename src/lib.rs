//! # QAKV
//!
//! 高性能持久化 KV 存储引擎 - LSM 架构 + 主从复制
//!
//! ## 核心能力
//!
//! - **WAL**: 崩溃安全的写前日志（分 epoch、CRC 校验、可配置刷盘策略）
//! - **MemTable**: 无锁并发有序内存表（SkipMap），墓碑删除语义
//! - **SSTable**: 不可变有序磁盘表（前缀压缩数据块 + 稀疏索引 + Footer）
//! - **归并迭代器**: MemTable + 全部 SSTable 的 k 路有序去重视图
//! - **主从复制**: 长度帧 TCP 流 + ACK 流控 + 断线重连（sync-sync 模式）
//! - **对外服务**: HTTP API (基于 Actix-web) + TCP 流式写入
//!
//! ## 架构设计
//!
//! ```text
//! 客户端 (HTTP/TCP)
//!     ↓
//! Service Layer (service/)
//!     ↓
//! LSM Engine (storage/engine)
//!     ├── WAL (storage/wal)
//!     ├── MemTable (storage/memtable)
//!     ├── SSTable (storage/sstable)
//!     └── Replication (replication/)
//! ```
//!
//! ## 数据流
//!
//! 写入: 请求 → 引擎 → WAL append（按策略 fsync）→ MemTable 插入
//!       → (primary) 复制到 backup 并等待 ACK
//! 溢出: MemTable 封存 → 后台 flush 成 SSTable → 装入 Level-0 → 删除旧 WAL epoch
//! 读取: MemTable → 封存 MemTable → SSTable（从新到旧）
//! 扫描: 归并迭代器产出有序去重的 (key, value) 序列

// ============================================================================
// 外部依赖
// ============================================================================

// Web 框架
pub use actix_web;

// 并发工具
pub use crossbeam;
pub use parking_lot;

// 序列化
pub use serde;
pub use serde_json;

// 时间
pub use chrono;

// 日志
pub use log;

// 错误处理
pub use thiserror;

// ============================================================================
// 内部模块
// ============================================================================

/// 持久化存储（WAL / MemTable / SSTable / 引擎）
pub mod storage;

/// 主从复制系统
pub mod replication;

/// 对外服务层 (HTTP + TCP)
pub mod service;

/// 工具模块
pub mod utils;

// ============================================================================
// 重导出常用类型
// ============================================================================

pub use storage::engine::{EngineConfig, LsmEngine};
pub use storage::record::{RecordType, MAX_KEY_LEN, MAX_VALUE_LEN};
pub use storage::wal::SyncPolicy;
pub use storage::KvStore;

// ============================================================================
// 全局错误类型
// ============================================================================

/// 存储引擎错误类型
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// 输入不合法（空 key、超长、非法范围等），不重试
    #[error("Validation error: {0}")]
    Validation(String),

    /// 点查未命中或命中墓碑
    #[error("Key not found")]
    NotFound,

    /// 磁盘读写/fsync 失败
    #[error("IO error: {0}")]
    Io(String),

    /// SSTable 内 CRC 不匹配或格式损坏
    #[error("Corruption error: {0}")]
    Corruption(String),

    /// sync-sync 模式下等待 backup ACK 超时
    #[error("Replication timeout: {0}")]
    ReplicationTimeout(String),

    /// 复制链路断开且待发送窗口已满
    #[error("Replication disconnected: {0}")]
    ReplicationDisconnected(String),

    /// 复制协议错误（乱序序列号、非法帧）
    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

impl From<std::io::Error> for KvError {
    fn from(e: std::io::Error) -> Self {
        KvError::Io(e.to_string())
    }
}

// ============================================================================
// 测试模块
// ============================================================================
