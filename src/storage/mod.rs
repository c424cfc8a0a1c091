//! 持久化存储
//!
//! LSM 架构：WAL 先行 + MemTable 内存表 + SSTable 磁盘表。
//! `engine` 负责编排；`KvStore` 是对外的最小能力集，HTTP/TCP 门面
//! 只依赖该 trait，不感知引擎内部。

pub mod engine;
pub mod memtable;
pub mod merge;
pub mod record;
pub mod sstable;
pub mod wal;

pub mod compaction;

use crate::storage::merge::RangeScan;
use crate::storage::record::Record;
use crate::Result;

/// 存储引擎最小能力集
///
/// 门面层（HTTP / TCP）对此多态；引擎的构造与恢复（initialize）由
/// `LsmEngine::open` 完成，不进入能力集。
pub trait KvStore: Send + Sync {
    /// 写入一个键值对
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// 删除一个 key（写入墓碑）
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// 批量写入，逐条落 WAL，返回写入条数
    ///
    /// 持久性按条生效：崩溃后批次可能只有前缀可见。
    fn batch_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<usize>;

    /// 点查。`None` 表示不存在（含墓碑命中）。
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// 闭区间有序范围扫描
    fn read_key_range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<RangeScan>;

    /// 停止后台任务并关闭资源
    fn close(&self) -> Result<()>;
}

/// 引擎侧的复制出口
///
/// primary 角色的引擎在写路径上调用；`submit` 在引擎互斥锁内执行以保证
/// 发送顺序与序列号一致，`wait_acked` 在锁外阻塞等待 backup 确认。
pub trait Replicator: Send + Sync {
    fn submit(&self, record: &Record) -> Result<()>;

    fn wait_acked(&self, seq: u64) -> Result<()>;
}
