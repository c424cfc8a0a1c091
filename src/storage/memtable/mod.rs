// MemTable - 基于 SkipMap 的有序并发内存表
//
// 特性：
// - 无锁并发读（Lock-free SkipMap），写入由引擎互斥锁串行化
// - 按 key 字节序自动排序
// - 墓碑删除：delete 写入 Tombstone，遮蔽更旧的值
// - 近似内存占用统计（key + value + 固定开销），覆盖写替换旧贡献

use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 每条目固定开销（跳表节点 + 序列号 + 标记）
pub const ENTRY_OVERHEAD: usize = 32;

/// MemTable 中一个 key 的当前状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemValue {
    /// 有效值
    Put { seq: u64, value: Vec<u8> },
    /// 墓碑（已删除）
    Tombstone { seq: u64 },
}

impl MemValue {
    pub fn seq(&self) -> u64 {
        match self {
            MemValue::Put { seq, .. } => *seq,
            MemValue::Tombstone { seq } => *seq,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, MemValue::Tombstone { .. })
    }

    fn value_len(&self) -> usize {
        match self {
            MemValue::Put { value, .. } => value.len(),
            MemValue::Tombstone { .. } => 0,
        }
    }
}

/// 有序并发内存表
pub struct MemTable {
    data: SkipMap<Vec<u8>, MemValue>,
    size_bytes: AtomicUsize,
    sealed: AtomicBool,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
        }
    }

    /// 插入或覆盖一个值
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, seq: u64) {
        debug_assert!(!self.is_sealed(), "write into sealed memtable");
        self.apply(key, MemValue::Put { seq, value });
    }

    /// 写入墓碑
    pub fn delete(&self, key: Vec<u8>, seq: u64) {
        debug_assert!(!self.is_sealed(), "write into sealed memtable");
        self.apply(key, MemValue::Tombstone { seq });
    }

    fn apply(&self, key: Vec<u8>, value: MemValue) {
        let new_contribution = key.len() + value.value_len() + ENTRY_OVERHEAD;
        let old_contribution = self
            .data
            .get(&key)
            .map(|entry| entry.key().len() + entry.value().value_len() + ENTRY_OVERHEAD);

        self.data.insert(key, value);

        match old_contribution {
            Some(old) => {
                if new_contribution >= old {
                    self.size_bytes
                        .fetch_add(new_contribution - old, Ordering::Relaxed);
                } else {
                    self.size_bytes
                        .fetch_sub(old - new_contribution, Ordering::Relaxed);
                }
            }
            None => {
                self.size_bytes.fetch_add(new_contribution, Ordering::Relaxed);
            }
        }
    }

    /// 点查。`None` 表示本表无记载（需继续向更旧的层查询）；
    /// `Some(Tombstone)` 表示已删除，查询到此为止。
    pub fn get(&self, key: &[u8]) -> Option<MemValue> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// 闭区间范围扫描，返回按 key 升序的快照
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, MemValue)> {
        if start > end {
            return Vec::new();
        }
        self.data
            .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// 全量有序快照（flush 时使用）
    pub fn iter_all(&self) -> Vec<(Vec<u8>, MemValue)> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// 近似内存占用
    pub fn approximate_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 封存：之后不再接受写入
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let memtable = MemTable::new();
        memtable.put(b"user:1".to_vec(), b"Alice".to_vec(), 1);

        match memtable.get(b"user:1") {
            Some(MemValue::Put { seq, value }) => {
                assert_eq!(seq, 1);
                assert_eq!(value, b"Alice");
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(memtable.get(b"user:2").is_none());
    }

    #[test]
    fn test_overwrite_replaces() {
        let memtable = MemTable::new();
        memtable.put(b"k".to_vec(), b"v1".to_vec(), 1);
        memtable.put(b"k".to_vec(), b"v2-longer".to_vec(), 2);

        assert_eq!(memtable.len(), 1);
        match memtable.get(b"k") {
            Some(MemValue::Put { seq, value }) => {
                assert_eq!(seq, 2);
                assert_eq!(value, b"v2-longer");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tombstone_shadows_value() {
        let memtable = MemTable::new();
        memtable.put(b"user:del".to_vec(), b"X".to_vec(), 1);
        memtable.delete(b"user:del".to_vec(), 2);

        match memtable.get(b"user:del") {
            Some(MemValue::Tombstone { seq }) => assert_eq!(seq, 2),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(memtable.len(), 1);
    }

    #[test]
    fn test_scan_ordered_inclusive() {
        let memtable = MemTable::new();
        for i in (0..30u32).rev() {
            memtable.put(
                format!("rng:{:03}", i).into_bytes(),
                format!("v{}", i).into_bytes(),
                (30 - i) as u64,
            );
        }

        let results = memtable.scan(b"rng:005", b"rng:015");
        assert_eq!(results.len(), 11);
        assert_eq!(results.first().unwrap().0, b"rng:005");
        assert_eq!(results.last().unwrap().0, b"rng:015");

        // 升序
        for window in results.windows(2) {
            assert!(window[0].0 < window[1].0);
        }

        // start > end 返回空
        assert!(memtable.scan(b"rng:020", b"rng:010").is_empty());
    }

    #[test]
    fn test_size_accounting() {
        let memtable = MemTable::new();
        assert_eq!(memtable.approximate_bytes(), 0);

        memtable.put(b"key".to_vec(), b"value".to_vec(), 1);
        let first = memtable.approximate_bytes();
        assert_eq!(first, 3 + 5 + ENTRY_OVERHEAD);

        // 覆盖写替换旧贡献而不是累加
        memtable.put(b"key".to_vec(), b"vv".to_vec(), 2);
        assert_eq!(memtable.approximate_bytes(), 3 + 2 + ENTRY_OVERHEAD);

        // 墓碑只计 key + 开销
        memtable.delete(b"key".to_vec(), 3);
        assert_eq!(memtable.approximate_bytes(), 3 + ENTRY_OVERHEAD);
    }

    #[test]
    fn test_empty_value_accepted() {
        let memtable = MemTable::new();
        memtable.put(b"k".to_vec(), Vec::new(), 1);

        match memtable.get(b"k") {
            Some(MemValue::Put { value, .. }) => assert!(value.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_seal() {
        let memtable = MemTable::new();
        memtable.put(b"a".to_vec(), b"1".to_vec(), 1);
        memtable.seal();
        assert!(memtable.is_sealed());

        // 封存后仍可读
        assert!(memtable.get(b"a").is_some());
    }

    #[test]
    fn test_concurrent_reads_during_writes() {
        use std::sync::Arc;
        use std::thread;

        let memtable = Arc::new(MemTable::new());

        let writer = {
            let mt = memtable.clone();
            thread::spawn(move || {
                for i in 0..1000u64 {
                    mt.put(format!("k{:04}", i).into_bytes(), b"v".to_vec(), i + 1);
                }
            })
        };

        let reader = {
            let mt = memtable.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let _ = mt.scan(b"k0000", b"k9999");
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(memtable.len(), 1000);
    }
}
