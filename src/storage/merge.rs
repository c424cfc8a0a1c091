// 归并迭代器 - MemTable 与全部 SSTable 的 k 路有序去重视图
//
// 源按新旧排列（下标越小越新）：活跃 MemTable、封存 MemTable、SSTable 从新到旧。
// 最小堆按 (key, 源下标) 排序；同一 key 出现在多个源时取序列号最大者，
// 序列号相同（理论上仅发生在 flush 安装与封存表丢弃之间的短暂重叠）按源新旧取新。
//
// MergeIterator 产出每个 key 的胜者（含墓碑，供 compaction 使用）；
// RangeScan 在其上过滤墓碑、应用 limit，产出 (key, value) 给读路径。

use crate::storage::memtable::MemValue;
use crate::Result;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// 归并源：有序 (key, MemValue) 流
pub type MergeSource = Box<dyn Iterator<Item = Result<(Vec<u8>, MemValue)>> + Send>;

/// 把内存快照包装成归并源
pub fn vec_source(entries: Vec<(Vec<u8>, MemValue)>) -> MergeSource {
    Box::new(entries.into_iter().map(Ok))
}

struct HeapEntry {
    key: Vec<u8>,
    value: MemValue,
    src: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.src == other.src
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap 是最大堆，反转得到 (key, src) 最小堆
        (&other.key, other.src).cmp(&(&self.key, self.src))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// k 路归并，产出每个 key 的最新版本（含墓碑）
pub struct MergeIterator {
    sources: Vec<MergeSource>,
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl MergeIterator {
    /// `sources` 按优先级排列：下标 0 最新
    pub fn new(sources: Vec<MergeSource>) -> Result<Self> {
        let mut iter = Self {
            sources,
            heap: BinaryHeap::new(),
            failed: false,
        };
        for src in 0..iter.sources.len() {
            iter.advance(src)?;
        }
        Ok(iter)
    }

    fn advance(&mut self, src: usize) -> Result<()> {
        if let Some(item) = self.sources[src].next() {
            let (key, value) = item?;
            self.heap.push(HeapEntry { key, value, src });
        }
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<(Vec<u8>, MemValue)>> {
        let mut best = match self.heap.pop() {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.advance(best.src)?;

        // 吸收其余源中的同一 key，序列号严格更大者获胜；
        // 同 key 条目按 src 升序弹出，平局保留先弹出（更新的源）的那条。
        while let Some(peek) = self.heap.peek() {
            if peek.key != best.key {
                break;
            }
            let dup = self.heap.pop().unwrap();
            self.advance(dup.src)?;
            if dup.value.seq() > best.value.seq() {
                best = dup;
            }
        }

        Ok(Some((best.key, best.value)))
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Vec<u8>, MemValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// 面向读路径的范围扫描：过滤墓碑、应用 limit
pub struct RangeScan {
    inner: MergeIterator,
    limit: Option<usize>,
    emitted: usize,
}

impl RangeScan {
    pub fn new(sources: Vec<MergeSource>, limit: Option<usize>) -> Result<Self> {
        Ok(Self {
            inner: MergeIterator::new(sources)?,
            limit,
            emitted: 0,
        })
    }
}

impl Iterator for RangeScan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                return None;
            }
        }

        loop {
            match self.inner.next()? {
                Ok((key, MemValue::Put { value, .. })) => {
                    self.emitted += 1;
                    return Some(Ok((key, value)));
                }
                // 墓碑：检视但不产出
                Ok((_, MemValue::Tombstone { .. })) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
