// 数据块编解码 - 前缀压缩 + restart 点
//
// 条目格式：
// [shared_prefix_len:u16][unshared_len:u16][value_len:u32][type:u8][seq:u64][unshared_key][value]
//
// 每 RESTART_INTERVAL 条插入一个 restart 点（shared_prefix_len 归零），
// 块尾依次是 restart 偏移数组 (u32 × n)、restart 数量 (u32)、块级 CRC32。

use crate::storage::memtable::MemValue;
use crate::storage::record::RecordType;
use crate::{KvError, Result};

/// restart 点间隔
pub const RESTART_INTERVAL: usize = 16;

const ENTRY_HEADER: usize = 2 + 2 + 4 + 1 + 8;

/// 数据块构建器。调用方保证 key 严格升序。
pub struct BlockBuilder {
    buf: Vec<u8>,
    restarts: Vec<u32>,
    entry_count: usize,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            restarts: Vec::new(),
            entry_count: 0,
            first_key: Vec::new(),
            last_key: Vec::new(),
        }
    }

    pub fn add(&mut self, key: &[u8], value: &MemValue) {
        let shared = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };

        let (rtype, seq, value_bytes): (RecordType, u64, &[u8]) = match value {
            MemValue::Put { seq, value } => (RecordType::Put, *seq, value.as_slice()),
            MemValue::Tombstone { seq } => (RecordType::Delete, *seq, &[]),
        };

        let unshared = key.len() - shared;
        self.buf.extend_from_slice(&(shared as u16).to_le_bytes());
        self.buf.extend_from_slice(&(unshared as u16).to_le_bytes());
        self.buf
            .extend_from_slice(&(value_bytes.len() as u32).to_le_bytes());
        self.buf.push(rtype as u8);
        self.buf.extend_from_slice(&seq.to_le_bytes());
        self.buf.extend_from_slice(&key[shared..]);
        self.buf.extend_from_slice(value_bytes);

        if self.entry_count == 0 {
            self.first_key = key.to_vec();
        }
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.entry_count += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    /// 完成后的块总大小（含尾部）
    pub fn finished_len(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4 + 4
    }

    /// 封块：追加 restart 数组、数量与 CRC32
    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restarts {
            self.buf.extend_from_slice(&pos.to_le_bytes());
        }
        self.buf
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.buf);
        let crc = hasher.finalize();
        self.buf.extend_from_slice(&crc.to_le_bytes());

        self.buf
    }
}

impl Default for BlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// 解码整个数据块，校验 CRC，按序还原条目
pub fn decode_block(data: &[u8]) -> Result<Vec<(Vec<u8>, MemValue)>> {
    if data.len() < 8 {
        return Err(KvError::Corruption("block too short".to_string()));
    }

    let crc_off = data.len() - 4;
    let stored_crc = u32::from_le_bytes(data[crc_off..].try_into().unwrap());
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..crc_off]);
    if hasher.finalize() != stored_crc {
        return Err(KvError::Corruption("block crc mismatch".to_string()));
    }

    let count_off = crc_off - 4;
    let restart_count = u32::from_le_bytes(data[count_off..crc_off].try_into().unwrap()) as usize;
    let restart_bytes = restart_count * 4;
    if restart_bytes > count_off {
        return Err(KvError::Corruption("bad restart array".to_string()));
    }
    let entries_end = count_off - restart_bytes;

    let mut entries = Vec::new();
    let mut pos = 0usize;
    let mut prev_key: Vec<u8> = Vec::new();

    while pos < entries_end {
        if pos + ENTRY_HEADER > entries_end {
            return Err(KvError::Corruption("truncated block entry".to_string()));
        }

        let shared = u16::from_le_bytes(data[pos..pos + 2].try_into().unwrap()) as usize;
        let unshared = u16::from_le_bytes(data[pos + 2..pos + 4].try_into().unwrap()) as usize;
        let value_len = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let rtype = RecordType::from_u8(data[pos + 8])
            .ok_or_else(|| KvError::Corruption(format!("bad entry type {}", data[pos + 8])))?;
        let seq = u64::from_le_bytes(data[pos + 9..pos + 17].try_into().unwrap());
        pos += ENTRY_HEADER;

        if shared > prev_key.len() || pos + unshared + value_len > entries_end {
            return Err(KvError::Corruption("bad block entry bounds".to_string()));
        }

        let mut key = Vec::with_capacity(shared + unshared);
        key.extend_from_slice(&prev_key[..shared]);
        key.extend_from_slice(&data[pos..pos + unshared]);
        pos += unshared;

        let value = match rtype {
            RecordType::Put => MemValue::Put {
                seq,
                value: data[pos..pos + value_len].to_vec(),
            },
            RecordType::Delete => {
                if value_len != 0 {
                    return Err(KvError::Corruption(
                        "tombstone entry carries a value".to_string(),
                    ));
                }
                MemValue::Tombstone { seq }
            }
        };
        pos += value_len;

        prev_key = key.clone();
        entries.push((key, value));
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(seq: u64, value: &[u8]) -> MemValue {
        MemValue::Put {
            seq,
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_build_and_decode() {
        let mut builder = BlockBuilder::new();
        for i in 0..40u32 {
            let key = format!("rng:{:03}", i);
            builder.add(key.as_bytes(), &put(i as u64 + 1, b"value"));
        }
        assert_eq!(builder.first_key(), b"rng:000");

        let block = builder.finish();
        let entries = decode_block(&block).unwrap();

        assert_eq!(entries.len(), 40);
        for (i, (key, value)) in entries.iter().enumerate() {
            assert_eq!(key, format!("rng:{:03}", i).as_bytes());
            assert_eq!(value.seq(), i as u64 + 1);
        }
    }

    #[test]
    fn test_prefix_compression_across_restarts() {
        // 共享前缀很长的 key，覆盖多个 restart 区间
        let mut builder = BlockBuilder::new();
        for i in 0..50u32 {
            let key = format!("common-prefix:key:{:05}", i);
            builder.add(key.as_bytes(), &put(i as u64, &[]));
        }

        let block = builder.finish();
        let entries = decode_block(&block).unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[17].0, b"common-prefix:key:00017");
        assert_eq!(entries[49].0, b"common-prefix:key:00049");
    }

    #[test]
    fn test_tombstone_entry() {
        let mut builder = BlockBuilder::new();
        builder.add(b"alive", &put(1, b"v"));
        builder.add(b"dead", &MemValue::Tombstone { seq: 2 });

        let entries = decode_block(&builder.finish()).unwrap();
        assert!(!entries[0].1.is_tombstone());
        assert!(entries[1].1.is_tombstone());
        assert_eq!(entries[1].1.seq(), 2);
    }

    #[test]
    fn test_crc_detects_corruption() {
        let mut builder = BlockBuilder::new();
        builder.add(b"key", &put(1, b"value"));
        let mut block = builder.finish();

        block[3] ^= 0x01;
        let err = decode_block(&block).unwrap_err();
        assert!(matches!(err, KvError::Corruption(_)));
    }

    #[test]
    fn test_finished_len_matches() {
        let mut builder = BlockBuilder::new();
        for i in 0..20u32 {
            builder.add(format!("k{:04}", i).as_bytes(), &put(i as u64, b"xyz"));
        }
        let predicted = builder.finished_len();
        let block = builder.finish();
        assert_eq!(predicted, block.len());
    }
}
