// SSTable Reader - 稀疏索引常驻内存，数据块按需读取
//
// 打开时读 Footer 并加载索引块；点查对索引二分，只读一个数据块；
// 范围扫描定位起始块后顺序推进，块级 CRC 校验失败返回 Corruption。

use super::block::decode_block;
use super::{FOOTER_LEN, SST_FORMAT_VERSION, SST_MAGIC};
use crate::storage::memtable::MemValue;
use crate::{KvError, Result};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct IndexEntry {
    first_key: Vec<u8>,
    offset: u64,
    len: u32,
}

pub struct SsTableReader {
    path: PathBuf,
    /// 文件名 `sst-<createSeq>.sst` 中的创建序列号，决定新旧排序
    create_seq: u64,
    file: Mutex<File>,
    index: Vec<IndexEntry>,
}

impl SsTableReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file =
            File::open(&path).map_err(|e| KvError::Io(format!("open sstable failed: {}", e)))?;

        let file_len = file
            .metadata()
            .map_err(|e| KvError::Io(format!("stat sstable failed: {}", e)))?
            .len();
        if file_len < FOOTER_LEN as u64 {
            return Err(KvError::Corruption("sstable shorter than footer".to_string()));
        }

        // Footer
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))
            .map_err(|e| KvError::Io(format!("seek footer failed: {}", e)))?;
        let mut footer = [0u8; FOOTER_LEN];
        file.read_exact(&mut footer)
            .map_err(|e| KvError::Io(format!("read footer failed: {}", e)))?;

        let index_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap());
        let index_len = u32::from_le_bytes(footer[8..12].try_into().unwrap()) as usize;
        let magic = u64::from_le_bytes(footer[12..20].try_into().unwrap());
        let version = u32::from_le_bytes(footer[20..24].try_into().unwrap());

        if magic != SST_MAGIC {
            return Err(KvError::Corruption("sstable magic mismatch".to_string()));
        }
        if version != SST_FORMAT_VERSION {
            return Err(KvError::Corruption(format!(
                "unsupported sstable version {}",
                version
            )));
        }
        if index_offset + index_len as u64 + FOOTER_LEN as u64 != file_len {
            return Err(KvError::Corruption("footer layout mismatch".to_string()));
        }

        // 索引块
        file.seek(SeekFrom::Start(index_offset))
            .map_err(|e| KvError::Io(format!("seek index failed: {}", e)))?;
        let mut index_buf = vec![0u8; index_len];
        file.read_exact(&mut index_buf)
            .map_err(|e| KvError::Io(format!("read index failed: {}", e)))?;
        let index = Self::parse_index(&index_buf)?;

        let create_seq = Self::parse_create_seq(&path).unwrap_or(0);

        Ok(Self {
            path,
            create_seq,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create_seq(&self) -> u64 {
        self.create_seq
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    /// 点查。`None` 表示本表无此 key；墓碑原样返回，由上层决定语义。
    pub fn get(&self, key: &[u8]) -> Result<Option<MemValue>> {
        let block_idx = match self.candidate_block(key) {
            Some(idx) => idx,
            None => return Ok(None),
        };

        let entries = self.read_block(block_idx)?;
        match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
            Ok(pos) => Ok(Some(entries[pos].1.clone())),
            Err(_) => Ok(None),
        }
    }

    /// 闭区间范围扫描。`end = None` 表示扫到表尾（compaction 全量读取）。
    pub fn scan(self: &Arc<Self>, start: &[u8], end: Option<&[u8]>) -> TableScanIter {
        let start_block = if self.index.is_empty() {
            0
        } else {
            self.candidate_block(start).unwrap_or(0)
        };

        TableScanIter {
            reader: Arc::clone(self),
            next_block: start_block,
            current: Vec::new().into_iter(),
            start: start.to_vec(),
            end: end.map(|e| e.to_vec()),
            done: false,
        }
    }

    /// 全表扫描
    pub fn scan_all(self: &Arc<Self>) -> TableScanIter {
        self.scan(&[], None)
    }

    /// first_key ≤ key 的最后一个块
    fn candidate_block(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .index
            .partition_point(|e| e.first_key.as_slice() <= key);
        idx.checked_sub(1)
    }

    fn read_block(&self, block_idx: usize) -> Result<Vec<(Vec<u8>, MemValue)>> {
        let entry = &self.index[block_idx];
        let mut buf = vec![0u8; entry.len as usize];

        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.offset))
                .map_err(|e| KvError::Io(format!("seek data block failed: {}", e)))?;
            file.read_exact(&mut buf)
                .map_err(|e| KvError::Io(format!("read data block failed: {}", e)))?;
        }

        decode_block(&buf).map_err(|e| match e {
            KvError::Corruption(msg) => KvError::Corruption(format!(
                "{} (table {}, block {})",
                msg,
                self.path.display(),
                block_idx
            )),
            other => other,
        })
    }

    fn parse_index(buf: &[u8]) -> Result<Vec<IndexEntry>> {
        if buf.len() < 4 {
            return Err(KvError::Corruption("index block too short".to_string()));
        }
        let crc_off = buf.len() - 4;
        let stored_crc = u32::from_le_bytes(buf[crc_off..].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..crc_off]);
        if hasher.finalize() != stored_crc {
            return Err(KvError::Corruption("index block crc mismatch".to_string()));
        }

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < crc_off {
            if pos + 4 > crc_off {
                return Err(KvError::Corruption("truncated index entry".to_string()));
            }
            let key_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + key_len + 12 > crc_off {
                return Err(KvError::Corruption("truncated index entry".to_string()));
            }
            let first_key = buf[pos..pos + key_len].to_vec();
            pos += key_len;
            let offset = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            let len = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap());
            pos += 12;

            entries.push(IndexEntry {
                first_key,
                offset,
                len,
            });
        }

        Ok(entries)
    }

    fn parse_create_seq(path: &Path) -> Option<u64> {
        let stem = path.file_stem()?.to_str()?;
        stem.strip_prefix("sst-")?.parse::<u64>().ok()
    }
}

/// 惰性块级扫描迭代器：一次只在内存中持有一个数据块
pub struct TableScanIter {
    reader: Arc<SsTableReader>,
    next_block: usize,
    current: std::vec::IntoIter<(Vec<u8>, MemValue)>,
    start: Vec<u8>,
    end: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for TableScanIter {
    type Item = Result<(Vec<u8>, MemValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some((key, value)) = self.current.next() {
                if key.as_slice() < self.start.as_slice() {
                    continue;
                }
                if let Some(end) = &self.end {
                    if key.as_slice() > end.as_slice() {
                        self.done = true;
                        return None;
                    }
                }
                return Some(Ok((key, value)));
            }

            if self.next_block >= self.reader.block_count() {
                self.done = true;
                return None;
            }

            // 下一块的首 key 已越过上界时提前结束
            if let Some(end) = &self.end {
                if self.reader.index[self.next_block].first_key.as_slice() > end.as_slice() {
                    self.done = true;
                    return None;
                }
            }

            match self.reader.read_block(self.next_block) {
                Ok(entries) => {
                    self.current = entries.into_iter();
                    self.next_block += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
