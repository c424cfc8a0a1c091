// SSTable Writer - 把有序条目流落盘为一张不可变表
//
// 输入必须已排序去重（MemTable flush 产物天然满足）；乱序或重复 key
// 属于调用方错误，直接拒绝。finish 前完整 fsync。

use super::block::BlockBuilder;
use super::{FOOTER_LEN, SST_FORMAT_VERSION, SST_MAGIC};
use crate::storage::memtable::MemValue;
use crate::{KvError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct SsTableWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    block: BlockBuilder,
    /// (first_key, offset, len) 每数据块一条
    index: Vec<(Vec<u8>, u64, u32)>,
    offset: u64,
    block_size: usize,
    last_key: Option<Vec<u8>>,
    entry_count: u64,
}

impl SsTableWriter {
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| KvError::Io(format!("create sstable failed: {}", e)))?;

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            block: BlockBuilder::new(),
            index: Vec::new(),
            offset: 0,
            block_size: block_size.max(512),
            last_key: None,
            entry_count: 0,
        })
    }

    /// 追加一条条目，key 必须严格大于前一条
    pub fn append(&mut self, key: &[u8], value: &MemValue) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(KvError::Validation(format!(
                    "sstable keys out of order: {:?} after {:?}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(last)
                )));
            }
        }

        self.block.add(key, value);
        self.last_key = Some(key.to_vec());
        self.entry_count += 1;

        if self.block.finished_len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// 落盘索引块与 Footer，fsync 后关闭
    pub fn finish(mut self) -> Result<PathBuf> {
        if self.entry_count == 0 {
            return Err(KvError::Validation("empty sstable".to_string()));
        }
        self.flush_block()?;

        // 索引块
        let index_offset = self.offset;
        let mut index_buf = Vec::new();
        for (first_key, offset, len) in &self.index {
            index_buf.extend_from_slice(&(first_key.len() as u32).to_le_bytes());
            index_buf.extend_from_slice(first_key);
            index_buf.extend_from_slice(&offset.to_le_bytes());
            index_buf.extend_from_slice(&len.to_le_bytes());
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&index_buf);
        let crc = hasher.finalize();
        index_buf.extend_from_slice(&crc.to_le_bytes());

        self.writer
            .write_all(&index_buf)
            .map_err(|e| KvError::Io(format!("write index block failed: {}", e)))?;

        // Footer
        let mut footer = Vec::with_capacity(FOOTER_LEN);
        footer.extend_from_slice(&index_offset.to_le_bytes());
        footer.extend_from_slice(&(index_buf.len() as u32).to_le_bytes());
        footer.extend_from_slice(&SST_MAGIC.to_le_bytes());
        footer.extend_from_slice(&SST_FORMAT_VERSION.to_le_bytes());
        self.writer
            .write_all(&footer)
            .map_err(|e| KvError::Io(format!("write footer failed: {}", e)))?;

        self.writer
            .flush()
            .map_err(|e| KvError::Io(format!("flush sstable failed: {}", e)))?;
        self.writer
            .get_mut()
            .sync_all()
            .map_err(|e| KvError::Io(format!("sync sstable failed: {}", e)))?;

        log::info!(
            "SSTable written: {} ({} entries, {} blocks)",
            self.path.display(),
            self.entry_count,
            self.index.len()
        );

        Ok(self.path)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }

        let builder = std::mem::take(&mut self.block);
        let first_key = builder.first_key().to_vec();
        let bytes = builder.finish();

        self.index
            .push((first_key, self.offset, bytes.len() as u32));
        self.writer
            .write_all(&bytes)
            .map_err(|e| KvError::Io(format!("write data block failed: {}", e)))?;
        self.offset += bytes.len() as u64;

        Ok(())
    }
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
    fn test_write_basic() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("sst-00001.sst");

        let mut writer = SsTableWriter::create(&path, 4096).unwrap();
        for i in 0..100u32 {
            writer
                .append(format!("key:{:05}", i).as_bytes(), &put(i as u64 + 1, b"v"))
                .unwrap();
        }
        assert_eq!(writer.entry_count(), 100);
        writer.finish().unwrap();

        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > FOOTER_LEN as u64);
    }

    #[test]
    fn test_out_of_order_rejected() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let mut writer =
            SsTableWriter::create(tmp_dir.path().join("bad.sst"), 4096).unwrap();

        writer.append(b"bbb", &put(1, b"v")).unwrap();
        let err = writer.append(b"aaa", &put(2, b"v")).unwrap_err();
        assert!(matches!(err, KvError::Validation(_)));

        // 重复 key 同样拒绝
        let err = writer.append(b"bbb", &put(3, b"v")).unwrap_err();
        assert!(matches!(err, KvError::Validation(_)));
    }

    #[test]
    fn test_empty_table_rejected() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let writer = SsTableWriter::create(tmp_dir.path().join("empty.sst"), 4096).unwrap();
        assert!(matches!(writer.finish(), Err(KvError::Validation(_))));
    }
}
