// WAL Manager - 分 epoch 的写前日志
//
// 文件布局：
// [Header: 20 bytes = magic(8) + version(4) + epoch(8)]
// [frame]...
//
// 持久化约定：append 返回后，记录的持久性由刷盘策略决定：
// - EveryWrite: 返回前 fsync
// - Interval(n): 后台线程每 n ms fsync 一次
// - Never: 依赖操作系统回写

use crate::storage::record::{self, Record};
use crate::{KvError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const WAL_MAGIC: &[u8; 8] = b"QAKVWAL1";
const WAL_VERSION: u32 = 1;
const HEADER_LEN: usize = 20;

/// 刷盘策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// 每次写入后 fsync 再返回
    EveryWrite,
    /// 后台每 n ms fsync 一次，写入缓冲后即返回
    Interval(u64),
    /// 不主动 fsync
    Never,
}

impl SyncPolicy {
    /// 从配置字符串解析："sync" | "interval" | "none"
    pub fn parse(s: &str, interval_ms: u64) -> Result<Self> {
        match s {
            "sync" => Ok(SyncPolicy::EveryWrite),
            "interval" => Ok(SyncPolicy::Interval(interval_ms)),
            "none" => Ok(SyncPolicy::Never),
            other => Err(KvError::Validation(format!(
                "unknown sync policy: {}",
                other
            ))),
        }
    }
}

/// WAL 统计信息
#[derive(Debug, Default)]
pub struct WalStats {
    /// 写入条数
    pub append_count: AtomicU64,
    /// 写入字节数
    pub append_bytes: AtomicU64,
    /// fsync 次数
    pub sync_count: AtomicU64,
}

struct WalFile {
    writer: BufWriter<File>,
    epoch: u64,
    offset: u64,
}

/// WAL Manager
pub struct WalManager {
    dir: PathBuf,
    policy: SyncPolicy,
    current: Mutex<WalFile>,
    current_epoch: AtomicU64,
    /// Interval 策略下，是否有未 fsync 的写入
    dirty: AtomicBool,
    stats: Arc<WalStats>,
    stop: AtomicBool,
    sync_worker: Mutex<Option<JoinHandle<()>>>,
}

impl WalManager {
    /// 打开 WAL 目录。已有 epoch 文件时继续向最新的追加，否则创建 epoch 1。
    pub fn open<P: AsRef<Path>>(dir: P, policy: SyncPolicy) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| KvError::Io(format!("create wal dir failed: {}", e)))?;

        let epochs = Self::list_epochs(&dir)?;

        let (file, epoch, offset) = if let Some(&latest) = epochs.last() {
            let path = Self::epoch_path(&dir, latest);
            let file = OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| KvError::Io(format!("open wal failed: {}", e)))?;
            let offset = file
                .metadata()
                .map_err(|e| KvError::Io(format!("stat wal failed: {}", e)))?
                .len();
            log::info!("WAL resumed: epoch {} at offset {}", latest, offset);
            (file, latest, offset)
        } else {
            let (file, offset) = Self::create_epoch_file(&dir, 1)?;
            (file, 1, offset)
        };

        Ok(Self {
            dir,
            policy,
            current: Mutex::new(WalFile {
                writer: BufWriter::new(file),
                epoch,
                offset,
            }),
            current_epoch: AtomicU64::new(epoch),
            dirty: AtomicBool::new(false),
            stats: Arc::new(WalStats::default()),
            stop: AtomicBool::new(false),
            sync_worker: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub fn stats(&self) -> &WalStats {
        &self.stats
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// 追加一条已编码的帧，返回帧起始偏移
    pub fn append(&self, frame: &[u8]) -> Result<u64> {
        let offset;
        {
            let mut current = self.current.lock();
            offset = current.offset;

            current
                .writer
                .write_all(frame)
                .map_err(|e| KvError::Io(format!("WAL write failed: {}", e)))?;
            current
                .writer
                .flush()
                .map_err(|e| KvError::Io(format!("WAL flush failed: {}", e)))?;
            current.offset += frame.len() as u64;

            if self.policy == SyncPolicy::EveryWrite {
                current
                    .writer
                    .get_mut()
                    .sync_all()
                    .map_err(|e| KvError::Io(format!("WAL sync failed: {}", e)))?;
                self.stats.sync_count.fetch_add(1, Ordering::Relaxed);
            } else {
                self.dirty.store(true, Ordering::Release);
            }
        }

        self.stats.append_count.fetch_add(1, Ordering::Relaxed);
        self.stats
            .append_bytes
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        Ok(offset)
    }

    /// 主动 fsync 当前 epoch 文件
    pub fn sync(&self) -> Result<()> {
        let mut current = self.current.lock();
        current
            .writer
            .flush()
            .map_err(|e| KvError::Io(format!("WAL flush failed: {}", e)))?;
        current
            .writer
            .get_mut()
            .sync_all()
            .map_err(|e| KvError::Io(format!("WAL sync failed: {}", e)))?;
        self.dirty.store(false, Ordering::Release);
        self.stats.sync_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 切换到新 epoch，返回旧 epoch 号
    ///
    /// 旧文件先 fsync 收尾；flush 任务完成后调用 `remove_epoch` 删除。
    pub fn rotate(&self) -> Result<u64> {
        let mut current = self.current.lock();

        current
            .writer
            .flush()
            .map_err(|e| KvError::Io(format!("WAL flush failed: {}", e)))?;
        current
            .writer
            .get_mut()
            .sync_all()
            .map_err(|e| KvError::Io(format!("WAL sync failed: {}", e)))?;

        let old_epoch = current.epoch;
        let new_epoch = old_epoch + 1;
        let (file, offset) = Self::create_epoch_file(&self.dir, new_epoch)?;

        current.writer = BufWriter::new(file);
        current.epoch = new_epoch;
        current.offset = offset;
        self.current_epoch.store(new_epoch, Ordering::SeqCst);
        self.dirty.store(false, Ordering::Release);

        log::info!("WAL rotated: epoch {} -> {}", old_epoch, new_epoch);
        Ok(old_epoch)
    }

    /// 删除指定 epoch 文件（其内容已持久化到 SSTable）
    pub fn remove_epoch(&self, epoch: u64) -> Result<()> {
        if epoch >= self.current_epoch.load(Ordering::SeqCst) {
            return Err(KvError::Validation(format!(
                "cannot remove active wal epoch {}",
                epoch
            )));
        }
        let path = Self::epoch_path(&self.dir, epoch);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| KvError::Io(format!("remove wal epoch failed: {}", e)))?;
            log::info!("Removed old WAL epoch: {}", path.display());
        }
        Ok(())
    }

    /// 删除所有不晚于指定 epoch 的文件
    ///
    /// flush 完成后调用：封存的 MemTable 可能含有从多个旧 epoch 回放来的
    /// 记录，这些 epoch 一并清理。
    pub fn remove_epochs_through(&self, epoch: u64) -> Result<()> {
        let current = self.current_epoch.load(Ordering::SeqCst);
        for e in Self::list_epochs(&self.dir)? {
            if e <= epoch && e < current {
                self.remove_epoch(e)?;
            }
        }
        Ok(())
    }

    /// 按 epoch 顺序回放全部记录，返回观察到的最大序列号
    ///
    /// 日志尾部截断或 CRC 失败视为日志结束：在最后一条完整记录处停止并成功返回。
    pub fn replay<F>(&self, mut visitor: F) -> Result<u64>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let epochs = Self::list_epochs(&self.dir)?;
        let mut max_seq = 0u64;
        let mut replayed = 0u64;

        'epochs: for epoch in epochs {
            let path = Self::epoch_path(&self.dir, epoch);
            let file =
                File::open(&path).map_err(|e| KvError::Io(format!("open wal failed: {}", e)))?;
            let mut reader = BufReader::new(file);

            Self::read_header(&mut reader, epoch)?;

            loop {
                match record::read_record(&mut reader) {
                    Ok(Some(record)) => {
                        max_seq = max_seq.max(record.seq);
                        replayed += 1;
                        visitor(record)?;
                    }
                    Ok(None) => break,
                    Err(KvError::Corruption(msg)) => {
                        // 崩溃造成的尾部残帧，在此截断
                        log::warn!(
                            "WAL epoch {} tail corrupted ({}), replay stops here",
                            epoch,
                            msg
                        );
                        break 'epochs;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        log::info!("WAL replay done: {} records, max seq {}", replayed, max_seq);
        Ok(max_seq)
    }

    /// 启动 Interval 策略的后台 fsync 线程
    pub fn start_sync_worker(self: &Arc<Self>) {
        let interval_ms = match self.policy {
            SyncPolicy::Interval(n) => n.max(1),
            _ => return,
        };

        let wal = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("wal-sync".to_string())
            .spawn(move || {
                log::info!("WAL sync worker started ({} ms interval)", interval_ms);
                while !wal.stop.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(interval_ms));
                    if wal.dirty.swap(false, Ordering::AcqRel) {
                        if let Err(e) = wal.sync() {
                            log::error!("WAL background sync failed: {}", e);
                        }
                    }
                }
            })
            .expect("spawn wal-sync thread");

        *self.sync_worker.lock() = Some(handle);
    }

    /// 停止后台线程并做最后一次 fsync
    pub fn shutdown(&self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.sync_worker.lock().take() {
            let _ = handle.join();
        }
        self.sync()
    }

    fn epoch_path(dir: &Path, epoch: u64) -> PathBuf {
        dir.join(format!("wal-{:020}.log", epoch))
    }

    fn create_epoch_file(dir: &Path, epoch: u64) -> Result<(File, u64)> {
        let path = Self::epoch_path(dir, epoch);
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| KvError::Io(format!("create wal epoch failed: {}", e)))?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(WAL_MAGIC);
        header.extend_from_slice(&WAL_VERSION.to_le_bytes());
        header.extend_from_slice(&epoch.to_le_bytes());
        file.write_all(&header)
            .map_err(|e| KvError::Io(format!("write wal header failed: {}", e)))?;
        file.sync_all()
            .map_err(|e| KvError::Io(format!("sync wal header failed: {}", e)))?;

        Ok((file, HEADER_LEN as u64))
    }

    fn read_header<R: Read>(reader: &mut R, expect_epoch: u64) -> Result<()> {
        let mut buf = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut buf)
            .map_err(|e| KvError::Corruption(format!("wal header unreadable: {}", e)))?;

        if &buf[0..8] != WAL_MAGIC {
            return Err(KvError::Corruption("wal magic mismatch".to_string()));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != WAL_VERSION {
            return Err(KvError::Corruption(format!(
                "unsupported wal version {}",
                version
            )));
        }
        let epoch = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        if epoch != expect_epoch {
            return Err(KvError::Corruption(format!(
                "wal epoch mismatch: header {} file {}",
                epoch, expect_epoch
            )));
        }
        Ok(())
    }

    /// 列出目录下全部 epoch，升序
    fn list_epochs(dir: &Path) -> Result<Vec<u64>> {
        let mut epochs = Vec::new();

        for entry in
            std::fs::read_dir(dir).map_err(|e| KvError::Io(format!("read wal dir failed: {}", e)))?
        {
            let entry = entry.map_err(|e| KvError::Io(format!("read wal entry failed: {}", e)))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if let Some(rest) = name.strip_prefix("wal-") {
                if let Some(num) = rest.strip_suffix(".log") {
                    if let Ok(epoch) = num.parse::<u64>() {
                        epochs.push(epoch);
                    }
                }
            }
        }

        epochs.sort_unstable();
        Ok(epochs)
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.sync_worker.lock().take() {
            let _ = handle.join();
        }
    }
}
