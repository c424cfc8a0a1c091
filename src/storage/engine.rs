// LSM Engine - WAL / MemTable / SSTable 的编排层
//
// 写路径：引擎互斥锁内分配序列号 → WAL append（按策略刷盘）→ MemTable
// 写入 → (primary) 提交复制；等待 backup ACK 在锁外进行。
//
// 溢出状态机：ACTIVE → FLUSHING → ACTIVE'
// - 活跃表超限时封存为 immutable，换入新表并切换 WAL epoch，写入不中断
// - 后台 flush 线程把 immutable 落成 SSTable，装入 Level-0 最新位，
//   随后删除旧 WAL epoch
// - FLUSHING 期间读取同时覆盖两张内存表与全部 SSTable，序列号保证新值胜出
//
// WAL append 半途失败后引擎进入只读降级态：写入快速失败，读取不受影响。

use super::compaction::{CompactionPolicy, ThresholdPolicy};
use super::memtable::{MemTable, MemValue};
use super::merge::{vec_source, MergeIterator, MergeSource, RangeScan};
use super::record::{encode_record, Record, RecordType, MAX_KEY_LEN, MAX_VALUE_LEN};
use super::sstable::{SsTableReader, SsTableWriter, DEFAULT_BLOCK_SIZE};
use super::wal::{SyncPolicy, WalManager};
use super::{KvStore, Replicator};
use crate::{KvError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// 引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 数据目录（WAL 与 SSTable 同目录）
    pub data_dir: PathBuf,

    /// MemTable 近似字节数超限后封存 flush
    pub memtable_size_limit: usize,

    /// SSTable 数据块目标大小
    pub block_size: usize,

    /// WAL 刷盘策略
    pub sync_policy: SyncPolicy,

    /// Level-0 表数超过该值时触发全量合并；None 关闭 compaction
    pub level0_compact_threshold: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./qakv-data"),
            memtable_size_limit: 64 * 1024 * 1024,
            block_size: DEFAULT_BLOCK_SIZE,
            sync_policy: SyncPolicy::EveryWrite,
            level0_compact_threshold: None,
        }
    }
}

/// 引擎统计信息
#[derive(Debug, Default)]
pub struct EngineStats {
    pub put_count: AtomicU64,
    pub delete_count: AtomicU64,
    pub get_count: AtomicU64,
    pub scan_count: AtomicU64,
    pub flush_count: AtomicU64,
    pub compaction_count: AtomicU64,
}

enum FlushMsg {
    Flush {
        memtable: Arc<MemTable>,
        old_epoch: u64,
    },
    Stop,
}

/// LSM 存储引擎
pub struct LsmEngine {
    config: EngineConfig,
    wal: Arc<WalManager>,

    /// 写路径互斥锁：序列号分配、WAL 追加、MemTable 写入、复制提交在锁内串行
    write_lock: Mutex<()>,

    active: RwLock<Arc<MemTable>>,
    immutable: RwLock<Option<Arc<MemTable>>>,

    /// Level-0 表集合，最新在前
    tables: RwLock<Vec<Arc<SsTableReader>>>,

    next_seq: AtomicU64,

    replicator: RwLock<Option<Arc<dyn Replicator>>>,
    compaction: Option<Box<dyn CompactionPolicy>>,

    flush_tx: Sender<FlushMsg>,
    flush_worker: Mutex<Option<JoinHandle<()>>>,

    /// WAL 写入半途失败后进入只读降级
    degraded: AtomicBool,
    closed: AtomicBool,

    stats: EngineStats,
}

impl LsmEngine {
    /// 打开引擎：装载 SSTable、回放 WAL、恢复序列号、启动后台任务
    pub fn open(config: EngineConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| KvError::Io(format!("create data dir failed: {}", e)))?;

        let tables = Self::load_tables(&config.data_dir)?;
        let max_table_seq = tables.iter().map(|t| t.create_seq()).max().unwrap_or(0);

        let wal = Arc::new(WalManager::open(&config.data_dir, config.sync_policy)?);

        let active = Arc::new(MemTable::new());
        let max_wal_seq = wal.replay(|record| {
            match record.rtype {
                RecordType::Put => active.put(record.key, record.value, record.seq),
                RecordType::Delete => active.delete(record.key, record.seq),
            }
            Ok(())
        })?;
        wal.start_sync_worker();

        let next_seq = max_wal_seq.max(max_table_seq) + 1;

        let compaction: Option<Box<dyn CompactionPolicy>> = config
            .level0_compact_threshold
            .map(|k| Box::new(ThresholdPolicy::new(k)) as Box<dyn CompactionPolicy>);

        let (flush_tx, flush_rx) = unbounded();

        let engine = Arc::new(Self {
            config,
            wal,
            write_lock: Mutex::new(()),
            active: RwLock::new(active),
            immutable: RwLock::new(None),
            tables: RwLock::new(tables),
            next_seq: AtomicU64::new(next_seq),
            replicator: RwLock::new(None),
            compaction,
            flush_tx,
            flush_worker: Mutex::new(None),
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stats: EngineStats::default(),
        });

        engine.spawn_flush_worker(flush_rx);

        log::info!(
            "Engine opened: dir {}, {} sstables, next seq {}",
            engine.config.data_dir.display(),
            engine.tables.read().len(),
            next_seq
        );

        Ok(engine)
    }

    /// 挂接 primary 角色的复制出口
    pub fn set_replicator(&self, replicator: Arc<dyn Replicator>) {
        *self.replicator.write() = Some(replicator);
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// 已分配的最后一个序列号
    pub fn last_sequence(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst) - 1
    }

    pub fn table_count(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// backup 侧按 primary 的原始序列号应用一条复制记录
    ///
    /// 本地序列号计数器跟随 primary 前进；重复/乱序检测由复制服务负责。
    pub fn apply_replicated(&self, record: Record) -> Result<()> {
        self.ensure_writable()?;

        let _guard = self.write_lock.lock();

        let frame = encode_record(&record);
        if let Err(e) = self.wal.append(&frame) {
            self.enter_degraded(&e);
            return Err(e);
        }

        {
            let active = self.active.read().clone();
            match record.rtype {
                RecordType::Put => {
                    self.stats.put_count.fetch_add(1, Ordering::Relaxed);
                    active.put(record.key, record.value, record.seq);
                }
                RecordType::Delete => {
                    self.stats.delete_count.fetch_add(1, Ordering::Relaxed);
                    active.delete(record.key, record.seq);
                }
            }
        }

        self.next_seq.fetch_max(record.seq + 1, Ordering::SeqCst);
        self.maybe_seal();
        Ok(())
    }

    // ------------------------------------------------------------------
    // 写路径
    // ------------------------------------------------------------------

    fn write_record(&self, rtype: RecordType, key: &[u8], value: &[u8]) -> Result<u64> {
        self.ensure_writable()?;
        Self::validate_key(key)?;
        if rtype == RecordType::Put {
            Self::validate_value(value)?;
        }

        let replicator = self.replicator.read().clone();
        let seq;

        {
            let _guard = self.write_lock.lock();
            seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

            let record = Record {
                rtype,
                seq,
                key: key.to_vec(),
                value: value.to_vec(),
            };
            let frame = encode_record(&record);

            if let Err(e) = self.wal.append(&frame) {
                self.enter_degraded(&e);
                return Err(e);
            }

            {
                let active = self.active.read().clone();
                match rtype {
                    RecordType::Put => active.put(record.key.clone(), record.value.clone(), seq),
                    RecordType::Delete => active.delete(record.key.clone(), seq),
                }
            }

            // 锁内提交保证复制流与序列号同序
            if let Some(rep) = &replicator {
                rep.submit(&record)?;
            }

            self.maybe_seal();
        }

        // 锁外等待 backup ACK，不阻塞其他写入
        if let Some(rep) = &replicator {
            rep.wait_acked(seq)?;
        }

        Ok(seq)
    }

    /// 活跃表超限时封存并切换（调用方持有写锁）
    fn maybe_seal(&self) {
        let active_arc = self.active.read().clone();
        if active_arc.approximate_bytes() < self.config.memtable_size_limit {
            return;
        }
        if self.immutable.read().is_some() {
            // 上一轮 flush 尚未完成，推迟封存
            return;
        }

        let old_epoch = match self.wal.rotate() {
            Ok(epoch) => epoch,
            Err(e) => {
                log::error!("WAL rotate failed, seal deferred: {}", e);
                return;
            }
        };

        active_arc.seal();
        *self.immutable.write() = Some(active_arc.clone());
        *self.active.write() = Arc::new(MemTable::new());

        log::info!(
            "MemTable sealed: {} entries, {} bytes, wal epoch {} retired",
            active_arc.len(),
            active_arc.approximate_bytes(),
            old_epoch
        );

        let _ = self.flush_tx.send(FlushMsg::Flush {
            memtable: active_arc,
            old_epoch,
        });
    }

    fn enter_degraded(&self, cause: &KvError) {
        self.degraded.store(true, Ordering::Release);
        log::error!("WAL append failed, engine degraded to read-only: {}", cause);
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KvError::Io("engine is closed".to_string()));
        }
        if self.degraded.load(Ordering::Acquire) {
            return Err(KvError::Io(
                "engine is in read-only degraded state".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(KvError::Validation("empty key".to_string()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(KvError::Validation(format!(
                "key length {} exceeds {} bytes",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(())
    }

    fn validate_value(value: &[u8]) -> Result<()> {
        if value.len() > MAX_VALUE_LEN {
            return Err(KvError::Validation(format!(
                "value length {} exceeds {} bytes",
                value.len(),
                MAX_VALUE_LEN
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // flush / compaction 后台任务
    // ------------------------------------------------------------------

    fn spawn_flush_worker(self: &Arc<Self>, rx: Receiver<FlushMsg>) {
        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("lsm-flush".to_string())
            .spawn(move || {
                for msg in rx.iter() {
                    match msg {
                        FlushMsg::Stop => break,
                        FlushMsg::Flush {
                            memtable,
                            old_epoch,
                        } => {
                            if let Err(e) = engine.flush_memtable(&memtable, old_epoch) {
                                log::error!("MemTable flush failed: {}", e);
                            } else {
                                engine.run_compaction();
                            }
                        }
                    }
                }
            })
            .expect("spawn lsm-flush thread");

        *self.flush_worker.lock() = Some(handle);
    }

    fn flush_memtable(&self, memtable: &Arc<MemTable>, old_epoch: u64) -> Result<()> {
        let entries = memtable.iter_all();
        if entries.is_empty() {
            *self.immutable.write() = None;
            self.wal.remove_epochs_through(old_epoch)?;
            return Ok(());
        }

        let create_seq = entries.iter().map(|(_, v)| v.seq()).max().unwrap_or(0);
        let path = Self::table_path(&self.config.data_dir, create_seq);

        let mut writer = SsTableWriter::create(&path, self.config.block_size)?;
        for (key, value) in &entries {
            writer.append(key, value)?;
        }
        writer.finish()?;

        let reader = Arc::new(SsTableReader::open(&path)?);

        // 先装表再清 immutable，读路径不出现可见性空洞
        self.tables.write().insert(0, reader);
        *self.immutable.write() = None;
        self.wal.remove_epochs_through(old_epoch)?;

        self.stats.flush_count.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "MemTable flushed: {} entries -> sst-{:020}",
            entries.len(),
            create_seq
        );
        Ok(())
    }

    fn run_compaction(&self) {
        let policy = match &self.compaction {
            Some(policy) => policy,
            None => return,
        };

        let snapshot = self.tables.read().clone();
        let picked = match policy.pick(&snapshot) {
            Some(picked) if picked.len() >= 2 => picked,
            _ => return,
        };

        let drop_tombstones = picked.len() == snapshot.len();
        if let Err(e) = self.compact_tables(&picked, drop_tombstones) {
            log::error!("Compaction failed: {}", e);
        }
    }

    /// 把选中的表合并为一张；合并全量集合时墓碑可以一并丢弃
    fn compact_tables(&self, picked: &[Arc<SsTableReader>], drop_tombstones: bool) -> Result<()> {
        let create_seq = picked.iter().map(|t| t.create_seq()).max().unwrap_or(0);
        let tmp_path = self
            .config
            .data_dir
            .join(format!("sst-{:020}.sst.tmp", create_seq));

        let sources: Vec<MergeSource> = picked
            .iter()
            .map(|t| Box::new(t.scan_all()) as MergeSource)
            .collect();
        let merged = MergeIterator::new(sources)?;

        let mut writer = SsTableWriter::create(&tmp_path, self.config.block_size)?;
        let mut written = 0u64;
        for item in merged {
            let (key, value) = item?;
            if drop_tombstones && value.is_tombstone() {
                continue;
            }
            writer.append(&key, &value)?;
            written += 1;
        }

        let picked_paths: Vec<PathBuf> = picked.iter().map(|t| t.path().to_path_buf()).collect();

        if written == 0 {
            // 所有条目都是可丢弃的墓碑：撤下输入表即可
            drop(writer);
            let _ = std::fs::remove_file(&tmp_path);
            self.tables
                .write()
                .retain(|t| !picked_paths.iter().any(|p| p == t.path()));
            for p in &picked_paths {
                let _ = std::fs::remove_file(p);
            }
            log::info!("Compaction removed {} empty tables", picked_paths.len());
            return Ok(());
        }

        writer.finish()?;

        // 原子改名顶替同名的最新输入表；中途崩溃只会多出冗余旧表，
        // 由序列号去重兜底。已打开的 reader 持有 fd，不受删除影响。
        let final_path = Self::table_path(&self.config.data_dir, create_seq);
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| KvError::Io(format!("rename compacted table failed: {}", e)))?;
        for p in &picked_paths {
            if p != &final_path {
                std::fs::remove_file(p)
                    .map_err(|e| KvError::Io(format!("remove compacted input failed: {}", e)))?;
            }
        }

        let new_reader = Arc::new(SsTableReader::open(&final_path)?);

        {
            let mut tables = self.tables.write();
            tables.retain(|t| !picked_paths.iter().any(|p| p == t.path()));
            let pos = tables.partition_point(|t| t.create_seq() > create_seq);
            tables.insert(pos, new_reader);
        }

        self.stats.compaction_count.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Compaction merged {} tables -> sst-{:020} ({} entries)",
            picked.len(),
            create_seq,
            written
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // 启动装载
    // ------------------------------------------------------------------

    fn table_path(dir: &Path, create_seq: u64) -> PathBuf {
        dir.join(format!("sst-{:020}.sst", create_seq))
    }

    /// 装载目录下全部 SSTable，按 createSeq 从新到旧排列
    fn load_tables(dir: &Path) -> Result<Vec<Arc<SsTableReader>>> {
        let mut tables = Vec::new();

        for entry in
            std::fs::read_dir(dir).map_err(|e| KvError::Io(format!("read data dir failed: {}", e)))?
        {
            let entry = entry.map_err(|e| KvError::Io(format!("read dir entry failed: {}", e)))?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();

            if !name.starts_with("sst-") || !name.ends_with(".sst") {
                continue;
            }

            match SsTableReader::open(&path) {
                Ok(reader) => tables.push(Arc::new(reader)),
                Err(e) => {
                    // 受损表隔离：跳过装载，保留文件供人工检查
                    log::error!("SSTable {} quarantined: {}", path.display(), e);
                }
            }
        }

        tables.sort_by(|a, b| b.create_seq().cmp(&a.create_seq()));
        Ok(tables)
    }

    fn value_of(value: MemValue) -> Option<Vec<u8>> {
        match value {
            MemValue::Put { value, .. } => Some(value),
            MemValue::Tombstone { .. } => None,
        }
    }
}

impl KvStore for LsmEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_record(RecordType::Put, key, value)?;
        self.stats.put_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_record(RecordType::Delete, key, &[])?;
        self.stats.delete_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn batch_put(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<usize> {
        if entries.is_empty() {
            return Err(KvError::Validation("empty batch".to_string()));
        }
        for (key, value) in &entries {
            Self::validate_key(key)?;
            Self::validate_value(value)?;
        }
        self.ensure_writable()?;

        let replicator = self.replicator.read().clone();
        let count = entries.len();
        let mut last_seq = 0u64;

        {
            let _guard = self.write_lock.lock();

            for (key, value) in entries {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                let record = Record::put(seq, key, value);
                let frame = encode_record(&record);

                // 每条独立落 WAL：崩溃后批次可能只有前缀持久化
                if let Err(e) = self.wal.append(&frame) {
                    self.enter_degraded(&e);
                    return Err(e);
                }

                {
                    let active = self.active.read().clone();
                    active.put(record.key.clone(), record.value.clone(), seq);
                }

                if let Some(rep) = &replicator {
                    rep.submit(&record)?;
                }

                self.maybe_seal();
                last_seq = seq;
            }
        }

        if let Some(rep) = &replicator {
            rep.wait_acked(last_seq)?;
        }

        self.stats
            .put_count
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Self::validate_key(key)?;
        self.stats.get_count.fetch_add(1, Ordering::Relaxed);

        let active = self.active.read().clone();
        if let Some(value) = active.get(key) {
            return Ok(Self::value_of(value));
        }

        if let Some(immutable) = self.immutable.read().clone() {
            if let Some(value) = immutable.get(key) {
                return Ok(Self::value_of(value));
            }
        }

        let tables = self.tables.read().clone();
        for table in tables {
            if let Some(value) = table.get(key)? {
                return Ok(Self::value_of(value));
            }
        }

        Ok(None)
    }

    fn read_key_range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: Option<usize>,
    ) -> Result<RangeScan> {
        if limit == Some(0) {
            return Err(KvError::Validation("limit must be positive".to_string()));
        }
        self.stats.scan_count.fetch_add(1, Ordering::Relaxed);

        let mut sources: Vec<MergeSource> = Vec::new();

        // start > end：空扫描
        if start <= end {
            let active = self.active.read().clone();
            sources.push(vec_source(active.scan(start, end)));

            if let Some(immutable) = self.immutable.read().clone() {
                sources.push(vec_source(immutable.scan(start, end)));
            }

            let tables = self.tables.read().clone();
            for table in &tables {
                sources.push(Box::new(table.scan(start, Some(end))));
            }
        }

        RangeScan::new(sources, limit)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.flush_tx.send(FlushMsg::Stop);
        if let Some(handle) = self.flush_worker.lock().take() {
            let _ = handle.join();
        }

        self.wal.shutdown()?;
        log::info!("Engine closed: dir {}", self.config.data_dir.display());
        Ok(())
    }
}

impl Drop for LsmEngine {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                log::error!("Engine close on drop failed: {}", e);
            }
        }
    }
}
