//! 存储引擎端到端测试
//!
//! 覆盖完整写读路径：点写/点读/覆盖、删除、范围查询、MemTable 溢出
//! flush、重启恢复。

use qakv::storage::engine::{EngineConfig, LsmEngine};
use qakv::storage::wal::SyncPolicy;
use qakv::storage::KvStore;
use std::path::Path;
use std::time::{Duration, Instant};

fn open_engine(dir: &Path, memtable_limit: usize) -> std::sync::Arc<LsmEngine> {
    LsmEngine::open(EngineConfig {
        data_dir: dir.to_path_buf(),
        memtable_size_limit: memtable_limit,
        block_size: 4096,
        sync_policy: SyncPolicy::EveryWrite,
        level0_compact_threshold: None,
    })
    .unwrap()
}

fn wait_for_tables(engine: &LsmEngine, min_tables: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.table_count() < min_tables && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(engine.table_count() >= min_tables, "flush did not happen");
}

#[test]
fn put_get_overwrite_round_trip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let engine = open_engine(tmp_dir.path(), 64 * 1024 * 1024);

    engine.put(b"user:1", b"Alice").unwrap();
    assert_eq!(engine.get(b"user:1").unwrap().unwrap(), b"Alice");

    engine.put(b"user:1", b"Alice Updated").unwrap();
    assert_eq!(engine.get(b"user:1").unwrap().unwrap(), b"Alice Updated");
}

#[test]
fn delete_makes_key_invisible() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let engine = open_engine(tmp_dir.path(), 64 * 1024 * 1024);

    engine.put(b"user:del", b"X").unwrap();
    engine.delete(b"user:del").unwrap();
    assert!(engine.get(b"user:del").unwrap().is_none());
}

#[test]
fn range_scan_matches_observable_contract() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let engine = open_engine(tmp_dir.path(), 64 * 1024 * 1024);

    for i in 1..=30u32 {
        engine
            .put(
                format!("rng:{:03}", i).as_bytes(),
                format!("v{}", i).as_bytes(),
            )
            .unwrap();
    }

    // [rng:005..rng:015] 闭区间 11 条，升序
    let results: Vec<_> = engine
        .read_key_range(b"rng:005", b"rng:015", None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results.len(), 11);
    for (i, (key, _)) in results.iter().enumerate() {
        assert_eq!(key, format!("rng:{:03}", i + 5).as_bytes());
    }

    // limit=5 截断
    let limited: Vec<_> = engine
        .read_key_range(b"rng:001", b"rng:030", Some(5))
        .unwrap()
        .collect();
    assert_eq!(limited.len(), 5);
}

#[test]
fn overflow_flushes_and_everything_stays_readable() {
    let tmp_dir = tempfile::tempdir().unwrap();
    // 100 KiB 限制，~60 字节的条目写 2500 条，至少 flush 一次
    let engine = open_engine(tmp_dir.path(), 100 * 1024);

    for i in 0..2500u32 {
        engine
            .put(
                format!("mix:{:05}", i).as_bytes(),
                format!("payload-{:030}", i).as_bytes(),
            )
            .unwrap();
    }
    wait_for_tables(&engine, 1);

    // 跨 flush 边界的范围查询数量精确
    let results: Vec<_> = engine
        .read_key_range(b"mix:00000", b"mix:02499", None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results.len(), 2500);

    // 抽样点读
    for i in (0..2500u32).step_by(211) {
        assert!(engine
            .get(format!("mix:{:05}", i).as_bytes())
            .unwrap()
            .is_some());
    }
}

#[test]
fn restart_recovers_wal_and_tables() {
    let tmp_dir = tempfile::tempdir().unwrap();

    {
        let engine = open_engine(tmp_dir.path(), 8 * 1024);
        for i in 0..400u32 {
            engine
                .put(format!("r:{:04}", i).as_bytes(), &[b'd'; 40])
                .unwrap();
        }
        wait_for_tables(&engine, 1);

        // flush 之后继续写入，留一部分只在 WAL 里
        engine.put(b"wal-only:1", b"not flushed").unwrap();
        engine.delete(b"r:0001").unwrap();
        engine.close().unwrap();
    }

    let engine = open_engine(tmp_dir.path(), 8 * 1024);

    assert_eq!(engine.get(b"wal-only:1").unwrap().unwrap(), b"not flushed");
    assert!(engine.get(b"r:0001").unwrap().is_none());
    assert!(engine.get(b"r:0000").unwrap().is_some());
    assert!(engine.get(b"r:0399").unwrap().is_some());

    // 范围数量一致：400 - 1 deleted + 1 wal-only = 400
    let count = engine
        .read_key_range(b"r:0000", b"r:9999", None)
        .unwrap()
        .count();
    assert_eq!(count, 399);
}

#[test]
fn batch_put_is_atomic_per_entry_and_ordered() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let engine = open_engine(tmp_dir.path(), 64 * 1024 * 1024);

    let entries: Vec<_> = (0..50u32)
        .map(|i| {
            (
                format!("b:{:03}", i).into_bytes(),
                format!("v{}", i).into_bytes(),
            )
        })
        .collect();
    assert_eq!(engine.batch_put(entries).unwrap(), 50);

    let results: Vec<_> = engine
        .read_key_range(b"b:000", b"b:049", None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results.len(), 50);

    // 重启后批次仍然完整
    engine.close().unwrap();
    drop(engine);

    let engine = open_engine(tmp_dir.path(), 64 * 1024 * 1024);
    assert_eq!(engine.get(b"b:049").unwrap().unwrap(), b"v49");
}

#[test]
fn interval_sync_policy_acks_before_fsync() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let engine = LsmEngine::open(EngineConfig {
        data_dir: tmp_dir.path().to_path_buf(),
        memtable_size_limit: 64 * 1024 * 1024,
        block_size: 4096,
        sync_policy: SyncPolicy::Interval(5),
        level0_compact_threshold: None,
    })
    .unwrap();

    for i in 0..100u32 {
        engine
            .put(format!("iv:{:03}", i).as_bytes(), b"v")
            .unwrap();
    }

    // close 前的最终 fsync 保证全部落盘
    engine.close().unwrap();
    drop(engine);

    let engine = open_engine(tmp_dir.path(), 64 * 1024 * 1024);
    for i in 0..100u32 {
        assert!(engine
            .get(format!("iv:{:03}", i).as_bytes())
            .unwrap()
            .is_some());
    }
}
