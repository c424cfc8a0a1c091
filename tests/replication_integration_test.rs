//! 主从复制端到端测试
//!
//! primary + backup 双引擎同进程拉起，sync-sync 模式：
//! - 写入主库后立即可在备库读到
//! - 备库宕机 → 主库 connected=false → 备库重启 → 自动重连并续传

use qakv::replication::{
    ReplicationClient, ReplicationClientConfig, ReplicationServer, ReplicationServerConfig,
    ReplicationStatusProvider,
};
use qakv::storage::engine::{EngineConfig, LsmEngine};
use qakv::storage::KvStore;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn open_engine(dir: &Path) -> Arc<LsmEngine> {
    LsmEngine::open(EngineConfig {
        data_dir: dir.to_path_buf(),
        ..Default::default()
    })
    .unwrap()
}

fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
}

fn start_backup(engine: Arc<LsmEngine>, port: u16) -> Arc<ReplicationServer> {
    ReplicationServer::start(
        engine,
        ReplicationServerConfig {
            listen_host: "127.0.0.1".to_string(),
            listen_port: port,
        },
    )
    .unwrap()
}

fn start_primary_client(port: u16) -> Arc<ReplicationClient> {
    ReplicationClient::start(ReplicationClientConfig {
        backup_host: "127.0.0.1".to_string(),
        backup_port: port,
        ack_timeout_ms: 5000,
        pending_window: 4096,
        reconnect_base_ms: 50,
        reconnect_max_ms: 500,
        primary_id: 1,
    })
}

fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timeout waiting for {}", what);
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn sync_sync_write_is_immediately_visible_on_backup() {
    let primary_dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let backup_engine = open_engine(backup_dir.path());
    let backup = start_backup(backup_engine.clone(), port);

    let primary_engine = open_engine(primary_dir.path());
    let client = start_primary_client(port);
    primary_engine.set_replicator(client.clone());

    // put 返回即已被 backup ACK
    primary_engine.put(b"repl:1", b"Hello").unwrap();
    assert_eq!(backup_engine.get(b"repl:1").unwrap().unwrap(), b"Hello");

    primary_engine.put(b"repl:2", b"World").unwrap();
    primary_engine.delete(b"repl:1").unwrap();
    assert!(backup_engine.get(b"repl:1").unwrap().is_none());
    assert_eq!(backup_engine.get(b"repl:2").unwrap().unwrap(), b"World");

    let state = client.state();
    assert_eq!(state.role, "primary");
    assert!(state.connected);
    assert_eq!(state.pending_count, Some(0));
    assert_eq!(state.last_acked_seq, Some(3));

    client.shutdown();
    backup.shutdown();
}

#[test]
fn replication_converges_over_batch_and_range() {
    let primary_dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let backup_engine = open_engine(backup_dir.path());
    let backup = start_backup(backup_engine.clone(), port);

    let primary_engine = open_engine(primary_dir.path());
    let client = start_primary_client(port);
    primary_engine.set_replicator(client.clone());

    let entries: Vec<_> = (0..100u32)
        .map(|i| {
            (
                format!("conv:{:03}", i).into_bytes(),
                format!("v{}", i).into_bytes(),
            )
        })
        .collect();
    primary_engine.batch_put(entries).unwrap();

    // 主备对每个 key 读数一致
    let on_primary: Vec<_> = primary_engine
        .read_key_range(b"conv:000", b"conv:099", None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    let on_backup: Vec<_> = backup_engine
        .read_key_range(b"conv:000", b"conv:099", None)
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(on_primary, on_backup);
    assert_eq!(on_backup.len(), 100);

    let metrics = backup.metrics();
    assert_eq!(metrics.ops_applied, Some(100));
    assert_eq!(metrics.ops_skipped, Some(0));

    client.shutdown();
    backup.shutdown();
}

#[test]
fn backup_restart_reconnects_and_resumes() {
    let primary_dir = tempfile::tempdir().unwrap();
    let backup_dir = tempfile::tempdir().unwrap();
    let port = free_port();

    let backup_engine = open_engine(backup_dir.path());
    let backup = start_backup(backup_engine.clone(), port);

    let primary_engine = open_engine(primary_dir.path());
    let client = start_primary_client(port);
    primary_engine.set_replicator(client.clone());

    primary_engine.put(b"before-restart", b"v1").unwrap();
    assert!(backup_engine.get(b"before-restart").unwrap().is_some());

    // 杀掉 backup：主库状态应转为断开
    backup.shutdown();
    wait_until("primary to notice disconnect", Duration::from_secs(5), || {
        !client.is_connected()
    });
    assert!(!client.state().connected);

    // 同端口重启 backup（同一引擎，last_applied 延续）
    let backup = start_backup(backup_engine.clone(), port);

    // 10 秒内重连
    wait_until("primary to reconnect", Duration::from_secs(10), || {
        client.is_connected()
    });
    assert!(client.metrics().reconnect_count.unwrap() >= 1);

    // 重连后的新写入照常复制
    primary_engine.put(b"after-reconnect", b"post-restart").unwrap();
    assert_eq!(
        backup_engine.get(b"after-reconnect").unwrap().unwrap(),
        b"post-restart"
    );

    client.shutdown();
    backup.shutdown();
}

#[test]
fn write_fails_with_timeout_when_backup_is_down() {
    let primary_dir = tempfile::tempdir().unwrap();
    let port = free_port(); // 无人监听

    let primary_engine = open_engine(primary_dir.path());
    let client = ReplicationClient::start(ReplicationClientConfig {
        backup_host: "127.0.0.1".to_string(),
        backup_port: port,
        ack_timeout_ms: 200,
        reconnect_base_ms: 50,
        reconnect_max_ms: 200,
        ..Default::default()
    });
    primary_engine.set_replicator(client.clone());

    // 复制失败不影响本地持久化
    let err = primary_engine.put(b"lonely", b"v").unwrap_err();
    assert!(matches!(err, qakv::KvError::ReplicationTimeout(_)));
    assert_eq!(primary_engine.get(b"lonely").unwrap().unwrap(), b"v");

    client.shutdown();
}
