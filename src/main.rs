//! QAKV 服务入口
//!
//! 集成功能：
//! 1. LSM 存储引擎（WAL + MemTable + SSTable）
//! 2. HTTP API（REST 接口）
//! 3. TCP 流式写入
//! 4. 主从复制（primary / backup 角色）
//!
//! 运行: cargo run --bin qakv-server -- --role standalone
//!
//! 退出码：0 正常关闭，1 初始化失败，2 运行期不可恢复 I/O 错误

use qakv::replication::{
    ReplicationClient, ReplicationClientConfig, ReplicationServer, ReplicationServerConfig,
    ReplicationStatusProvider,
};
use qakv::service::http::HttpServer;
use qakv::service::tcp::{TcpIngestConfig, TcpIngestServer};
use qakv::storage::engine::{EngineConfig, LsmEngine};
use qakv::storage::wal::SyncPolicy;
use qakv::storage::KvStore;
use qakv::utils::config::AppConfig;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// 运行角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Standalone,
    Primary,
    Backup,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "standalone" => Some(Role::Standalone),
            "primary" => Some(Role::Primary),
            "backup" => Some(Role::Backup),
            _ => None,
        }
    }
}

/// 打印启动横幅
fn print_startup_banner(role: Role, config: &AppConfig) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║                 QAKV Server Started                   ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    println!("📡 Service Endpoints:");
    println!("   • HTTP API:    http://{}", config.http.bind_address());
    println!("   • TCP Ingest:  {}:{}", config.tcp.host, config.tcp.port);
    println!("   • Health:      http://{}/health", config.http.bind_address());

    println!("\n💾 Storage:");
    println!("   • Path:        {}", config.storage.data_dir);
    println!("   • Sync policy: {}", config.storage.sync_policy);
    println!(
        "   • MemTable:    {} KiB limit",
        config.storage.memtable_size_bytes / 1024
    );

    println!("\n🔁 Replication:");
    match role {
        Role::Standalone => println!("   • Role:        standalone (disabled)"),
        Role::Primary => println!(
            "   • Role:        primary -> {}:{}",
            config.replication.backup_host, config.replication.backup_port
        ),
        Role::Backup => println!(
            "   • Role:        backup, listening on {}:{}",
            config.replication.listen_host, config.replication.listen_port
        ),
    }

    println!("\n📋 HTTP API:");
    println!("   ┌─────────────────────────────────────────────────┐");
    println!("   │ POST   /put                - 点写               │");
    println!("   │ POST   /batch-put          - 批量写             │");
    println!("   │ GET    /get/:key           - 点读               │");
    println!("   │ DELETE /delete/:key        - 删除               │");
    println!("   │ GET    /range?start=&end=  - 范围查询           │");
    println!("   │ GET    /replication/status - 复制状态           │");
    println!("   └─────────────────────────────────────────────────┘");

    println!("\n🟢 Server is running. Press Ctrl+C to stop.\n");
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // 初始化日志
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 1. 加载配置文件（--config 可覆盖默认路径）
    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<String> = None;
    for i in 0..args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            config_path = Some(args[i + 1].clone());
        }
    }

    let mut config = match config_path {
        Some(path) => match AppConfig::load_from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::error!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => match AppConfig::load_default() {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("Failed to load config file: {}, using defaults", e);
                AppConfig::default()
            }
        },
    };

    // 2. 命令行参数覆盖
    for i in 0..args.len() {
        match args[i].as_str() {
            "--role" => {
                if i + 1 < args.len() {
                    config.server.role = args[i + 1].clone();
                }
            }
            "--http-port" => {
                if i + 1 < args.len() {
                    config.http.port = args[i + 1].parse().unwrap_or(config.http.port);
                }
            }
            "--tcp-port" => {
                if i + 1 < args.len() {
                    config.tcp.port = args[i + 1].parse().unwrap_or(config.tcp.port);
                }
            }
            "--replication-port" => {
                if i + 1 < args.len() {
                    let port = args[i + 1].parse().unwrap_or(config.replication.listen_port);
                    config.replication.listen_port = port;
                }
            }
            "--backup-host" => {
                if i + 1 < args.len() {
                    config.replication.backup_host = args[i + 1].clone();
                }
            }
            "--backup-port" => {
                if i + 1 < args.len() {
                    config.replication.backup_port =
                        args[i + 1].parse().unwrap_or(config.replication.backup_port);
                }
            }
            "--data-dir" => {
                if i + 1 < args.len() {
                    config.storage.data_dir = args[i + 1].clone();
                }
            }
            "--sync-policy" => {
                if i + 1 < args.len() {
                    config.storage.sync_policy = args[i + 1].clone();
                }
            }
            "--memtable-size" => {
                if i + 1 < args.len() {
                    config.storage.memtable_size_bytes = args[i + 1]
                        .parse()
                        .unwrap_or(config.storage.memtable_size_bytes);
                }
            }
            _ => {}
        }
    }

    let role = match Role::parse(&config.server.role) {
        Some(role) => role,
        None => {
            log::error!("Invalid role: {}", config.server.role);
            std::process::exit(1);
        }
    };

    let sync_policy =
        match SyncPolicy::parse(&config.storage.sync_policy, config.storage.sync_interval_ms) {
            Ok(policy) => policy,
            Err(e) => {
                log::error!("Invalid sync policy: {}", e);
                std::process::exit(1);
            }
        };

    // 3. 打开存储引擎（装载 SSTable + 回放 WAL）
    let engine_config = EngineConfig {
        data_dir: PathBuf::from(&config.storage.data_dir),
        memtable_size_limit: config.storage.memtable_size_bytes,
        block_size: config.storage.block_size,
        sync_policy,
        level0_compact_threshold: config.storage.level0_compact_threshold,
    };

    let engine = match LsmEngine::open(engine_config) {
        Ok(engine) => engine,
        Err(e) => {
            log::error!("Engine initialization failed: {}", e);
            std::process::exit(1);
        }
    };

    // 4. 按角色装配复制链路
    let mut replication_status: Option<Arc<dyn ReplicationStatusProvider>> = None;
    let mut repl_client: Option<Arc<ReplicationClient>> = None;
    let mut repl_server: Option<Arc<ReplicationServer>> = None;

    match role {
        Role::Standalone => {}
        Role::Primary => {
            let client = ReplicationClient::start(ReplicationClientConfig {
                backup_host: config.replication.backup_host.clone(),
                backup_port: config.replication.backup_port,
                ack_timeout_ms: config.replication.ack_timeout_ms,
                pending_window: config.replication.pending_window,
                reconnect_base_ms: config.replication.reconnect_base_ms,
                reconnect_max_ms: config.replication.reconnect_max_ms,
                primary_id: config.replication.primary_id,
            });
            engine.set_replicator(client.clone());
            replication_status = Some(client.clone());
            repl_client = Some(client);
            log::info!("✅ Replication client started (primary role)");
        }
        Role::Backup => {
            let server = match ReplicationServer::start(
                engine.clone(),
                ReplicationServerConfig {
                    listen_host: config.replication.listen_host.clone(),
                    listen_port: config.replication.listen_port,
                },
            ) {
                Ok(server) => server,
                Err(e) => {
                    log::error!("Replication server start failed: {}", e);
                    std::process::exit(1);
                }
            };
            replication_status = Some(server.clone());
            repl_server = Some(server);
            log::info!("✅ Replication server started (backup role)");
        }
    }

    // 5. 启动 TCP 流式写入
    let store: Arc<dyn KvStore> = engine.clone();
    let tcp_server = match TcpIngestServer::start(
        store.clone(),
        TcpIngestConfig {
            listen_host: config.tcp.host.clone(),
            listen_port: config.tcp.port,
        },
    ) {
        Ok(server) => server,
        Err(e) => {
            log::error!("TCP ingest server start failed: {}", e);
            std::process::exit(1);
        }
    };

    print_startup_banner(role, &config);

    // 6. HTTP 服务器阻塞运行到退出
    let http_result = HttpServer::new(
        store,
        replication_status,
        config.http.bind_address(),
    )
    .run()
    .await;

    // 7. 有序停机
    log::info!("Shutting down...");
    tcp_server.shutdown();
    if let Some(client) = repl_client {
        client.shutdown();
    }
    if let Some(server) = repl_server {
        server.shutdown();
    }
    if let Err(e) = engine.close() {
        log::error!("Engine close failed: {}", e);
        std::process::exit(2);
    }

    match http_result {
        Ok(()) => Ok(()),
        Err(e) => {
            log::error!("HTTP server failed: {}", e);
            std::process::exit(2);
        }
    }
}
