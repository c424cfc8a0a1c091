// 复制服务端（backup 侧）
//
// 复制端口同一时刻只接受一条连接。按帧读取 op，校验序列号后以 primary
// 的原始序列号应用到本地引擎，成功即回写 ACK。
//
// 幂等规则：
// - seq <= last_applied：跳过应用但照常 ACK（primary 重连后的重发）
// - seq == last_applied + 1：应用并推进
// - seq >  last_applied + 1：序列号出现空洞，断开连接迫使 primary
//   从未确认窗口重新同步

use super::protocol::{encode_ack, read_handshake};
use super::{ReplicationMetrics, ReplicationState, ReplicationStatusProvider};
use crate::storage::record;
use crate::storage::engine::LsmEngine;
use crate::{KvError, Result};
use parking_lot::Mutex;
use std::io::{BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// 复制服务端配置
#[derive(Debug, Clone)]
pub struct ReplicationServerConfig {
    pub listen_host: String,
    pub listen_port: u16,
}

impl Default for ReplicationServerConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 9100,
        }
    }
}

#[derive(Default)]
struct ServerMetrics {
    ops_applied: AtomicU64,
    ops_skipped: AtomicU64,
    protocol_errors: AtomicU64,
}

/// backup 侧复制服务端
pub struct ReplicationServer {
    engine: Arc<LsmEngine>,
    connected: AtomicBool,
    last_applied_seq: AtomicU64,
    metrics: ServerMetrics,
    stop: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    /// 当前连接的句柄，shutdown 时用于打断阻塞读
    active_conn: Mutex<Option<TcpStream>>,
}

impl ReplicationServer {
    /// 绑定端口并启动接受线程；绑定失败视为初始化错误
    pub fn start(
        engine: Arc<LsmEngine>,
        config: ReplicationServerConfig,
    ) -> Result<Arc<Self>> {
        let addr = format!("{}:{}", config.listen_host, config.listen_port);
        let listener = TcpListener::bind(&addr)
            .map_err(|e| KvError::Io(format!("bind replication port failed: {}", e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| KvError::Io(format!("set nonblocking failed: {}", e)))?;

        let last_applied = engine.last_sequence();
        let server = Arc::new(Self {
            engine,
            connected: AtomicBool::new(false),
            last_applied_seq: AtomicU64::new(last_applied),
            metrics: ServerMetrics::default(),
            stop: AtomicBool::new(false),
            acceptor: Mutex::new(None),
            active_conn: Mutex::new(None),
        });

        log::info!(
            "Replication server listening on {} (last applied seq {})",
            addr,
            last_applied
        );

        let worker = Arc::clone(&server);
        let handle = std::thread::Builder::new()
            .name("repl-server".to_string())
            .spawn(move || worker.run_acceptor(listener))
            .expect("spawn repl-server thread");
        *server.acceptor.lock() = Some(handle);

        Ok(server)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn last_applied_seq(&self) -> u64 {
        self.last_applied_seq.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(stream) = self.active_conn.lock().take() {
            // 打断正在服务的连接的阻塞读
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        while !self.stop.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("Replication connection accepted from {}", peer);
                    if let Err(e) = stream.set_nonblocking(false) {
                        log::error!("set blocking failed: {}", e);
                        continue;
                    }
                    // 一次只处理一条连接：在本线程内同步服务到断开
                    self.serve_connection(stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    log::error!("Replication accept failed: {}", e);
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }

    fn serve_connection(&self, stream: TcpStream) {
        if let Ok(clone) = stream.try_clone() {
            *self.active_conn.lock() = Some(clone);
        }
        self.connected.store(true, Ordering::Release);

        if let Err(e) = self.handle_stream(stream) {
            log::warn!("Replication connection terminated: {}", e);
        }

        self.connected.store(false, Ordering::Release);
        *self.active_conn.lock() = None;
    }

    fn handle_stream(&self, stream: TcpStream) -> Result<()> {
        let mut writer = stream
            .try_clone()
            .map_err(|e| KvError::Io(format!("clone stream failed: {}", e)))?;
        let mut reader = BufReader::new(stream);

        let primary_id = match read_handshake(&mut reader) {
            Ok(id) => id,
            Err(e) => {
                self.metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        log::info!("Replication stream established (primary {})", primary_id);

        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            let op = match record::read_record(&mut reader) {
                Ok(Some(op)) => op,
                Ok(None) => {
                    log::info!("Primary closed replication stream");
                    return Ok(());
                }
                Err(KvError::Corruption(msg)) => {
                    self.metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(KvError::Protocol(format!("malformed op frame: {}", msg)));
                }
                Err(e) => return Err(e),
            };

            let seq = op.seq;
            let last_applied = self.last_applied_seq.load(Ordering::Acquire);

            if seq <= last_applied {
                // 重连后的重发：跳过应用，照常 ACK
                self.metrics.ops_skipped.fetch_add(1, Ordering::Relaxed);
            } else if seq == last_applied + 1 {
                self.engine.apply_replicated(op)?;
                self.last_applied_seq.store(seq, Ordering::Release);
                self.metrics.ops_applied.fetch_add(1, Ordering::Relaxed);
            } else {
                self.metrics.protocol_errors.fetch_add(1, Ordering::Relaxed);
                return Err(KvError::Protocol(format!(
                    "sequence gap: got {}, last applied {}",
                    seq, last_applied
                )));
            }

            writer
                .write_all(&encode_ack(seq))
                .map_err(|e| KvError::Io(format!("write ack failed: {}", e)))?;
        }
    }
}

impl ReplicationStatusProvider for ReplicationServer {
    fn state(&self) -> ReplicationState {
        ReplicationState {
            role: "backup".to_string(),
            connected: self.is_connected(),
            last_sent_seq: None,
            last_acked_seq: None,
            pending_count: None,
            last_applied_seq: Some(self.last_applied_seq()),
        }
    }

    fn metrics(&self) -> ReplicationMetrics {
        ReplicationMetrics {
            ops_sent: None,
            ops_acked: None,
            reconnect_count: None,
            ops_applied: Some(self.metrics.ops_applied.load(Ordering::Relaxed)),
            ops_skipped: Some(self.metrics.ops_skipped.load(Ordering::Relaxed)),
        }
    }
}
