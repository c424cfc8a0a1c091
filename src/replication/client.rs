// 复制客户端（primary 侧）
//
// 一条到 backup 的长连接：连接管理线程负责握手、指数退避重连与未确认
// 窗口的按序重发；每条连接配一个 ACK 读取线程推进 last_acked_seq。
//
// 引擎在写锁内调用 submit（入队 + 即时发送，保证与序列号同序），在锁外
// 调用 wait_acked 阻塞到 ACK 或超时；超时重置连接并向调用方报错，本地
// 持久性不受影响，重发由 backup 的序列号幂等兜底。

use super::protocol::{encode_handshake, read_ack};
use super::{ReplicationMetrics, ReplicationState, ReplicationStatusProvider};
use crate::storage::record::{encode_record, Record};
use crate::storage::Replicator;
use crate::{KvError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// 复制客户端配置
#[derive(Debug, Clone)]
pub struct ReplicationClientConfig {
    pub backup_host: String,
    pub backup_port: u16,

    /// sync-sync 等待 ACK 的超时（毫秒）
    pub ack_timeout_ms: u64,

    /// 未确认窗口上限，超限后写入报 ReplicationDisconnected
    pub pending_window: usize,

    /// 重连退避起点 / 上限（毫秒）
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,

    /// 握手中携带的节点标识
    pub primary_id: u64,
}

impl Default for ReplicationClientConfig {
    fn default() -> Self {
        Self {
            backup_host: "127.0.0.1".to_string(),
            backup_port: 9100,
            ack_timeout_ms: 5000,
            pending_window: 4096,
            reconnect_base_ms: 100,
            reconnect_max_ms: 5000,
            primary_id: 1,
        }
    }
}

struct PendingOp {
    seq: u64,
    frame: Vec<u8>,
}

#[derive(Default)]
struct ClientMetrics {
    ops_sent: AtomicU64,
    ops_acked: AtomicU64,
    reconnect_count: AtomicU64,
}

/// primary 侧复制客户端
pub struct ReplicationClient {
    config: ReplicationClientConfig,

    /// 当前连接的写端
    conn: Mutex<Option<TcpStream>>,
    /// 连接代数，防止旧连接的 ACK 线程误拆新连接
    conn_epoch: AtomicU64,
    connected: AtomicBool,
    ever_connected: AtomicBool,

    last_sent_seq: AtomicU64,

    /// ACK 推进点，Condvar 唤醒 sync-sync 等待者
    acked: Mutex<u64>,
    ack_cv: Condvar,

    /// 未确认窗口（按序）
    pending: Mutex<VecDeque<PendingOp>>,

    metrics: ClientMetrics,
    stop: AtomicBool,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationClient {
    /// 创建并启动连接管理线程
    pub fn start(config: ReplicationClientConfig) -> Arc<Self> {
        let client = Arc::new(Self {
            config,
            conn: Mutex::new(None),
            conn_epoch: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            last_sent_seq: AtomicU64::new(0),
            acked: Mutex::new(0),
            ack_cv: Condvar::new(),
            pending: Mutex::new(VecDeque::new()),
            metrics: ClientMetrics::default(),
            stop: AtomicBool::new(false),
            manager: Mutex::new(None),
        });

        let worker = Arc::clone(&client);
        let handle = std::thread::Builder::new()
            .name("repl-client".to_string())
            .spawn(move || worker.run_manager())
            .expect("spawn repl-client thread");
        *client.manager.lock() = Some(handle);

        client
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.drop_connection();
        self.ack_cv.notify_all();
        if let Some(handle) = self.manager.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_manager(self: Arc<Self>) {
        let mut backoff = self.config.reconnect_base_ms;

        while !self.stop.load(Ordering::Acquire) {
            if self.connected.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            match self.try_connect() {
                Ok(()) => {
                    backoff = self.config.reconnect_base_ms;
                }
                Err(e) => {
                    log::warn!(
                        "Replication connect to {}:{} failed: {}, retry in {} ms",
                        self.config.backup_host,
                        self.config.backup_port,
                        e,
                        backoff
                    );
                    std::thread::sleep(Duration::from_millis(backoff));
                    backoff = (backoff * 2).min(self.config.reconnect_max_ms);
                }
            }
        }
    }

    fn try_connect(self: &Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.backup_host, self.config.backup_port);
        let mut stream = TcpStream::connect(&addr)
            .map_err(|e| KvError::ReplicationDisconnected(format!("connect failed: {}", e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| KvError::Io(format!("set nodelay failed: {}", e)))?;

        stream
            .write_all(&encode_handshake(self.config.primary_id))
            .map_err(|e| KvError::ReplicationDisconnected(format!("handshake failed: {}", e)))?;

        let reader_stream = stream
            .try_clone()
            .map_err(|e| KvError::Io(format!("clone stream failed: {}", e)))?;

        // 持有 pending 锁直到连接就位：并发的 submit 要么赶上这轮重发，
        // 要么看到已就绪的连接直接发送，不会两头落空
        let epoch = {
            let pending = self.pending.lock();
            for op in pending.iter() {
                stream.write_all(&op.frame).map_err(|e| {
                    KvError::ReplicationDisconnected(format!("resend failed: {}", e))
                })?;
            }
            if !pending.is_empty() {
                log::info!("Resent {} pending ops after reconnect", pending.len());
            }

            // 先推进代数再挂连接：旧代 ACK 线程从此刻起不再有拆线资格
            let epoch = self.conn_epoch.fetch_add(1, Ordering::AcqRel) + 1;
            *self.conn.lock() = Some(stream);
            self.connected.store(true, Ordering::Release);
            epoch
        };

        if self.ever_connected.swap(true, Ordering::AcqRel) {
            self.metrics.reconnect_count.fetch_add(1, Ordering::Relaxed);
            log::info!("Replication reconnected to {}", addr);
        } else {
            log::info!("Replication connected to {}", addr);
        }

        let client = Arc::clone(self);
        std::thread::Builder::new()
            .name("repl-ack".to_string())
            .spawn(move || client.run_ack_reader(reader_stream, epoch))
            .expect("spawn repl-ack thread");

        Ok(())
    }

    fn run_ack_reader(self: Arc<Self>, stream: TcpStream, epoch: u64) {
        let mut reader = BufReader::new(stream);

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match read_ack(&mut reader) {
                Ok(Some(seq)) => self.handle_ack(seq),
                Ok(None) => {
                    log::warn!("Replication connection closed by backup");
                    break;
                }
                Err(e) => {
                    if !self.stop.load(Ordering::Acquire) {
                        log::warn!("Replication ack reader error: {}", e);
                    }
                    break;
                }
            }
        }

        // 只拆自己这一代的连接；重连已发生时不动新连接
        if self.conn_epoch.load(Ordering::Acquire) == epoch {
            self.drop_connection();
        }
        self.ack_cv.notify_all();
    }

    fn handle_ack(&self, ack_seq: u64) {
        let retired = {
            let mut pending = self.pending.lock();
            let before = pending.len();
            while pending.front().map(|op| op.seq <= ack_seq) == Some(true) {
                pending.pop_front();
            }
            before - pending.len()
        };
        self.metrics
            .ops_acked
            .fetch_add(retired as u64, Ordering::Relaxed);

        let mut acked = self.acked.lock();
        if ack_seq > *acked {
            *acked = ack_seq;
            self.ack_cv.notify_all();
        }
    }

    fn drop_connection(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(stream) = self.conn.lock().take() {
            // 关闭底层 socket，唤醒阻塞中的 ACK 读取线程
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

impl Replicator for ReplicationClient {
    fn submit(&self, record: &Record) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(KvError::ReplicationDisconnected(
                "replication client stopped".to_string(),
            ));
        }

        let frame = encode_record(record);

        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.config.pending_window {
                return Err(KvError::ReplicationDisconnected(format!(
                    "pending window full ({} ops)",
                    pending.len()
                )));
            }
            pending.push_back(PendingOp {
                seq: record.seq,
                frame: frame.clone(),
            });
        }

        // 连接可用则即时发送；失败交给重连流程按窗口重发
        let mut conn = self.conn.lock();
        if let Some(stream) = conn.as_mut() {
            match stream.write_all(&frame) {
                Ok(()) => {
                    self.last_sent_seq.store(record.seq, Ordering::Release);
                    self.metrics.ops_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    log::warn!("Replication send failed: {}", e);
                    *conn = None;
                    self.connected.store(false, Ordering::Release);
                }
            }
        }

        Ok(())
    }

    fn wait_acked(&self, seq: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.config.ack_timeout_ms);
        let mut acked = self.acked.lock();

        while *acked < seq {
            if self.stop.load(Ordering::Acquire) {
                return Err(KvError::ReplicationDisconnected(
                    "replication client stopped".to_string(),
                ));
            }
            let result = self.ack_cv.wait_until(&mut acked, deadline);
            if result.timed_out() && *acked < seq {
                drop(acked);
                // 超时重置连接，待重连后按窗口重发
                self.drop_connection();
                return Err(KvError::ReplicationTimeout(format!(
                    "seq {} not acked within {} ms",
                    seq, self.config.ack_timeout_ms
                )));
            }
        }

        Ok(())
    }
}

impl ReplicationStatusProvider for ReplicationClient {
    fn state(&self) -> ReplicationState {
        ReplicationState {
            role: "primary".to_string(),
            connected: self.is_connected(),
            last_sent_seq: Some(self.last_sent_seq.load(Ordering::Acquire)),
            last_acked_seq: Some(*self.acked.lock()),
            pending_count: Some(self.pending.lock().len()),
            last_applied_seq: None,
        }
    }

    fn metrics(&self) -> ReplicationMetrics {
        ReplicationMetrics {
            ops_sent: Some(self.metrics.ops_sent.load(Ordering::Relaxed)),
            ops_acked: Some(self.metrics.ops_acked.load(Ordering::Relaxed)),
            reconnect_count: Some(self.metrics.reconnect_count.load(Ordering::Relaxed)),
            ops_applied: None,
            ops_skipped: None,
        }
    }
}

impl Drop for ReplicationClient {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
