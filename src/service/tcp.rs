// TCP 流式写入服务
//
// 线路帧与 WAL 记录同构；帧内 seq 由发送方填 0，引擎写入时重新分配。
// 每条写入在持久化完成后回一个 ACK 字节 (0x01)；客户端半关闭即视为
// 流结束，服务端冲刷剩余 ACK 后关闭连接。

use crate::storage::record::{self, RecordType};
use crate::storage::KvStore;
use crate::{KvError, Result};
use parking_lot::Mutex;
use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// 每条持久化成功后的确认字节
const ACK_BYTE: u8 = 0x01;

/// TCP 写入服务配置
#[derive(Debug, Clone)]
pub struct TcpIngestConfig {
    pub listen_host: String,
    pub listen_port: u16,
}

impl Default for TcpIngestConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8090,
        }
    }
}

/// TCP 流式写入服务
pub struct TcpIngestServer {
    store: Arc<dyn KvStore>,
    stop: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpIngestServer {
    /// 绑定端口并启动接受线程
    pub fn start(store: Arc<dyn KvStore>, config: TcpIngestConfig) -> Result<Arc<Self>> {
        let addr = format!("{}:{}", config.listen_host, config.listen_port);
        let listener = TcpListener::bind(&addr)
            .map_err(|e| KvError::Io(format!("bind tcp ingest port failed: {}", e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| KvError::Io(format!("set nonblocking failed: {}", e)))?;

        let server = Arc::new(Self {
            store,
            stop: Arc::new(AtomicBool::new(false)),
            acceptor: Mutex::new(None),
        });

        log::info!("TCP ingest server listening on {}", addr);

        let worker = Arc::clone(&server);
        let handle = std::thread::Builder::new()
            .name("tcp-ingest".to_string())
            .spawn(move || worker.run_acceptor(listener))
            .expect("spawn tcp-ingest thread");
        *server.acceptor.lock() = Some(handle);

        Ok(server)
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_acceptor(self: Arc<Self>, listener: TcpListener) {
        while !self.stop.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("TCP ingest connection from {}", peer);
                    let store = self.store.clone();
                    let stop = self.stop.clone();
                    std::thread::Builder::new()
                        .name("tcp-ingest-conn".to_string())
                        .spawn(move || {
                            if let Err(e) = handle_connection(store, stop, stream) {
                                log::warn!("TCP ingest connection error: {}", e);
                            }
                        })
                        .expect("spawn tcp-ingest-conn thread");
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    log::error!("TCP ingest accept failed: {}", e);
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
    }
}

fn handle_connection(
    store: Arc<dyn KvStore>,
    stop: Arc<AtomicBool>,
    stream: TcpStream,
) -> Result<()> {
    stream
        .set_nonblocking(false)
        .map_err(|e| KvError::Io(format!("set blocking failed: {}", e)))?;
    let writer_stream = stream
        .try_clone()
        .map_err(|e| KvError::Io(format!("clone stream failed: {}", e)))?;
    let mut reader = BufReader::new(stream);
    let mut writer = BufWriter::new(writer_stream);

    let mut accepted = 0u64;

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        match record::read_record(&mut reader) {
            Ok(Some(op)) => {
                match op.rtype {
                    RecordType::Put => store.put(&op.key, &op.value)?,
                    RecordType::Delete => store.delete(&op.key)?,
                }
                accepted += 1;

                // 持久化完成，逐条确认
                writer
                    .write_all(&[ACK_BYTE])
                    .map_err(|e| KvError::Io(format!("write ack failed: {}", e)))?;
                writer
                    .flush()
                    .map_err(|e| KvError::Io(format!("flush ack failed: {}", e)))?;
            }
            // 客户端半关闭：冲刷剩余 ACK 后结束
            Ok(None) => break,
            Err(KvError::Corruption(msg)) => {
                return Err(KvError::Protocol(format!("malformed ingest frame: {}", msg)));
            }
            Err(e) => return Err(e),
        }
    }

    writer
        .flush()
        .map_err(|e| KvError::Io(format!("final ack flush failed: {}", e)))?;
    log::info!("TCP ingest stream done: {} ops", accepted);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::engine::{EngineConfig, LsmEngine};
    use crate::storage::record::{encode_record, Record};
    use std::io::Read;

    fn start_on_free_port(store: Arc<dyn KvStore>) -> (Arc<TcpIngestServer>, u16) {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = TcpIngestServer::start(
            store,
            TcpIngestConfig {
                listen_host: "127.0.0.1".to_string(),
                listen_port: port,
            },
        )
        .unwrap();
        (server, port)
    }

    #[test]
    fn test_stream_puts_and_acks() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let engine = LsmEngine::open(EngineConfig {
            data_dir: tmp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let (server, port) = start_on_free_port(engine.clone());

        let mut stream = {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            loop {
                match TcpStream::connect(("127.0.0.1", port)) {
                    Ok(s) => break s,
                    Err(_) if std::time::Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(20))
                    }
                    Err(e) => panic!("connect failed: {}", e),
                }
            }
        };

        // 流式写入 100 条，每条一个 ACK 字节
        for i in 0..100u32 {
            let record = Record::put(
                0,
                format!("tcp:{:04}", i).into_bytes(),
                format!("streamed-{}", i).into_bytes(),
            );
            stream.write_all(&encode_record(&record)).unwrap();

            let mut ack = [0u8; 1];
            stream.read_exact(&mut ack).unwrap();
            assert_eq!(ack[0], ACK_BYTE);
        }

        // 半关闭写端，对端收尾
        stream.shutdown(std::net::Shutdown::Write).unwrap();

        for i in (0..100u32).step_by(13) {
            assert_eq!(
                engine
                    .get(format!("tcp:{:04}", i).as_bytes())
                    .unwrap()
                    .unwrap(),
                format!("streamed-{}", i).as_bytes()
            );
        }

        let all: Vec<_> = engine
            .read_key_range(b"tcp:0000", b"tcp:0099", None)
            .unwrap()
            .collect();
        assert_eq!(all.len(), 100);

        server.shutdown();
    }
}
