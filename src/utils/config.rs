//! 配置管理模块

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            http: HttpConfig::default(),
            tcp: TcpConfig::default(),
            storage: StorageConfig::default(),
            replication: ReplicationConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, String> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))
    }

    pub fn load_default() -> Result<Self, String> {
        Self::load_from_file("config/qakv.toml")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// "standalone" | "primary" | "backup"
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl HttpConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_tcp_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_memtable_size")]
    pub memtable_size_bytes: usize,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    /// "sync" | "interval" | "none"
    #[serde(default = "default_sync_policy")]
    pub sync_policy: String,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,
    /// Level-0 表数阈值，配置后开启 compaction
    #[serde(default)]
    pub level0_compact_threshold: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            memtable_size_bytes: default_memtable_size(),
            block_size: default_block_size(),
            sync_policy: default_sync_policy(),
            sync_interval_ms: default_sync_interval(),
            level0_compact_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// backup 角色的监听地址
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_repl_port")]
    pub listen_port: u16,

    /// primary 角色的对端地址
    #[serde(default = "default_host")]
    pub backup_host: String,
    #[serde(default = "default_repl_port")]
    pub backup_port: u16,

    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_pending_window")]
    pub pending_window: usize,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_primary_id")]
    pub primary_id: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_repl_port(),
            backup_host: default_host(),
            backup_port: default_repl_port(),
            ack_timeout_ms: default_ack_timeout(),
            pending_window: default_pending_window(),
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_ms: default_reconnect_max(),
            primary_id: default_primary_id(),
        }
    }
}

// 默认值函数
fn default_role() -> String {
    "standalone".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_tcp_port() -> u16 {
    8090
}
fn default_repl_port() -> u16 {
    9100
}
fn default_data_dir() -> String {
    "./qakv-data".to_string()
}
fn default_memtable_size() -> usize {
    64 * 1024 * 1024
}
fn default_block_size() -> usize {
    4 * 1024
}
fn default_sync_policy() -> String {
    "sync".to_string()
}
fn default_sync_interval() -> u64 {
    10
}
fn default_ack_timeout() -> u64 {
    5000
}
fn default_pending_window() -> usize {
    4096
}
fn default_reconnect_base() -> u64 {
    100
}
fn default_reconnect_max() -> u64 {
    5000
}
fn default_primary_id() -> u64 {
    1
}
