//! Write-Ahead Log
//!
//! 每个 epoch 一个只追加文件 `wal-<epoch>.log`。崩溃恢复时按 epoch 顺序回放；
//! MemTable flush 完成后删除对应的旧 epoch 文件。

pub mod manager;

pub use manager::{SyncPolicy, WalManager, WalStats};
