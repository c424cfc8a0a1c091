//! 对外服务层
//!
//! 两个门面都只依赖 `KvStore` 能力集：
//! - HTTP API（actix-web）：点写/点读/删除/批量写/范围查询/复制状态
//! - TCP 流式写入：帧格式与 WAL 相同，每条持久化后回一个 ACK 字节

pub mod http;
pub mod tcp;
