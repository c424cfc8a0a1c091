//! HTTP API 路由配置

use super::handlers;
use actix_web::web;

/// 配置所有路由
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        // 健康检查
        .route("/health", web::get().to(handlers::health_check))
        // 键值读写
        .route("/put", web::post().to(handlers::put))
        .route("/batch-put", web::post().to(handlers::batch_put))
        .route("/get/{key}", web::get().to(handlers::get_key))
        .route("/delete/{key}", web::delete().to(handlers::delete_key))
        // 范围查询
        .route("/range", web::get().to(handlers::range))
        // 复制状态
        .route(
            "/replication/status",
            web::get().to(handlers::replication_status),
        );
}
