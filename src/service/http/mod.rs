//! HTTP API 服务模块
//!
//! 提供 RESTful API 接口用于键值读写、范围查询与复制状态检视

pub mod handlers;
pub mod models;
pub mod routes;

use crate::replication::ReplicationStatusProvider;
use crate::storage::KvStore;
use actix_web::{middleware, web, App, HttpServer as ActixHttpServer};
use handlers::AppState;
use std::io;
use std::sync::Arc;

/// HTTP 服务器
pub struct HttpServer {
    /// 应用状态
    app_state: Arc<AppState>,

    /// 监听地址
    bind_address: String,
}

impl HttpServer {
    /// 创建新的 HTTP 服务器
    pub fn new(
        store: Arc<dyn KvStore>,
        replication: Option<Arc<dyn ReplicationStatusProvider>>,
        bind_address: String,
    ) -> Self {
        let app_state = Arc::new(AppState { store, replication });

        Self {
            app_state,
            bind_address,
        }
    }

    /// 启动 HTTP 服务器
    pub async fn run(self) -> io::Result<()> {
        log::info!("Starting HTTP server at {}", self.bind_address);

        let app_state = self.app_state.clone();
        let bind_address = self.bind_address.clone();

        ActixHttpServer::new(move || {
            App::new()
                // 应用状态
                .app_data(web::Data::new(app_state.clone()))
                // 中间件
                .wrap(middleware::Logger::default())
                // CORS 支持
                .wrap(
                    actix_cors::Cors::default()
                        .allow_any_origin()
                        .allow_any_method()
                        .allow_any_header()
                        .max_age(3600),
                )
                // 配置路由
                .configure(routes::configure)
        })
        .bind(&bind_address)?
        .run()
        .await
    }
}
