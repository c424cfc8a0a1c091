//! HTTP API 请求处理器

use actix_web::{web, HttpResponse};
use std::sync::Arc;

use super::models::{value_to_bytes, BatchPutRequest, PutRequest, RangeQuery};
use crate::replication::ReplicationStatusProvider;
use crate::storage::KvStore;
use crate::KvError;

/// 应用状态
pub struct AppState {
    pub store: Arc<dyn KvStore>,
    pub replication: Option<Arc<dyn ReplicationStatusProvider>>,
}

/// 引擎错误映射为 HTTP 响应
fn error_response(e: KvError) -> HttpResponse {
    let body = serde_json::json!({ "success": false, "error": e.to_string() });
    match e {
        KvError::Validation(_) => HttpResponse::BadRequest().json(body),
        KvError::NotFound => HttpResponse::NotFound().json(body),
        KvError::ReplicationTimeout(_) | KvError::ReplicationDisconnected(_) => {
            HttpResponse::ServiceUnavailable().json(body)
        }
        KvError::Io(_) | KvError::Corruption(_) | KvError::Protocol(_) => {
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn bad_request(msg: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({
        "success": false,
        "error": msg,
    }))
}

/// 健康检查
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

/// 点写
pub async fn put(
    req: web::Json<PutRequest>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    let value = match value_to_bytes(&req.value) {
        Some(value) => value,
        None => return bad_request("null value"),
    };

    match state.store.put(req.key.as_bytes(), &value) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "success": true })),
        Err(e) => {
            log::error!("put {} failed: {}", req.key, e);
            error_response(e)
        }
    }
}

/// 批量写
pub async fn batch_put(
    req: web::Json<BatchPutRequest>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    let req = req.into_inner();

    let entries: Vec<(Vec<u8>, Vec<u8>)> = if let Some(entries) = req.entries {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match value_to_bytes(&entry.value) {
                Some(value) => out.push((entry.key.into_bytes(), value)),
                None => return bad_request("null value in batch"),
            }
        }
        out
    } else if let (Some(keys), Some(values)) = (req.keys, req.values) {
        if keys.len() != values.len() {
            return bad_request("keys/values length mismatch");
        }
        let mut out = Vec::with_capacity(keys.len());
        for (key, value) in keys.into_iter().zip(values.iter()) {
            match value_to_bytes(value) {
                Some(value) => out.push((key.into_bytes(), value)),
                None => return bad_request("null value in batch"),
            }
        }
        out
    } else {
        return bad_request("missing entries or keys/values");
    };

    if entries.is_empty() {
        return bad_request("empty batch");
    }

    match state.store.batch_put(entries) {
        Ok(count) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "count": count,
        })),
        Err(e) => {
            log::error!("batch-put failed: {}", e);
            error_response(e)
        }
    }
}

/// 点读
pub async fn get_key(
    key: web::Path<String>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    match state.store.get(key.as_bytes()) {
        Ok(Some(value)) => HttpResponse::Ok().json(serde_json::json!({
            "key": key.as_str(),
            "value": String::from_utf8_lossy(&value),
        })),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "success": false,
            "error": format!("key not found: {}", key),
        })),
        Err(e) => {
            log::error!("get {} failed: {}", key, e);
            error_response(e)
        }
    }
}

/// 删除
pub async fn delete_key(
    key: web::Path<String>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    match state.store.delete(key.as_bytes()) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "success": true })),
        Err(e) => {
            log::error!("delete {} failed: {}", key, e);
            error_response(e)
        }
    }
}

/// 范围查询
pub async fn range(
    query: web::Query<RangeQuery>,
    state: web::Data<Arc<AppState>>,
) -> HttpResponse {
    let start = match &query.start {
        Some(s) => s.clone(),
        None => return bad_request("missing start"),
    };
    let end = match &query.end {
        Some(e) => e.clone(),
        None => return bad_request("missing end"),
    };

    let scan = match state
        .store
        .read_key_range(start.as_bytes(), end.as_bytes(), query.limit)
    {
        Ok(scan) => scan,
        Err(e) => return error_response(e),
    };

    let mut results = Vec::new();
    for item in scan {
        match item {
            Ok((key, value)) => results.push(serde_json::json!({
                "key": String::from_utf8_lossy(&key),
                "value": String::from_utf8_lossy(&value),
            })),
            Err(e) => {
                log::error!("range scan failed: {}", e);
                return error_response(e);
            }
        }
    }

    HttpResponse::Ok().json(serde_json::json!({
        "count": results.len(),
        "results": results,
    }))
}

/// 复制状态
pub async fn replication_status(state: web::Data<Arc<AppState>>) -> HttpResponse {
    match &state.replication {
        Some(provider) => HttpResponse::Ok().json(serde_json::json!({
            "enabled": true,
            "state": provider.state(),
            "metrics": provider.metrics(),
        })),
        None => HttpResponse::Ok().json(serde_json::json!({ "enabled": false })),
    }
}
