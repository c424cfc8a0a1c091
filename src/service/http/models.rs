//! HTTP API 请求模型

use serde::Deserialize;

/// 点写请求
#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub key: String,
    /// 任意 JSON：字符串原样存储，其他类型存紧凑 JSON 文本
    pub value: serde_json::Value,
}

/// 批量写请求，两种形态二选一：
/// `{"entries":[{"key":..,"value":..},..]}` 或 `{"keys":[..],"values":[..]}`
#[derive(Debug, Deserialize)]
pub struct BatchPutRequest {
    #[serde(default)]
    pub entries: Option<Vec<BatchEntry>>,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    #[serde(default)]
    pub values: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct BatchEntry {
    pub key: String,
    pub value: serde_json::Value,
}

/// 范围查询参数
#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<usize>,
}

/// JSON value 编码为存储字节；null 不合法
pub fn value_to_bytes(value: &serde_json::Value) -> Option<Vec<u8>> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.as_bytes().to_vec()),
        other => Some(other.to_string().into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_value_to_bytes() {
        assert_eq!(value_to_bytes(&json!("Alice")).unwrap(), b"Alice");
        assert_eq!(value_to_bytes(&json!(42)).unwrap(), b"42");
        assert_eq!(
            value_to_bytes(&json!({"a": 1})).unwrap(),
            br#"{"a":1}"#
        );
        assert!(value_to_bytes(&json!(null)).is_none());
        // 空字符串是合法 value
        assert_eq!(value_to_bytes(&json!("")).unwrap(), b"");
    }

    #[test]
    fn test_batch_request_shapes() {
        let by_entries: BatchPutRequest = serde_json::from_str(
            r#"{"entries":[{"key":"a","value":"1"},{"key":"b","value":"2"}]}"#,
        )
        .unwrap();
        assert_eq!(by_entries.entries.unwrap().len(), 2);

        let by_arrays: BatchPutRequest =
            serde_json::from_str(r#"{"keys":["a","b"],"values":["1","2"]}"#).unwrap();
        assert_eq!(by_arrays.keys.unwrap().len(), 2);
        assert_eq!(by_arrays.values.unwrap().len(), 2);
    }
}
