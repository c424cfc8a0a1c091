// Record 编解码 - WAL 帧与复制线路共用的统一格式
//
// 帧格式：
// [len: u32 LE][crc32: u32 LE][type: u8][seq: u64][key_len: u32][key][value_len: u32][value]
//
// - len 不含自身，等于 CRC 字段 + body 的总字节数
// - CRC 覆盖 CRC 字段之后的全部内容（type..value）
// - DELETE 记录 value_len = 0

use crate::{KvError, Result};
use std::io::Read;

/// key 最大长度（64 KiB 上限，受数据块条目 u16 长度字段约束）
pub const MAX_KEY_LEN: usize = 64 * 1024 - 1;

/// value 最大长度（4 MiB）
pub const MAX_VALUE_LEN: usize = 4 * 1024 * 1024;

/// body 固定开销：type(1) + seq(8) + key_len(4) + value_len(4)
const BODY_FIXED: usize = 1 + 8 + 4 + 4;

/// 单帧大小上限，超过视为损坏
const MAX_FRAME_LEN: u32 = (4 + BODY_FIXED + MAX_KEY_LEN + MAX_VALUE_LEN) as u32;

/// 记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Put = 1,
    Delete = 2,
}

impl RecordType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordType::Put),
            2 => Some(RecordType::Delete),
            _ => None,
        }
    }
}

/// 一条已解码的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rtype: RecordType,
    pub seq: u64,
    pub key: Vec<u8>,
    /// DELETE 时为空
    pub value: Vec<u8>,
}

impl Record {
    pub fn put(seq: u64, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            rtype: RecordType::Put,
            seq,
            key,
            value,
        }
    }

    pub fn delete(seq: u64, key: Vec<u8>) -> Self {
        Self {
            rtype: RecordType::Delete,
            seq,
            key,
            value: Vec::new(),
        }
    }
}

/// 编码为完整帧（含长度前缀与 CRC）
///
/// key/value 的长度校验由引擎入口完成，这里只负责布局。
pub fn encode_record(record: &Record) -> Vec<u8> {
    let body_len = BODY_FIXED + record.key.len() + record.value.len();
    let mut buf = Vec::with_capacity(8 + body_len);

    // 预留 len + crc，稍后回填
    buf.extend_from_slice(&[0u8; 8]);

    buf.push(record.rtype as u8);
    buf.extend_from_slice(&record.seq.to_le_bytes());
    buf.extend_from_slice(&(record.key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record.key);
    buf.extend_from_slice(&(record.value.len() as u32).to_le_bytes());
    buf.extend_from_slice(&record.value);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[8..]);
    let crc = hasher.finalize();

    let len = (4 + body_len) as u32;
    buf[0..4].copy_from_slice(&len.to_le_bytes());
    buf[4..8].copy_from_slice(&crc.to_le_bytes());

    buf
}

/// 从字节流读取下一帧
///
/// 返回值：
/// - `Ok(Some(record))` - 成功读取一条完整记录
/// - `Ok(None)` - 流在帧边界处干净结束
/// - `Err(Corruption)` - 帧中途截断或 CRC 不匹配（WAL 回放视为日志尾部，线路上视为协议错误）
/// - `Err(Io)` - 底层读取失败
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    // 长度前缀单独处理：0 字节可读 = 干净 EOF，部分可读 = 截断
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader
            .read(&mut len_buf[filled..])
            .map_err(|e| KvError::Io(format!("read frame length failed: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(KvError::Corruption("truncated frame length".to_string()));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf);
    if len <= 4 || len > MAX_FRAME_LEN {
        return Err(KvError::Corruption(format!("invalid frame length {}", len)));
    }

    let mut crc_buf = [0u8; 4];
    read_exact_or_corrupt(reader, &mut crc_buf)?;
    let crc = u32::from_le_bytes(crc_buf);

    let body_len = (len - 4) as usize;
    let mut body = vec![0u8; body_len];
    read_exact_or_corrupt(reader, &mut body)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    if hasher.finalize() != crc {
        return Err(KvError::Corruption("record crc mismatch".to_string()));
    }

    decode_body(&body)
}

fn read_exact_or_corrupt<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            KvError::Corruption("truncated frame body".to_string())
        } else {
            KvError::Io(format!("read frame body failed: {}", e))
        }
    })
}

/// 解析已通过 CRC 校验的 body
fn decode_body(body: &[u8]) -> Result<Option<Record>> {
    if body.len() < BODY_FIXED {
        return Err(KvError::Corruption("frame body too short".to_string()));
    }

    let rtype = RecordType::from_u8(body[0])
        .ok_or_else(|| KvError::Corruption(format!("unknown record type {}", body[0])))?;
    let seq = u64::from_le_bytes(body[1..9].try_into().unwrap());
    let key_len = u32::from_le_bytes(body[9..13].try_into().unwrap()) as usize;

    if key_len == 0 || key_len > MAX_KEY_LEN || 13 + key_len + 4 > body.len() {
        return Err(KvError::Corruption(format!("invalid key length {}", key_len)));
    }
    let key = body[13..13 + key_len].to_vec();

    let value_len_off = 13 + key_len;
    let value_len =
        u32::from_le_bytes(body[value_len_off..value_len_off + 4].try_into().unwrap()) as usize;
    let value_off = value_len_off + 4;

    if value_len > MAX_VALUE_LEN || value_off + value_len != body.len() {
        return Err(KvError::Corruption(format!(
            "invalid value length {}",
            value_len
        )));
    }
    let value = body[value_off..].to_vec();

    if rtype == RecordType::Delete && value_len != 0 {
        return Err(KvError::Corruption(
            "delete record carries a value".to_string(),
        ));
    }

    Ok(Some(Record {
        rtype,
        seq,
        key,
        value,
    }))
}
