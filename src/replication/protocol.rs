// 复制线路协议
//
// op 帧与 WAL 记录同构（storage::record），本模块只补充两种控制帧：
// - 握手帧（primary 连接后首发）: [magic:u64][version:u32][primary_id:u64]
// - ACK 帧（backup → primary）:   [len:u32 = 8][ack_seq:u64]

use crate::{KvError, Result};
use std::io::Read;

/// 握手魔数（"QAKVREPL"）
pub const REPL_MAGIC: u64 = u64::from_le_bytes(*b"QAKVREPL");

/// 协议版本，双方必须一致，无协商
pub const REPL_VERSION: u32 = 1;

/// 握手帧长度
pub const HANDSHAKE_LEN: usize = 20;

/// ACK 帧长度
pub const ACK_FRAME_LEN: usize = 12;

pub fn encode_handshake(primary_id: u64) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0..8].copy_from_slice(&REPL_MAGIC.to_le_bytes());
    buf[8..12].copy_from_slice(&REPL_VERSION.to_le_bytes());
    buf[12..20].copy_from_slice(&primary_id.to_le_bytes());
    buf
}

/// 读取并校验握手帧，返回 primary_id
pub fn read_handshake<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    reader
        .read_exact(&mut buf)
        .map_err(|e| KvError::Protocol(format!("handshake unreadable: {}", e)))?;

    let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    if magic != REPL_MAGIC {
        return Err(KvError::Protocol("handshake magic mismatch".to_string()));
    }
    let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if version != REPL_VERSION {
        return Err(KvError::Protocol(format!(
            "unsupported protocol version {}",
            version
        )));
    }
    Ok(u64::from_le_bytes(buf[12..20].try_into().unwrap()))
}

pub fn encode_ack(ack_seq: u64) -> [u8; ACK_FRAME_LEN] {
    let mut buf = [0u8; ACK_FRAME_LEN];
    buf[0..4].copy_from_slice(&8u32.to_le_bytes());
    buf[4..12].copy_from_slice(&ack_seq.to_le_bytes());
    buf
}

/// 读取一个 ACK 帧；对端关闭时返回 `None`
pub fn read_ack<R: Read>(reader: &mut R) -> Result<Option<u64>> {
    let mut buf = [0u8; ACK_FRAME_LEN];
    let mut filled = 0;
    while filled < ACK_FRAME_LEN {
        let n = reader
            .read(&mut buf[filled..])
            .map_err(|e| KvError::Io(format!("read ack failed: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(KvError::Protocol("truncated ack frame".to_string()));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if len != 8 {
        return Err(KvError::Protocol(format!("bad ack frame length {}", len)));
    }
    Ok(Some(u64::from_le_bytes(buf[4..12].try_into().unwrap())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_handshake_round_trip() {
        let frame = encode_handshake(77);
        let id = read_handshake(&mut Cursor::new(frame)).unwrap();
        assert_eq!(id, 77);
    }

    #[test]
    fn test_handshake_bad_magic() {
        let mut frame = encode_handshake(1);
        frame[0] ^= 0xFF;
        let err = read_handshake(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, KvError::Protocol(_)));
    }

    #[test]
    fn test_handshake_bad_version() {
        let mut frame = encode_handshake(1);
        frame[8..12].copy_from_slice(&99u32.to_le_bytes());
        let err = read_handshake(&mut Cursor::new(frame)).unwrap_err();
        assert!(matches!(err, KvError::Protocol(_)));
    }

    #[test]
    fn test_ack_round_trip() {
        let frame = encode_ack(123456);
        let seq = read_ack(&mut Cursor::new(frame)).unwrap().unwrap();
        assert_eq!(seq, 123456);
    }

    #[test]
    fn test_ack_clean_eof() {
        let empty: Vec<u8> = Vec::new();
        assert!(read_ack(&mut Cursor::new(empty)).unwrap().is_none());
    }

    #[test]
    fn test_ack_truncated() {
        let frame = encode_ack(1);
        let err = read_ack(&mut Cursor::new(&frame[..5])).unwrap_err();
        assert!(matches!(err, KvError::Protocol(_)));
    }
}
