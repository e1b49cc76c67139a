//! 标量与文本的规范转换
//!
//! 这是服务端 `scalarToString` / `stringToScalar` 约定的参考实现，
//! 内存服务端直接使用。格式：
//! - 整数：十进制；解析时也接受 `0x` 十六进制
//! - REAL/LREAL：最短可回读表示
//! - BOOL：`true` / `false`；解析时也接受 `1` / `0`
//! - CHAR：单个字符，NUL 显示为空串
//! - TIME：64 位毫秒数

use bytes::Bytes;

use crate::client::{ClientError, Result};
use crate::types::{PrimitiveKind, TypeId};

/// 把 `bytes` 中第 `index` 个元素转为字符串
pub fn to_string(ty: TypeId, bytes: &[u8], index: usize) -> Result<String> {
    let kind = ty.primitive().ok_or(ClientError::UnknownType(ty))?;

    if kind == PrimitiveKind::Bool {
        let byte = index / 8;
        let bit = index % 8;
        let b = *bytes
            .get(byte)
            .ok_or_else(|| ClientError::Io(format!("bool index {} out of range", index)))?;
        return Ok(if (b >> bit) & 1 == 1 { "true" } else { "false" }.to_string());
    }

    let width = kind.byte_width() as usize;
    let start = index * width;
    let raw = bytes.get(start..start + width).ok_or_else(|| {
        ClientError::Io(format!(
            "{} element {} needs {} bytes, buffer has {}",
            kind.name(),
            index,
            start + width,
            bytes.len()
        ))
    })?;

    let s = match kind {
        PrimitiveKind::Bool => unreachable!(),
        PrimitiveKind::Byte => raw[0].to_string(),
        PrimitiveKind::Sint => (raw[0] as i8).to_string(),
        PrimitiveKind::Char => {
            if raw[0] == 0 {
                String::new()
            } else {
                (raw[0] as char).to_string()
            }
        }
        PrimitiveKind::Word | PrimitiveKind::Uint => {
            u16::from_le_bytes([raw[0], raw[1]]).to_string()
        }
        PrimitiveKind::Int => i16::from_le_bytes([raw[0], raw[1]]).to_string(),
        PrimitiveKind::Dword | PrimitiveKind::Udint => {
            u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string()
        }
        PrimitiveKind::Dint => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string(),
        PrimitiveKind::Real => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string(),
        PrimitiveKind::Lword | PrimitiveKind::Ulint => u64::from_le_bytes(eight(raw)).to_string(),
        PrimitiveKind::Lint | PrimitiveKind::Time => i64::from_le_bytes(eight(raw)).to_string(),
        PrimitiveKind::Lreal => f64::from_le_bytes(eight(raw)).to_string(),
    };
    Ok(s)
}

fn eight(raw: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&raw[..8]);
    out
}

/// 把字符串转为单个元素的小端字节
///
/// BOOL 返回 1 字节，值位于 `index % 8` 位，调用方按掩码写入。
pub fn from_string(text: &str, ty: TypeId, index: usize) -> Result<Bytes> {
    let kind = ty.primitive().ok_or(ClientError::UnknownType(ty))?;
    let t = text.trim();
    let err = || ClientError::Parse {
        text: text.to_string(),
        ty,
    };

    let bytes: Vec<u8> = match kind {
        PrimitiveKind::Bool => {
            let v = match t.to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => return Err(err()),
            };
            vec![(v as u8) << (index % 8)]
        }
        PrimitiveKind::Char => {
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (None, _) => vec![0],
                (Some(c), None) if c.is_ascii() => vec![c as u8],
                _ => return Err(err()),
            }
        }
        PrimitiveKind::Byte => {
            let v = parse_unsigned(t).and_then(|v| u8::try_from(v).ok()).ok_or_else(err)?;
            vec![v]
        }
        PrimitiveKind::Sint => {
            let v = parse_signed(t).and_then(|v| i8::try_from(v).ok()).ok_or_else(err)?;
            v.to_le_bytes().to_vec()
        }
        PrimitiveKind::Word | PrimitiveKind::Uint => {
            let v = parse_unsigned(t).and_then(|v| u16::try_from(v).ok()).ok_or_else(err)?;
            v.to_le_bytes().to_vec()
        }
        PrimitiveKind::Int => {
            let v = parse_signed(t).and_then(|v| i16::try_from(v).ok()).ok_or_else(err)?;
            v.to_le_bytes().to_vec()
        }
        PrimitiveKind::Dword | PrimitiveKind::Udint => {
            let v = parse_unsigned(t).and_then(|v| u32::try_from(v).ok()).ok_or_else(err)?;
            v.to_le_bytes().to_vec()
        }
        PrimitiveKind::Dint => {
            let v = parse_signed(t).and_then(|v| i32::try_from(v).ok()).ok_or_else(err)?;
            v.to_le_bytes().to_vec()
        }
        PrimitiveKind::Lword | PrimitiveKind::Ulint => {
            parse_unsigned(t).ok_or_else(err)?.to_le_bytes().to_vec()
        }
        PrimitiveKind::Lint | PrimitiveKind::Time => {
            parse_signed(t).ok_or_else(err)?.to_le_bytes().to_vec()
        }
        PrimitiveKind::Real => t.parse::<f32>().map_err(|_| err())?.to_le_bytes().to_vec(),
        PrimitiveKind::Lreal => t.parse::<f64>().map_err(|_| err())?.to_le_bytes().to_vec(),
    };
    Ok(Bytes::from(bytes))
}

fn parse_unsigned(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<u64>().ok()
    }
}

fn parse_signed(s: &str) -> Option<i64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        s.parse::<i64>().ok()
    }
}
