//! 值编解码
//!
//! 在共享缓冲区上按 {字节偏移, 位偏移, 类型, 个数} 取出或写入单个标量。
//! 数值格式由服务端约定决定，这里只处理 BOOL 位和 CHAR 数组字符串。

use std::sync::Arc;

use bytes::Bytes;

use crate::client::{ClientError, Result, TagServerClient};
use crate::types::{PrimitiveKind, TypeId};

/// 叶子在根缓冲区中的地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafAddress {
    pub byte: u32,
    pub bit: u8,
    pub ty: TypeId,
    pub count: u32,
}

impl LeafAddress {
    pub fn new(byte: u32, bit: u8, ty: TypeId, count: u32) -> Self {
        Self {
            byte,
            bit,
            ty,
            count,
        }
    }

    /// 从绝对位地址构造
    pub fn from_bits(bit_addr: u32, ty: TypeId, count: u32) -> Self {
        Self::new(bit_addr / 8, (bit_addr % 8) as u8, ty, count)
    }

    pub fn bit_addr(&self) -> u32 {
        self.byte * 8 + self.bit as u32
    }

    /// CHAR 数组作为一个字符串显示
    pub fn is_string(&self) -> bool {
        self.count > 1 && self.ty == TypeId::CHAR
    }

    /// 单个标量或 CHAR 数组才可编辑
    pub fn is_scalar(&self) -> bool {
        !self.ty.is_custom() && (self.count <= 1 || self.ty == TypeId::CHAR)
    }
}

/// 值编解码器
pub struct ValueCodec {
    client: Arc<dyn TagServerClient>,
}

impl ValueCodec {
    pub fn new(client: Arc<dyn TagServerClient>) -> Self {
        Self { client }
    }

    /// 解码显示值
    ///
    /// 复合类型和非 CHAR 数组没有自己的值，返回 `Ok(None)`。
    pub fn decode(
        &self,
        buf: &[u8],
        addr: &LeafAddress,
        element_index: usize,
    ) -> Result<Option<String>> {
        if addr.is_string() {
            return decode_string(buf, addr.byte as usize, addr.count as usize).map(Some);
        }
        if !addr.is_scalar() {
            return Ok(None);
        }
        if addr.ty == TypeId::BOOL {
            let bit_addr = addr.bit_addr() as usize + element_index;
            return decode_bool(buf, bit_addr / 8, (bit_addr % 8) as u8).map(Some);
        }

        let start = addr.byte as usize;
        let tail = buf.get(start..).ok_or_else(|| {
            ClientError::Io(format!("offset {} beyond buffer of {}", start, buf.len()))
        })?;
        self.client
            .scalar_to_string(addr.ty, tail, element_index)
            .map(Some)
    }

    /// 编码编辑值
    ///
    /// BOOL 返回单字节 0/1（最低位），调用方负责移位和掩码；
    /// CHAR 数组返回 `count` 字节，不足补 0。
    pub fn encode(&self, text: &str, ty: TypeId, count: u32) -> Result<Bytes> {
        if ty.is_custom() {
            return Err(ClientError::NotSupported(format!(
                "cannot write compound type {}",
                ty
            )));
        }
        if count > 1 {
            if ty != TypeId::CHAR {
                return Err(ClientError::NotSupported(format!(
                    "cannot write {}[{}] as a single value",
                    ty, count
                )));
            }
            return encode_string(text, count as usize);
        }
        self.client.string_to_scalar(text, ty, 0)
    }
}

/// 读取 `byte` 处第 `bit` 位
pub fn decode_bool(buf: &[u8], byte: usize, bit: u8) -> Result<String> {
    let b = buf
        .get(byte)
        .ok_or_else(|| ClientError::Io(format!("bool at byte {} beyond buffer", byte)))?;
    Ok(if b & (1u8 << bit) != 0 { "true" } else { "false" }.to_string())
}

/// CHAR 数组转字符串，遇到 NUL 截止
pub fn decode_string(buf: &[u8], start: usize, count: usize) -> Result<String> {
    let raw = buf.get(start..start + count).ok_or_else(|| {
        ClientError::Io(format!(
            "string [{}..{}] beyond buffer of {}",
            start,
            start + count,
            buf.len()
        ))
    })?;
    Ok(raw
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect())
}

/// 字符串转 CHAR 数组
pub fn encode_string(text: &str, count: usize) -> Result<Bytes> {
    if !text.is_ascii() {
        return Err(ClientError::Parse {
            text: text.to_string(),
            ty: PrimitiveKind::Char.type_id(),
        });
    }
    if text.len() > count {
        return Err(ClientError::TypeMismatch(format!(
            "string of {} chars does not fit CHAR[{}]",
            text.len(),
            count
        )));
    }
    let mut out = vec![0u8; count];
    out[..text.len()].copy_from_slice(text.as_bytes());
    Ok(Bytes::from(out))
}
