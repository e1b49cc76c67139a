//! 类型目录
//!
//! 把类型 ID 解析为基本类型信息或按声明顺序排列的成员列表，
//! 并计算复合类型的成员布局（位偏移）。
//!
//! 布局规则：
//! ```text
//! 位游标从 0 开始，按声明顺序处理成员：
//!   BOOL 成员:   占用 count 个连续位，不对齐
//!   其它成员:    先把游标对齐到下一个字节边界，再占用 size * count 字节
//! 总大小向上取整到字节
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::client::{ClientError, Result, TagServerClient};
use crate::types::{Member, PrimitiveKind, TypeId};

/// 带位置的成员
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberLayout {
    pub member: Member,
    /// 相对复合类型起始的位偏移
    pub bit_offset: u32,
}

impl MemberLayout {
    pub fn byte_offset(&self) -> u32 {
        self.bit_offset / 8
    }

    pub fn bit_in_byte(&self) -> u8 {
        (self.bit_offset % 8) as u8
    }
}

/// 类型描述
#[derive(Debug, Clone, PartialEq)]
pub enum TypeInfo {
    Primitive {
        kind: PrimitiveKind,
        byte_width: u32,
        name: String,
    },
    Compound {
        name: String,
        members: Vec<MemberLayout>,
        byte_size: u32,
    },
}

impl TypeInfo {
    pub fn name(&self) -> &str {
        match self {
            TypeInfo::Primitive { name, .. } | TypeInfo::Compound { name, .. } => name,
        }
    }
}

/// 按布局规则计算成员位偏移，返回 (各成员位偏移, 总字节数)
///
/// `size_of` 返回非 BOOL 类型单个元素的字节数。
pub fn pack_members<F>(members: &[Member], mut size_of: F) -> Result<(Vec<u32>, u32)>
where
    F: FnMut(TypeId) -> Result<u32>,
{
    let mut cursor = 0u32;
    let mut offsets = Vec::with_capacity(members.len());
    for m in members {
        if m.ty == TypeId::BOOL {
            offsets.push(cursor);
            cursor += m.count;
        } else {
            cursor = cursor.div_ceil(8) * 8;
            offsets.push(cursor);
            cursor += size_of(m.ty)? * 8 * m.count;
        }
    }
    Ok((offsets, cursor.div_ceil(8)))
}

/// 类型目录
///
/// 复合类型一旦创建成员就不会变化，所以解析结果可以一直缓存。
pub struct TypeCatalog {
    client: Arc<dyn TagServerClient>,
    cache: Mutex<HashMap<TypeId, Arc<TypeInfo>>>,
}

impl TypeCatalog {
    pub fn new(client: Arc<dyn TagServerClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 解析类型
    pub fn resolve(&self, ty: TypeId) -> Result<Arc<TypeInfo>> {
        if let Some(info) = self.cached(ty) {
            return Ok(info);
        }

        let info = if let Some(kind) = ty.primitive() {
            TypeInfo::Primitive {
                kind,
                byte_width: kind.byte_width(),
                name: kind.name().to_string(),
            }
        } else if ty.is_custom() {
            let name = self
                .client
                .type_name(ty)
                .map_err(|_| ClientError::UnknownType(ty))?;
            let members = self
                .client
                .list_members(ty)
                .map_err(|_| ClientError::UnknownType(ty))?;
            let (offsets, byte_size) = pack_members(&members, |t| self.element_size(t))?;
            debug!("tree: type {} resolved, {} members, {} bytes", name, members.len(), byte_size);
            TypeInfo::Compound {
                name,
                members: members
                    .into_iter()
                    .zip(offsets)
                    .map(|(member, bit_offset)| MemberLayout { member, bit_offset })
                    .collect(),
                byte_size,
            }
        } else {
            return Err(ClientError::UnknownType(ty));
        };

        let info = Arc::new(info);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(ty, info.clone());
        }
        Ok(info)
    }

    fn cached(&self, ty: TypeId) -> Option<Arc<TypeInfo>> {
        self.cache.lock().ok().and_then(|c| c.get(&ty).cloned())
    }

    pub fn is_compound(&self, ty: TypeId) -> bool {
        ty.is_custom()
    }

    /// 单个元素字节数 (BOOL 单独存放时为 1)
    pub fn element_size(&self, ty: TypeId) -> Result<u32> {
        match &*self.resolve(ty)? {
            TypeInfo::Primitive { byte_width, .. } => Ok(*byte_width),
            TypeInfo::Compound { byte_size, .. } => Ok(*byte_size),
        }
    }

    /// `count` 个元素的总字节数，BOOL 数组按位打包
    pub fn byte_size(&self, ty: TypeId, count: u32) -> Result<u32> {
        if ty == TypeId::BOOL {
            return Ok(count.max(1).div_ceil(8));
        }
        Ok(self.element_size(ty)? * count.max(1))
    }

    /// 单个元素占用的位数，用于计算数组元素地址
    pub fn element_bits(&self, ty: TypeId) -> Result<u32> {
        if ty == TypeId::BOOL {
            return Ok(1);
        }
        Ok(self.element_size(ty)? * 8)
    }

    /// 显示用类型名，count > 1 时追加 `[count]`
    ///
    /// 仅用于展示，不能再解析回类型。
    pub fn display_name(&self, ty: TypeId, count: u32) -> String {
        let base = match self.resolve(ty) {
            Ok(info) => info.name().to_string(),
            Err(_) => ty.to_string(),
        };
        if count > 1 {
            format!("{}[{}]", base, count)
        } else {
            base
        }
    }

    /// 复合类型的成员布局
    pub fn members(&self, ty: TypeId) -> Result<Vec<MemberLayout>> {
        match &*self.resolve(ty)? {
            TypeInfo::Compound { members, .. } => Ok(members.clone()),
            TypeInfo::Primitive { .. } => Err(ClientError::TypeMismatch(format!(
                "{} is not a compound type",
                ty
            ))),
        }
    }

    /// 全部可用类型 (名称, ID)
    pub fn builtin_types(&self) -> Vec<(String, TypeId)> {
        self.client.list_builtin_types()
    }

    /// 按类型名查找 ID（大小写不敏感）
    pub fn type_from_name(&self, name: &str) -> Result<TypeId> {
        self.builtin_types()
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, t)| t)
            .ok_or_else(|| ClientError::NotFound(format!("type {}", name)))
    }
}
