//! 标签数据模型
//!
//! 类型编码规则：
//! ```text
//! 基本类型: 0x000000XY
//!     X (高4位) = 变体 (有符号/无符号/字符/浮点/时间 ...)
//!     Y (低4位) = 宽度等级: 0=1bit, 3=8bit, 4=16bit, 5=32bit, 6=64bit
//! 复合类型: 0x8000_0000 | 服务端分配的编号
//! ```
//! 所有多字节标量均为小端。

use std::fmt;

/// 复合类型标志位
pub const CUSTOM_FLAG: u32 = 0x8000_0000;

/// 最后一个已分配的标签索引 (UDINT)
pub const TAG_LASTINDEX: &str = "_lastindex";
/// 标签创建事件标签，事件数据为新标签索引
pub const TAG_ADDED: &str = "_tag_added";
/// 标签删除事件标签，事件数据为被删除标签索引
pub const TAG_DELETED: &str = "_tag_deleted";

/// 标签索引
pub type TagIndex = u32;

/// 事件订阅 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u32);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// 类型标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const BOOL: TypeId = TypeId(0x10);
    pub const BYTE: TypeId = TypeId(0x03);
    pub const SINT: TypeId = TypeId(0x13);
    pub const CHAR: TypeId = TypeId(0x23);
    pub const WORD: TypeId = TypeId(0x04);
    pub const INT: TypeId = TypeId(0x14);
    pub const UINT: TypeId = TypeId(0x24);
    pub const DWORD: TypeId = TypeId(0x05);
    pub const DINT: TypeId = TypeId(0x15);
    pub const UDINT: TypeId = TypeId(0x25);
    pub const REAL: TypeId = TypeId(0x35);
    pub const LWORD: TypeId = TypeId(0x06);
    pub const LINT: TypeId = TypeId(0x16);
    pub const ULINT: TypeId = TypeId(0x26);
    pub const LREAL: TypeId = TypeId(0x36);
    pub const TIME: TypeId = TypeId(0x56);

    /// 构造复合类型 ID
    pub fn custom(number: u32) -> Self {
        TypeId(CUSTOM_FLAG | (number & !CUSTOM_FLAG))
    }

    pub fn is_custom(self) -> bool {
        self.0 & CUSTOM_FLAG != 0
    }

    /// 基本类型种类，复合类型或未知编码返回 None
    pub fn primitive(self) -> Option<PrimitiveKind> {
        PrimitiveKind::from_code(self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primitive() {
            Some(kind) => write!(f, "{}", kind.name()),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

/// 基本类型种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PrimitiveKind {
    Bool = 0x10,
    Byte = 0x03,
    Sint = 0x13,
    Char = 0x23,
    Word = 0x04,
    Int = 0x14,
    Uint = 0x24,
    Dword = 0x05,
    Dint = 0x15,
    Udint = 0x25,
    Real = 0x35,
    Lword = 0x06,
    Lint = 0x16,
    Ulint = 0x26,
    Lreal = 0x36,
    Time = 0x56,
}

impl PrimitiveKind {
    /// 按 listBuiltinTypes 的顺序排列
    pub const ALL: [PrimitiveKind; 16] = [
        PrimitiveKind::Bool,
        PrimitiveKind::Byte,
        PrimitiveKind::Sint,
        PrimitiveKind::Char,
        PrimitiveKind::Word,
        PrimitiveKind::Int,
        PrimitiveKind::Uint,
        PrimitiveKind::Dword,
        PrimitiveKind::Dint,
        PrimitiveKind::Udint,
        PrimitiveKind::Time,
        PrimitiveKind::Real,
        PrimitiveKind::Lword,
        PrimitiveKind::Lint,
        PrimitiveKind::Ulint,
        PrimitiveKind::Lreal,
    ];

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| *k as u32 == code)
    }

    pub fn type_id(self) -> TypeId {
        TypeId(self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            PrimitiveKind::Bool => "BOOL",
            PrimitiveKind::Byte => "BYTE",
            PrimitiveKind::Sint => "SINT",
            PrimitiveKind::Char => "CHAR",
            PrimitiveKind::Word => "WORD",
            PrimitiveKind::Int => "INT",
            PrimitiveKind::Uint => "UINT",
            PrimitiveKind::Dword => "DWORD",
            PrimitiveKind::Dint => "DINT",
            PrimitiveKind::Udint => "UDINT",
            PrimitiveKind::Real => "REAL",
            PrimitiveKind::Lword => "LWORD",
            PrimitiveKind::Lint => "LINT",
            PrimitiveKind::Ulint => "ULINT",
            PrimitiveKind::Lreal => "LREAL",
            PrimitiveKind::Time => "TIME",
        }
    }

    /// 位宽 (BOOL 为 1)
    pub fn bit_width(self) -> u32 {
        match (self as u32) & 0x0F {
            0 => 1,
            3 => 8,
            4 => 16,
            5 => 32,
            _ => 64,
        }
    }

    /// 字节宽度，BOOL 单独存放时占 1 字节
    pub fn byte_width(self) -> u32 {
        self.bit_width().div_ceil(8)
    }
}

/// 复合类型成员
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub ty: TypeId,
    /// 数组元素个数，>= 1
    pub count: u32,
}

impl Member {
    pub fn new(name: impl Into<String>, ty: TypeId, count: u32) -> Self {
        Self {
            name: name.into(),
            ty,
            count,
        }
    }
}

/// 标签定义（按索引或名称查询得到）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDef {
    pub index: TagIndex,
    pub name: String,
    pub ty: TypeId,
    pub count: u32,
    /// 属性位，见 [`TagDef::ATTR_READONLY`]
    pub attrs: u32,
}

impl TagDef {
    /// 只读标签
    pub const ATTR_READONLY: u32 = 0x0001;

    pub fn is_readonly(&self) -> bool {
        self.attrs & Self::ATTR_READONLY != 0
    }
}

/// 已解析的标签句柄
///
/// 由 `tag.member[3].sub` 形式的路径解析得到，获取后不可变。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagHandle {
    pub index: TagIndex,
    /// 相对标签数据起始的字节偏移
    pub byte: u32,
    /// 字节内位偏移 (仅 BOOL)
    pub bit: u8,
    /// 覆盖的字节数
    pub size: u32,
    pub ty: TypeId,
    pub count: u32,
}

/// 事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// 标签创建 (订阅 `_tag_added`)
    StructuralAdd,
    /// 标签删除 (订阅 `_tag_deleted`)
    StructuralDelete,
    /// 值变化
    ValueChanged,
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventClass::StructuralAdd => write!(f, "TAG_ADDED"),
            EventClass::StructuralDelete => write!(f, "TAG_DELETED"),
            EventClass::ValueChanged => write!(f, "CHANGE"),
        }
    }
}

/// 订阅选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    /// 事件触发时附带数据
    pub send_data: bool,
}
