//! 标签服务客户端接口
//!
//! 服务端本身是黑盒，这里只定义查看器核心需要的能力集合。
//! 所有组件都显式持有 `Arc<dyn TagServerClient>`，测试时换成内存实现即可。

use bytes::Bytes;
use thiserror::Error;

use crate::types::{
    EventClass, Member, SubscriptionId, SubscriptionOptions, TagDef, TagHandle, TagIndex, TypeId,
};

/// 客户端错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("not connected")]
    NotConnected,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown type: {0}")]
    UnknownType(TypeId),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("read only: {0}")]
    ReadOnly(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("cannot convert '{text}' to {ty}")]
    Parse { text: String, ty: TypeId },
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("stale handle for tag {0}")]
    StaleHandle(TagIndex),
}

impl ClientError {
    /// 会话级致命错误：所有订阅和缓冲区都需要拆除
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Connection(_) | ClientError::NotConnected)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// 标签服务客户端
///
/// 实现必须可跨线程共享：事件线程与交互线程使用同一个连接。
/// `wait_event` 只应由事件线程调用，`fetch_payload` 返回该线程最近一次
/// 收到事件的附带数据。
pub trait TagServerClient: Send + Sync {
    fn connect(&self) -> Result<()>;
    fn disconnect(&self) -> Result<()>;
    fn is_connected(&self) -> bool;

    /// 按索引查询标签定义
    fn tag_by_index(&self, index: TagIndex) -> Result<TagDef>;
    /// 按名称查询标签定义
    fn tag_by_name(&self, name: &str) -> Result<TagDef>;
    /// 解析 `tag.member[3].sub` 形式的路径
    fn resolve_handle(&self, path: &str) -> Result<TagHandle>;

    /// 读取句柄覆盖的字节，`buf` 长度至少为 `handle.size`
    fn read_bytes(&self, handle: &TagHandle, buf: &mut [u8]) -> Result<()>;
    /// 写入字节；`mask` 存在时只写入掩码为 1 的位
    fn write_bytes(&self, handle: &TagHandle, data: &[u8], mask: Option<&[u8]>) -> Result<()>;

    /// 复合类型成员（按声明顺序）
    fn list_members(&self, ty: TypeId) -> Result<Vec<Member>>;
    /// 全部类型 (名称, ID)：先基本类型，后复合类型
    fn list_builtin_types(&self) -> Vec<(String, TypeId)>;
    /// 类型名称
    fn type_name(&self, ty: TypeId) -> Result<String>;

    fn add_tag(&self, name: &str, ty: TypeId, count: u32, attrs: u32) -> Result<TagHandle>;
    fn delete_tag(&self, index: TagIndex) -> Result<()>;
    fn add_type(&self, name: &str, members: &[Member]) -> Result<TypeId>;

    fn subscribe(
        &self,
        handle: &TagHandle,
        class: EventClass,
        deliver_payload: bool,
    ) -> Result<SubscriptionId>;
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
    fn set_subscription_options(&self, id: SubscriptionId, opts: SubscriptionOptions)
        -> Result<()>;

    /// 阻塞等待下一个事件，超时返回 `Ok(None)`
    fn wait_event(&self, timeout_ms: u64) -> Result<Option<SubscriptionId>>;
    /// 非阻塞查询
    fn poll_event(&self) -> Option<SubscriptionId>;
    /// 取最近一次事件的附带数据，返回实际复制的字节数
    fn fetch_payload(&self, buf: &mut [u8]) -> Result<usize>;

    /// 服务端规范的标量转字符串
    fn scalar_to_string(&self, ty: TypeId, bytes: &[u8], index: usize) -> Result<String>;
    /// 服务端规范的字符串转标量
    fn string_to_scalar(&self, text: &str, ty: TypeId, index: usize) -> Result<Bytes>;
}

/// 按名称删除标签
pub fn delete_tag_by_name(client: &dyn TagServerClient, name: &str) -> Result<()> {
    let tag = client.tag_by_name(name)?;
    client.delete_tag(tag.index)
}

/// 按路径写入文本值
///
/// BOOL 只改对应的一位；CHAR 数组按字符串写入；其它数组不支持。
pub fn write_text(client: &dyn TagServerClient, path: &str, text: &str) -> Result<()> {
    let handle = client.resolve_handle(path)?;
    if handle.ty.is_custom() {
        return Err(ClientError::NotSupported(format!("{} is a compound value", path)));
    }
    if handle.count > 1 {
        if handle.ty != TypeId::CHAR {
            return Err(ClientError::NotSupported(format!("{} is an array", path)));
        }
        let data = crate::codec::encode_string(text, handle.count as usize)?;
        return client.write_bytes(&handle, &data, None);
    }
    if handle.ty == TypeId::BOOL {
        let data = client.string_to_scalar(text, handle.ty, handle.bit as usize)?;
        let mask = [1u8 << handle.bit];
        return client.write_bytes(&handle, &data, Some(&mask));
    }
    let data = client.string_to_scalar(text, handle.ty, 0)?;
    client.write_bytes(&handle, &data, None)
}
