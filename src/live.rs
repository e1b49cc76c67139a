//! 当前显示的标签集合
//!
//! 只在交互线程上使用：结构通知在这里变成子树的插入和删除，
//! `refresh` 把服务端数据读入各根缓冲区后重新解码全部节点。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::TypeCatalog;
use crate::client::{ClientError, Result, TagServerClient};
use crate::codec::ValueCodec;
use crate::events::Notification;
use crate::tree::{NodeId, NodeKind, TagTree, TagTreeBuilder};
use crate::types::{Member, TagHandle, TagIndex, TypeId, TAG_LASTINDEX};

/// 按名称或索引指定标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagRef<'a> {
    Name(&'a str),
    Index(TagIndex),
}

impl<'a> From<&'a str> for TagRef<'a> {
    fn from(name: &'a str) -> Self {
        TagRef::Name(name)
    }
}

impl From<TagIndex> for TagRef<'_> {
    fn from(index: TagIndex) -> Self {
        TagRef::Index(index)
    }
}

/// 活动标签集合
pub struct LiveTagSet {
    client: Arc<dyn TagServerClient>,
    catalog: TypeCatalog,
    codec: ValueCodec,
    tree: TagTree,
    writable: bool,
}

impl LiveTagSet {
    /// `writable` 为视图级编辑开关
    pub fn new(client: Arc<dyn TagServerClient>, writable: bool) -> Self {
        Self {
            catalog: TypeCatalog::new(client.clone()),
            codec: ValueCodec::new(client.clone()),
            client,
            tree: TagTree::new(),
            writable,
        }
    }

    pub fn tree(&self) -> &TagTree {
        &self.tree
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    pub fn codec(&self) -> &ValueCodec {
        &self.codec
    }

    /// 按 `_lastindex` 遍历全部索引，解析失败的跳过
    pub fn populate(&mut self) -> Result<usize> {
        let handle = self.client.resolve_handle(TAG_LASTINDEX)?;
        let mut buf = [0u8; 4];
        self.client.read_bytes(&handle, &mut buf)?;
        let last = u32::from_le_bytes(buf);

        let mut added = 0;
        for index in 0..=last {
            if self.tree.find_root(index).is_none() && self.on_structural_add(index).is_some() {
                added += 1;
            }
        }
        info!("live: populated {} tags (last index {})", added, last);
        Ok(added)
    }

    /// 新标签：解析并构建子树，解析失败时什么也不做
    pub fn on_structural_add(&mut self, index: TagIndex) -> Option<NodeId> {
        if let Some(existing) = self.tree.find_root(index) {
            return Some(existing);
        }
        let def = match self.client.tag_by_index(index) {
            Ok(def) => def,
            Err(e) => {
                debug!("live: tag {} not resolvable: {}", index, e);
                return None;
            }
        };
        let handle = match self.client.resolve_handle(&def.name) {
            Ok(h) => h,
            Err(e) => {
                debug!("live: no handle for {}: {}", def.name, e);
                return None;
            }
        };
        let root = match TagTreeBuilder::new(&self.catalog).build(
            &mut self.tree,
            &def,
            handle,
            self.writable,
        ) {
            Ok(root) => root,
            Err(e) => {
                warn!("live: cannot build {}: {}", def.name, e);
                return None;
            }
        };
        if let Err(e) = self.read_root(root) {
            debug!("live: initial read of {} failed: {}", def.name, e);
        }
        self.tree.refresh_values(root, &self.codec);
        info!("live: + {} (#{})", def.name, index);
        Some(root)
    }

    /// 标签删除：先读一次再移除整棵子树
    pub fn on_structural_delete(&mut self, index: TagIndex) -> bool {
        let root = match self.tree.find_root(index) {
            Some(r) => r,
            None => return false,
        };
        if let Err(e) = self.read_root(root) {
            debug!("live: final read of #{} failed: {}", index, e);
        }
        match self.tree.remove_root(root) {
            Some(node) => {
                info!("live: - {} (#{})", node.name, index);
                true
            }
            None => false,
        }
    }

    /// 处理一条通知，返回树是否变化
    pub fn apply(&mut self, notification: &Notification) -> bool {
        match notification {
            Notification::TagAdded(index) => {
                self.tree.find_root(*index).is_none() && self.on_structural_add(*index).is_some()
            }
            Notification::TagDeleted(index) => self.on_structural_delete(*index),
            Notification::ValueChanged { .. } => false,
            Notification::Closed(Some(e)) => {
                warn!("live: event pipeline closed: {}", e);
                false
            }
            Notification::Closed(None) => false,
        }
    }

    fn read_root(&mut self, root: NodeId) -> Result<()> {
        let handle = self
            .tree
            .root_handle(root)
            .ok_or_else(|| ClientError::NotFound("root node".into()))?;
        let buf = self
            .tree
            .buffer_mut(root)
            .ok_or_else(|| ClientError::NotFound("root buffer".into()))?;
        self.client.read_bytes(&handle, buf)
    }

    /// 读入所有根并重新解码，返回成功读取的根个数
    ///
    /// 单个标签读失败只记录日志；连接级错误直接返回。
    pub fn refresh(&mut self) -> Result<usize> {
        let roots: Vec<NodeId> = self.tree.roots().to_vec();
        let mut ok = 0;
        for root in roots {
            match self.read_root(root) {
                Ok(()) => ok += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let name = self.tree.get(root).map(|n| n.name.clone()).unwrap_or_default();
                    warn!("live: read of {} failed: {}", name, e);
                }
            }
            self.tree.refresh_values(root, &self.codec);
        }
        Ok(ok)
    }

    /// 编辑一个节点的值：编码、写入、回读、重新解码
    ///
    /// 回读假设服务端写入立即可见。
    pub fn write_value(&mut self, id: NodeId, text: &str) -> Result<()> {
        let node = self
            .tree
            .get(id)
            .ok_or_else(|| ClientError::NotFound("stale tree node".into()))?;
        let addr = node.addr;
        let name = node.name.clone();
        let writable = node.writable;

        let root = self
            .tree
            .root_of(id)
            .ok_or_else(|| ClientError::NotFound(name.clone()))?;
        let (root_handle, readonly) = match self.tree.get(root).map(|n| &n.kind) {
            Some(NodeKind::Root {
                handle, readonly, ..
            }) => (*handle, *readonly),
            _ => return Err(ClientError::NotFound(name)),
        };

        if readonly {
            return Err(ClientError::ReadOnly(name));
        }
        if !addr.is_scalar() {
            return Err(ClientError::NotSupported(format!(
                "{} is not a single value",
                name
            )));
        }
        if !writable {
            return Err(ClientError::ReadOnly(name));
        }

        let raw = self.codec.encode(text, addr.ty, addr.count)?;
        let mut leaf = TagHandle {
            index: root_handle.index,
            byte: root_handle.byte + addr.byte,
            bit: addr.bit,
            size: raw.len() as u32,
            ty: addr.ty,
            count: addr.count,
        };
        if addr.ty == TypeId::BOOL {
            leaf.size = 1;
            let data = [(raw.first().copied().unwrap_or(0) & 1) << addr.bit];
            let mask = [1u8 << addr.bit];
            self.client.write_bytes(&leaf, &data, Some(&mask))?;
        } else {
            self.client.write_bytes(&leaf, &raw, None)?;
        }
        debug!("live: {} <- {}", name, text);

        self.read_root(root)?;
        self.tree.refresh_values(root, &self.codec);
        Ok(())
    }

    /// 在服务端创建标签，树在收到结构通知后才更新
    pub fn add_tag(&self, name: &str, ty: TypeId, count: u32) -> Result<TagHandle> {
        if count == 0 {
            return Err(ClientError::TypeMismatch(format!(
                "{}: count must be >= 1",
                name
            )));
        }
        self.client.add_tag(name, ty, count, 0)
    }

    pub fn delete_tag<'a>(&self, tag: impl Into<TagRef<'a>>) -> Result<()> {
        match tag.into() {
            TagRef::Name(name) => crate::client::delete_tag_by_name(self.client.as_ref(), name),
            TagRef::Index(index) => self.client.delete_tag(index),
        }
    }

    pub fn add_type(&self, name: &str, members: &[Member]) -> Result<TypeId> {
        if members.is_empty() {
            return Err(ClientError::TypeMismatch(format!(
                "type {} needs at least one member",
                name
            )));
        }
        if let Some(m) = members.iter().find(|m| m.count == 0) {
            return Err(ClientError::TypeMismatch(format!(
                "{}.{}: count must be >= 1",
                name, m.name
            )));
        }
        self.client.add_type(name, members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryServer;

    fn setup() -> (Arc<MemoryServer>, LiveTagSet) {
        let server = Arc::new(MemoryServer::connected());
        let live = LiveTagSet::new(server.clone(), true);
        (server, live)
    }

    fn value_of(live: &LiveTagSet, name: &str) -> Option<String> {
        let id = live.tree().find_by_name(name)?;
        live.tree().get(id)?.value.clone()
    }

    #[test]
    fn test_populate_skips_deleted() {
        let (server, mut live) = setup();
        let a = server.add_tag("A", TypeId::INT, 1, 0).unwrap();
        server.add_tag("B", TypeId::REAL, 1, 0).unwrap();
        server.delete_tag(a.index).unwrap();

        // 3 个系统标签 + B
        assert_eq!(live.populate().unwrap(), 4);
        assert!(live.tree().find_by_name("A").is_none());
        assert!(live.tree().find_by_name("B").is_some());
        assert_eq!(live.populate().unwrap(), 0);
    }

    #[test]
    fn test_add_unknown_index_is_noop() {
        let (_server, mut live) = setup();
        assert!(live.on_structural_add(42).is_none());
        assert!(live.tree().is_empty());
        assert!(!live.on_structural_delete(42));
    }

    #[test]
    fn test_duplicate_tag_added_reports_no_change() {
        let (server, mut live) = setup();
        let h = server.add_tag("Once", TypeId::DINT, 1, 0).unwrap();
        assert!(live.apply(&Notification::TagAdded(h.index)));
        let nodes = live.tree().len();
        assert!(!live.apply(&Notification::TagAdded(h.index)));
        assert_eq!(live.tree().len(), nodes);
    }

    #[test]
    fn test_refresh_decodes_values() {
        let (server, mut live) = setup();
        server.add_tag("Temp", TypeId::REAL, 1, 0).unwrap();
        server.add_tag("Name", TypeId::CHAR, 6, 0).unwrap();
        live.populate().unwrap();

        server.set_value("Temp", "21.5").unwrap();
        server.set_value("Name", "pump").unwrap();
        assert_eq!(live.refresh().unwrap(), 5);
        assert_eq!(value_of(&live, "Temp").as_deref(), Some("21.5"));
        assert_eq!(value_of(&live, "Name").as_deref(), Some("pump"));
        assert_eq!(value_of(&live, "Name[1]").as_deref(), Some("u"));
    }

    #[test]
    fn test_write_bool_in_packed_array() {
        let (server, mut live) = setup();
        server.add_tag("Bits", TypeId::BOOL, 10, 0).unwrap();
        live.populate().unwrap();

        let b9 = live.tree().find_by_name("Bits[9]").unwrap();
        live.write_value(b9, "true").unwrap();
        let b2 = live.tree().find_by_name("Bits[2]").unwrap();
        live.write_value(b2, "1").unwrap();

        let h = server.resolve_handle("Bits").unwrap();
        let mut buf = [0u8; 2];
        server.read_bytes(&h, &mut buf).unwrap();
        assert_eq!(buf, [0b0000_0100, 0b0000_0010]);
        assert_eq!(value_of(&live, "Bits[9]").as_deref(), Some("true"));
        assert_eq!(value_of(&live, "Bits[8]").as_deref(), Some("false"));
    }

    #[test]
    fn test_write_member_of_compound() {
        let (server, mut live) = setup();
        let ty = server
            .add_type(
                "Valve",
                &[
                    Member::new("Open", TypeId::BOOL, 1),
                    Member::new("Flow", TypeId::DINT, 1),
                ],
            )
            .unwrap();
        server.add_tag("V1", ty, 1, 0).unwrap();
        live.populate().unwrap();

        let flow = live.tree().find_by_name("V1.Flow").unwrap();
        live.write_value(flow, "-250").unwrap();
        assert_eq!(value_of(&live, "V1.Flow").as_deref(), Some("-250"));
        assert_eq!(value_of(&live, "V1.Open").as_deref(), Some("false"));

        let root = live.tree().find_by_name("V1").unwrap();
        assert!(matches!(
            live.write_value(root, "1"),
            Err(ClientError::NotSupported(_))
        ));
    }

    #[test]
    fn test_write_rejects_readonly() {
        let (server, mut live) = setup();
        server
            .add_tag("Fixed", TypeId::INT, 1, crate::types::TagDef::ATTR_READONLY)
            .unwrap();
        live.populate().unwrap();
        let id = live.tree().find_by_name("Fixed").unwrap();
        assert!(matches!(
            live.write_value(id, "1"),
            Err(ClientError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_view_not_writable() {
        let server = Arc::new(MemoryServer::connected());
        server.add_tag("X", TypeId::INT, 1, 0).unwrap();
        let mut live = LiveTagSet::new(server.clone(), false);
        live.populate().unwrap();
        let id = live.tree().find_by_name("X").unwrap();
        assert!(matches!(
            live.write_value(id, "1"),
            Err(ClientError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_write_after_server_delete_is_stale() {
        let (server, mut live) = setup();
        let h = server.add_tag("Gone", TypeId::INT, 1, 0).unwrap();
        live.populate().unwrap();
        let id = live.tree().find_by_name("Gone").unwrap();
        server.delete_tag(h.index).unwrap();
        assert_eq!(
            live.write_value(id, "5"),
            Err(ClientError::StaleHandle(h.index))
        );
        assert!(live.on_structural_delete(h.index));
        assert!(live.tree().get(id).is_none());
    }

    #[test]
    fn test_structural_actions() {
        let (server, live) = setup();
        assert!(live.add_type("Empty", &[]).is_err());
        assert!(live
            .add_type("ZeroCount", &[Member::new("a", TypeId::INT, 0)])
            .is_err());
        let ty = live
            .add_type("Pair", &[Member::new("a", TypeId::INT, 1)])
            .unwrap();
        let h = live.add_tag("P", ty, 2).unwrap();
        assert!(live.add_tag("Q", TypeId::INT, 0).is_err());
        live.delete_tag("P").unwrap();
        assert!(server.tag_by_index(h.index).is_err());
        assert!(live.delete_tag(h.index).is_err());
    }
}
