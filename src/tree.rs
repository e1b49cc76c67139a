//! 标签树
//!
//! 节点存放在一个 arena 中，父子关系用 [`NodeId`] 表示，不存在拥有型的环。
//! 每个根节点持有整条标签的共享缓冲区，所有子孙节点只记录自己在该缓冲区中的地址。
//!
//! 展开规则（先序，声明顺序）：
//! ```text
//! count > 1       -> count 个子节点 name[0..count-1]，元素为复合类型时继续展开
//! 复合类型        -> 每个成员一个子节点 name.member，成员为数组或复合类型时继续展开
//! 其它            -> 叶子，无子节点
//! ```

use tracing::{debug, warn};

use crate::catalog::TypeCatalog;
use crate::client::{ClientError, Result};
use crate::codec::{LeafAddress, ValueCodec};
use crate::types::{TagDef, TagHandle, TagIndex, TypeId};

/// 节点 ID：槽位 + 代数，槽位复用后旧 ID 自动失效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    slot: u32,
    generation: u32,
}

/// 节点种类
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// 顶层标签，持有共享缓冲区
    Root {
        handle: TagHandle,
        readonly: bool,
        buffer: Vec<u8>,
    },
    /// 数组元素 `name[index]`
    ArrayElement { index: u32 },
    /// 复合类型成员 `name.member`
    CompoundMember { member: String },
}

/// 树节点
#[derive(Debug, Clone)]
pub struct TagNode {
    /// 完整路径，如 `Motor1.Speed`、`Arr[3].x`
    pub name: String,
    /// 显示用类型名
    pub type_label: String,
    pub kind: NodeKind,
    pub addr: LeafAddress,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub writable: bool,
    /// 最近一次刷新得到的显示值
    pub value: Option<String>,
}

impl TagNode {
    pub fn is_root(&self) -> bool {
        matches!(self.kind, NodeKind::Root { .. })
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

struct Slot {
    generation: u32,
    node: Option<TagNode>,
}

/// 节点 arena
#[derive(Default)]
pub struct TagTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: Vec<NodeId>,
}

impl TagTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, node: TagNode) -> NodeId {
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.generation = s.generation.wrapping_add(1);
            s.node = Some(node);
            NodeId {
                slot,
                generation: s.generation,
            }
        } else {
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                slot: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&TagNode> {
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TagNode> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
    }

    fn add_child(&mut self, parent: NodeId, mut node: TagNode) -> NodeId {
        node.parent = Some(parent);
        let id = self.alloc(node);
        if let Some(p) = self.get_mut(parent) {
            p.children.push(id);
        }
        id
    }

    /// 顶层节点（插入顺序）
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// 活动节点总数
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// 按标签索引查找根
    pub fn find_root(&self, index: TagIndex) -> Option<NodeId> {
        self.roots.iter().copied().find(|id| {
            matches!(
                self.get(*id).map(|n| &n.kind),
                Some(NodeKind::Root { handle, .. }) if handle.index == index
            )
        })
    }

    /// 按完整路径查找节点
    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.roots
            .iter()
            .flat_map(|r| self.subtree(*r))
            .find(|id| self.get(*id).map(|n| n.name == name).unwrap_or(false))
    }

    /// 沿父链找到根
    pub fn root_of(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = id;
        loop {
            let node = self.get(cur)?;
            match node.parent {
                Some(p) => cur = p,
                None => return Some(cur),
            }
        }
    }

    /// 先序遍历子树
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.get(cur) {
                out.push(cur);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// 根节点的共享缓冲区
    pub fn buffer(&self, root: NodeId) -> Option<&[u8]> {
        match self.get(root).map(|n| &n.kind) {
            Some(NodeKind::Root { buffer, .. }) => Some(buffer.as_slice()),
            _ => None,
        }
    }

    pub fn buffer_mut(&mut self, root: NodeId) -> Option<&mut Vec<u8>> {
        match self.get_mut(root).map(|n| &mut n.kind) {
            Some(NodeKind::Root { buffer, .. }) => Some(buffer),
            _ => None,
        }
    }

    /// 根节点句柄
    pub fn root_handle(&self, root: NodeId) -> Option<TagHandle> {
        match self.get(root).map(|n| &n.kind) {
            Some(NodeKind::Root { handle, .. }) => Some(*handle),
            _ => None,
        }
    }

    /// 移除根及其整棵子树，缓冲区随根一起释放
    pub fn remove_root(&mut self, root: NodeId) -> Option<TagNode> {
        let pos = self.roots.iter().position(|r| *r == root)?;
        self.roots.remove(pos);

        let ids = self.subtree(root);
        let mut removed = None;
        for id in ids {
            let slot = &mut self.slots[id.slot as usize];
            let node = slot.node.take();
            self.free.push(id.slot);
            if id == root {
                removed = node;
            }
        }
        removed
    }

    /// 重新计算子树所有节点的显示值，O(节点数)
    pub fn refresh_values(&mut self, root: NodeId, codec: &ValueCodec) {
        let ids = self.subtree(root);
        let buffer = match self.buffer(root) {
            Some(b) => b.to_vec(),
            None => return,
        };
        for id in ids {
            let addr = match self.get(id) {
                Some(n) => n.addr,
                None => continue,
            };
            let value = match codec.decode(&buffer, &addr, 0) {
                Ok(v) => v,
                Err(e) => {
                    debug!("tree: decode failed: {}", e);
                    None
                }
            };
            if let Some(n) = self.get_mut(id) {
                n.value = value;
            }
        }
    }

    /// 子树形状：(深度, 名称, 类型, 字节, 位)
    pub fn shape(&self, root: NodeId) -> Vec<(usize, String, String, u32, u8)> {
        let mut out = Vec::new();
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            if let Some(n) = self.get(id) {
                out.push((depth, n.name.clone(), n.type_label.clone(), n.addr.byte, n.addr.bit));
                for c in n.children.iter().rev() {
                    stack.push((*c, depth + 1));
                }
            }
        }
        out
    }

    /// 文本渲染：每行 `缩进 名称  类型  值`
    pub fn render(&self) -> String {
        let mut out = String::new();
        for root in &self.roots {
            let mut stack = vec![(*root, 0usize)];
            while let Some((id, depth)) = stack.pop() {
                let Some(n) = self.get(id) else { continue };
                out.push_str(&format!(
                    "{:indent$}{:<32} {:<12} {}\n",
                    "",
                    n.name,
                    n.type_label,
                    n.value.as_deref().unwrap_or(""),
                    indent = depth * 2
                ));
                for c in n.children.iter().rev() {
                    stack.push((*c, depth + 1));
                }
            }
        }
        out
    }
}

/// 标签树构建器
pub struct TagTreeBuilder<'a> {
    catalog: &'a TypeCatalog,
}

impl<'a> TagTreeBuilder<'a> {
    pub fn new(catalog: &'a TypeCatalog) -> Self {
        Self { catalog }
    }

    /// 为一个顶层标签构建子树并挂到 `tree` 的根列表末尾
    ///
    /// `writable` 是视图级的编辑开关；标签本身只读时整棵子树不可写。
    /// 子节点展开失败只记录日志，不影响根节点。
    pub fn build(
        &self,
        tree: &mut TagTree,
        def: &TagDef,
        handle: TagHandle,
        writable: bool,
    ) -> Result<NodeId> {
        if handle.index != def.index {
            return Err(ClientError::TypeMismatch(format!(
                "handle for tag {} does not belong to {}",
                handle.index, def.name
            )));
        }
        let readonly = def.is_readonly();
        let root_writable = writable && !readonly;
        let addr = LeafAddress::new(0, handle.bit, def.ty, def.count);

        let root = tree.alloc(TagNode {
            name: def.name.clone(),
            type_label: self.catalog.display_name(def.ty, def.count),
            kind: NodeKind::Root {
                handle,
                readonly,
                buffer: vec![0u8; handle.size as usize],
            },
            addr,
            parent: None,
            children: Vec::new(),
            writable: root_writable && addr.is_scalar(),
            value: None,
        });
        tree.roots.push(root);

        if let Err(e) = self.expand(
            tree,
            root,
            &def.name,
            def.ty,
            def.count,
            addr.bit_addr(),
            root_writable,
        ) {
            warn!("tree: {} only partially expanded: {}", def.name, e);
        }
        debug!("tree: built {} ({} nodes)", def.name, tree.subtree(root).len());
        Ok(root)
    }

    fn expand(
        &self,
        tree: &mut TagTree,
        parent: NodeId,
        name: &str,
        ty: TypeId,
        count: u32,
        base_bit: u32,
        writable: bool,
    ) -> Result<()> {
        if count > 1 {
            let stride = self.catalog.element_bits(ty)?;
            let label = self.catalog.display_name(ty, 1);
            for i in 0..count {
                let child_name = format!("{}[{}]", name, i);
                let bit = base_bit + i * stride;
                let addr = LeafAddress::from_bits(bit, ty, 1);
                let child = tree.add_child(
                    parent,
                    TagNode {
                        name: child_name.clone(),
                        type_label: label.clone(),
                        kind: NodeKind::ArrayElement { index: i },
                        addr,
                        parent: None,
                        children: Vec::new(),
                        writable: writable && addr.is_scalar(),
                        value: None,
                    },
                );
                if self.catalog.is_compound(ty) {
                    if let Err(e) = self.expand_members(tree, child, &child_name, ty, bit, writable)
                    {
                        warn!("tree: cannot expand {}: {}", child_name, e);
                    }
                }
            }
            Ok(())
        } else if self.catalog.is_compound(ty) {
            self.expand_members(tree, parent, name, ty, base_bit, writable)
        } else {
            Ok(())
        }
    }

    fn expand_members(
        &self,
        tree: &mut TagTree,
        parent: NodeId,
        name: &str,
        ty: TypeId,
        base_bit: u32,
        writable: bool,
    ) -> Result<()> {
        for layout in self.catalog.members(ty)? {
            let m = &layout.member;
            let child_name = format!("{}.{}", name, m.name);
            let bit = base_bit + layout.bit_offset;
            let addr = LeafAddress::from_bits(bit, m.ty, m.count);
            let child = tree.add_child(
                parent,
                TagNode {
                    name: child_name.clone(),
                    type_label: self.catalog.display_name(m.ty, m.count),
                    kind: NodeKind::CompoundMember {
                        member: m.name.clone(),
                    },
                    addr,
                    parent: None,
                    children: Vec::new(),
                    writable: writable && addr.is_scalar(),
                    value: None,
                },
            );
            if m.count > 1 || self.catalog.is_compound(m.ty) {
                if let Err(e) =
                    self.expand(tree, child, &child_name, m.ty, m.count, bit, writable)
                {
                    warn!("tree: cannot expand {}: {}", child_name, e);
                }
            }
        }
        Ok(())
    }
}
