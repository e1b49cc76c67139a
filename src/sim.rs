//! 内存标签服务端
//!
//! [`TagServerClient`] 的完整进程内实现，供测试和演示模式使用：
//! - 标签表：索引递增分配，删除后不复用
//! - 复合类型注册表，布局规则与 [`crate::catalog`] 一致
//! - 每个标签一块数据镜像，支持掩码写
//! - 特殊标签 `_lastindex` / `_tag_added` / `_tag_deleted`
//! - 事件队列：`wait_event` 基于 `Condvar` 带超时等待
//!
//! 事件语义：
//! ```text
//! StructuralAdd / StructuralDelete  每次写入被订阅标签都触发（写事件）
//! ValueChanged                      只在订阅范围内的字节实际变化时触发
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use crate::catalog::pack_members;
use crate::client::{write_text, ClientError, Result, TagServerClient};
use crate::scalar;
use crate::types::{
    EventClass, Member, PrimitiveKind, SubscriptionId, SubscriptionOptions, TagDef, TagHandle,
    TagIndex, TypeId, CUSTOM_FLAG, TAG_ADDED, TAG_DELETED, TAG_LASTINDEX,
};

/// 特殊标签个数，这些标签不可删除
const SYSTEM_TAGS: u32 = 3;

struct TagEntry {
    def: TagDef,
    data: Vec<u8>,
}

struct TypeEntry {
    name: String,
    members: Vec<Member>,
}

struct Subscription {
    index: TagIndex,
    byte: u32,
    size: u32,
    class: EventClass,
    send_data: bool,
}

struct Inner {
    connected: bool,
    tags: Vec<Option<TagEntry>>,
    types: Vec<TypeEntry>,
    subs: BTreeMap<u32, Subscription>,
    next_sub: u32,
    pending: VecDeque<(SubscriptionId, Bytes)>,
    current_payload: Option<Bytes>,
}

impl Inner {
    fn custom(&self, ty: TypeId) -> Result<&TypeEntry> {
        if !ty.is_custom() {
            return Err(ClientError::UnknownType(ty));
        }
        let n = (ty.0 & !CUSTOM_FLAG) as usize;
        n.checked_sub(1)
            .and_then(|i| self.types.get(i))
            .ok_or(ClientError::UnknownType(ty))
    }

    /// 单个元素字节数
    fn element_size(&self, ty: TypeId) -> Result<u32> {
        if let Some(kind) = ty.primitive() {
            return Ok(kind.byte_width());
        }
        let members = self.custom(ty)?.members.clone();
        let (_, size) = pack_members(&members, |t| self.element_size(t))?;
        Ok(size)
    }

    fn element_bits(&self, ty: TypeId) -> Result<u32> {
        if ty == TypeId::BOOL {
            Ok(1)
        } else {
            Ok(self.element_size(ty)? * 8)
        }
    }

    fn byte_size(&self, ty: TypeId, count: u32) -> Result<u32> {
        if ty == TypeId::BOOL {
            Ok(count.max(1).div_ceil(8))
        } else {
            Ok(self.element_size(ty)? * count.max(1))
        }
    }

    fn entry(&self, index: TagIndex) -> Result<&TagEntry> {
        self.tags
            .get(index as usize)
            .and_then(|t| t.as_ref())
            .ok_or(ClientError::StaleHandle(index))
    }

    fn find(&self, name: &str) -> Option<&TagEntry> {
        self.tags.iter().flatten().find(|t| t.def.name == name)
    }

    fn type_name(&self, ty: TypeId) -> Result<String> {
        match ty.primitive() {
            Some(kind) => Ok(kind.name().to_string()),
            None => Ok(self.custom(ty)?.name.clone()),
        }
    }

    /// 写入并收集需要触发的事件
    fn write(&mut self, handle: &TagHandle, data: &[u8], mask: Option<&[u8]>) -> Result<()> {
        let size = handle.size as usize;
        if data.len() < size || mask.map(|m| m.len() < size).unwrap_or(false) {
            return Err(ClientError::Io(format!(
                "write of {} bytes needs {} bytes of data",
                size,
                data.len()
            )));
        }
        let before;
        {
            let entry = self
                .tags
                .get_mut(handle.index as usize)
                .and_then(|t| t.as_mut())
                .ok_or(ClientError::StaleHandle(handle.index))?;
            let start = handle.byte as usize;
            let end = start + size;
            if end > entry.data.len() {
                return Err(ClientError::Io(format!(
                    "write [{}..{}] beyond tag {} of {} bytes",
                    start,
                    end,
                    entry.def.name,
                    entry.data.len()
                )));
            }
            before = entry.data.clone();
            let dst = &mut entry.data[start..end];
            match mask {
                Some(m) => {
                    for i in 0..size {
                        dst[i] = (dst[i] & !m[i]) | (data[i] & m[i]);
                    }
                }
                None => dst.copy_from_slice(&data[..size]),
            }
        }
        self.fire(handle, &before);
        Ok(())
    }

    fn fire(&mut self, handle: &TagHandle, before: &[u8]) {
        let entry = match self.tags.get(handle.index as usize).and_then(|t| t.as_ref()) {
            Some(e) => e,
            None => return,
        };
        let w_start = handle.byte;
        let w_end = handle.byte + handle.size;
        for (id, sub) in &self.subs {
            if sub.index != handle.index {
                continue;
            }
            let s_start = sub.byte as usize;
            let s_end = (sub.byte + sub.size) as usize;
            if sub.byte >= w_end || sub.byte + sub.size <= w_start {
                continue;
            }
            let fire = match sub.class {
                EventClass::StructuralAdd | EventClass::StructuralDelete => true,
                EventClass::ValueChanged => before[s_start..s_end] != entry.data[s_start..s_end],
            };
            if fire {
                let payload = if sub.send_data {
                    Bytes::copy_from_slice(&entry.data[s_start..s_end])
                } else {
                    Bytes::new()
                };
                self.pending.push_back((SubscriptionId(*id), payload));
            }
        }
    }

    fn write_index(&mut self, special: &str, value: TagIndex) -> Result<()> {
        let index = self
            .find(special)
            .map(|t| t.def.index)
            .ok_or_else(|| ClientError::NotFound(special.to_string()))?;
        let handle = TagHandle {
            index,
            byte: 0,
            bit: 0,
            size: 4,
            ty: TypeId::UDINT,
            count: 1,
        };
        self.write(&handle, &value.to_le_bytes(), None)
    }

    fn insert_tag(&mut self, name: &str, ty: TypeId, count: u32, attrs: u32) -> Result<TagHandle> {
        validate_name(name)?;
        if count == 0 {
            return Err(ClientError::TypeMismatch(format!("{}: count must be >= 1", name)));
        }
        if self.find(name).is_some() {
            return Err(ClientError::Duplicate(name.to_string()));
        }
        let size = self.byte_size(ty, count)?;
        let index = self.tags.len() as TagIndex;
        self.tags.push(Some(TagEntry {
            def: TagDef {
                index,
                name: name.to_string(),
                ty,
                count,
                attrs,
            },
            data: vec![0u8; size as usize],
        }));
        Ok(TagHandle {
            index,
            byte: 0,
            bit: 0,
            size,
            ty,
            count,
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ClientError::TypeMismatch(format!("invalid name '{}'", name)))
    }
}

/// 拆分 `name[3]` 为 ("name", Some(3))
fn split_index(segment: &str) -> Result<(&str, Option<u32>)> {
    match segment.find('[') {
        None => Ok((segment, None)),
        Some(open) => {
            let rest = &segment[open + 1..];
            let close = rest
                .strip_suffix(']')
                .ok_or_else(|| ClientError::NotFound(format!("bad path segment '{}'", segment)))?;
            let idx = close
                .trim()
                .parse::<u32>()
                .map_err(|_| ClientError::NotFound(format!("bad index in '{}'", segment)))?;
            Ok((&segment[..open], Some(idx)))
        }
    }
}

/// 内存标签服务端
pub struct MemoryServer {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryServer {
    /// 创建未连接的服务端，特殊标签已就绪
    pub fn new() -> Self {
        let mut inner = Inner {
            connected: false,
            tags: Vec::new(),
            types: Vec::new(),
            subs: BTreeMap::new(),
            next_sub: 1,
            pending: VecDeque::new(),
            current_payload: None,
        };
        let readonly = TagDef::ATTR_READONLY;
        for name in [TAG_LASTINDEX, TAG_ADDED, TAG_DELETED] {
            let index = inner.tags.len() as TagIndex;
            inner.tags.push(Some(TagEntry {
                def: TagDef {
                    index,
                    name: name.to_string(),
                    ty: TypeId::UDINT,
                    count: 1,
                    attrs: readonly,
                },
                data: vec![0u8; 4],
            }));
        }
        let last = (inner.tags.len() - 1) as u32;
        if let Some(Some(t)) = inner.tags.get_mut(0) {
            t.data = last.to_le_bytes().to_vec();
        }
        Self {
            inner: Mutex::new(inner),
            cond: Condvar::new(),
        }
    }

    /// 创建并连接
    pub fn connected() -> Self {
        let server = Self::new();
        if let Ok(mut inner) = server.inner.lock() {
            inner.connected = true;
        }
        server
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| ClientError::Connection("server state poisoned".into()))?;
        if !inner.connected {
            return Err(ClientError::NotConnected);
        }
        Ok(inner)
    }

    /// 以外部写入者身份按路径写入文本值（BOOL 只改对应位）
    pub fn set_value(&self, path: &str, text: &str) -> Result<()> {
        write_text(self, path, text)
    }

    /// 当前排队的事件数
    pub fn pending_events(&self) -> usize {
        self.inner.lock().map(|i| i.pending.len()).unwrap_or(0)
    }

    /// 当前活动订阅数
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().map(|i| i.subs.len()).unwrap_or(0)
    }
}

impl TagServerClient for MemoryServer {
    fn connect(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ClientError::Connection("server state poisoned".into()))?;
        inner.connected = true;
        info!("sim: client connected");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ClientError::Connection("server state poisoned".into()))?;
        inner.connected = false;
        inner.subs.clear();
        inner.pending.clear();
        inner.current_payload = None;
        self.cond.notify_all();
        info!("sim: client disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().map(|i| i.connected).unwrap_or(false)
    }

    fn tag_by_index(&self, index: TagIndex) -> Result<TagDef> {
        let inner = self.lock()?;
        inner
            .tags
            .get(index as usize)
            .and_then(|t| t.as_ref())
            .map(|t| t.def.clone())
            .ok_or_else(|| ClientError::NotFound(format!("tag #{}", index)))
    }

    fn tag_by_name(&self, name: &str) -> Result<TagDef> {
        let inner = self.lock()?;
        inner
            .find(name)
            .map(|t| t.def.clone())
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    fn resolve_handle(&self, path: &str) -> Result<TagHandle> {
        let inner = self.lock()?;
        let mut segments = path.split('.');
        let first = segments
            .next()
            .ok_or_else(|| ClientError::NotFound(path.to_string()))?;
        let (base, idx) = split_index(first)?;
        let tag = inner
            .find(base)
            .ok_or_else(|| ClientError::NotFound(path.to_string()))?;

        let index = tag.def.index;
        let mut ty = tag.def.ty;
        let mut count = tag.def.count;
        let mut bit = 0u32;

        let apply_index = |ty: TypeId,
                           count: &mut u32,
                           bit: &mut u32,
                           idx: Option<u32>|
         -> Result<()> {
            if let Some(i) = idx {
                if *count <= 1 || i >= *count {
                    return Err(ClientError::NotFound(format!(
                        "{}: index {} out of range",
                        path, i
                    )));
                }
                *bit += i * inner.element_bits(ty)?;
                *count = 1;
            }
            Ok(())
        };
        apply_index(ty, &mut count, &mut bit, idx)?;

        for seg in segments {
            let (name, idx) = split_index(seg)?;
            if count > 1 {
                return Err(ClientError::NotFound(format!("{}: '{}' needs an index", path, seg)));
            }
            let members = inner.custom(ty)?.members.clone();
            let (offsets, _) = pack_members(&members, |t| inner.element_size(t))?;
            let pos = members
                .iter()
                .position(|m| m.name == name)
                .ok_or_else(|| ClientError::NotFound(path.to_string()))?;
            bit += offsets[pos];
            ty = members[pos].ty;
            count = members[pos].count;
            apply_index(ty, &mut count, &mut bit, idx)?;
        }

        let size = if ty == TypeId::BOOL {
            ((bit % 8) + count).div_ceil(8)
        } else {
            inner.byte_size(ty, count)?
        };
        Ok(TagHandle {
            index,
            byte: bit / 8,
            bit: if ty == TypeId::BOOL { (bit % 8) as u8 } else { 0 },
            size,
            ty,
            count,
        })
    }

    fn read_bytes(&self, handle: &TagHandle, buf: &mut [u8]) -> Result<()> {
        let inner = self.lock()?;
        let entry = inner.entry(handle.index)?;
        let start = handle.byte as usize;
        let end = start + handle.size as usize;
        let src = entry.data.get(start..end).ok_or_else(|| {
            ClientError::Io(format!("read [{}..{}] beyond tag {}", start, end, entry.def.name))
        })?;
        let have = buf.len();
        let dst = buf.get_mut(..src.len()).ok_or_else(|| {
            ClientError::Io(format!("buffer of {} bytes too small for {}", have, src.len()))
        })?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_bytes(&self, handle: &TagHandle, data: &[u8], mask: Option<&[u8]>) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.entry(handle.index)?.def.is_readonly() {
            return Err(ClientError::ReadOnly(inner.entry(handle.index)?.def.name.clone()));
        }
        inner.write(handle, data, mask)?;
        if !inner.pending.is_empty() {
            self.cond.notify_all();
        }
        Ok(())
    }

    fn list_members(&self, ty: TypeId) -> Result<Vec<Member>> {
        let inner = self.lock()?;
        Ok(inner.custom(ty)?.members.clone())
    }

    fn list_builtin_types(&self) -> Vec<(String, TypeId)> {
        let mut out: Vec<(String, TypeId)> = PrimitiveKind::ALL
            .iter()
            .map(|k| (k.name().to_string(), k.type_id()))
            .collect();
        if let Ok(inner) = self.inner.lock() {
            out.extend(
                inner
                    .types
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (t.name.clone(), TypeId::custom(i as u32 + 1))),
            );
        }
        out
    }

    fn type_name(&self, ty: TypeId) -> Result<String> {
        self.lock()?.type_name(ty)
    }

    fn add_tag(&self, name: &str, ty: TypeId, count: u32, attrs: u32) -> Result<TagHandle> {
        let mut inner = self.lock()?;
        let handle = inner.insert_tag(name, ty, count, attrs)?;
        let last = (inner.tags.len() - 1) as u32;
        if let Some(Some(t)) = inner.tags.get_mut(0) {
            t.data = last.to_le_bytes().to_vec();
        }
        inner.write_index(TAG_ADDED, handle.index)?;
        self.cond.notify_all();
        debug!("sim: tag {} added at index {}", name, handle.index);
        Ok(handle)
    }

    fn delete_tag(&self, index: TagIndex) -> Result<()> {
        let mut inner = self.lock()?;
        if index < SYSTEM_TAGS {
            return Err(ClientError::NotSupported(format!("cannot delete system tag #{}", index)));
        }
        let slot = inner
            .tags
            .get_mut(index as usize)
            .ok_or_else(|| ClientError::NotFound(format!("tag #{}", index)))?;
        let entry = slot
            .take()
            .ok_or_else(|| ClientError::NotFound(format!("tag #{}", index)))?;
        inner.subs.retain(|_, s| s.index != index);
        inner.write_index(TAG_DELETED, index)?;
        self.cond.notify_all();
        debug!("sim: tag {} deleted", entry.def.name);
        Ok(())
    }

    fn add_type(&self, name: &str, members: &[Member]) -> Result<TypeId> {
        let mut inner = self.lock()?;
        validate_name(name)?;
        if PrimitiveKind::ALL.iter().any(|k| k.name().eq_ignore_ascii_case(name))
            || inner.types.iter().any(|t| t.name == name)
        {
            return Err(ClientError::Duplicate(name.to_string()));
        }
        if members.is_empty() {
            return Err(ClientError::TypeMismatch(format!("type {} has no members", name)));
        }
        for (i, m) in members.iter().enumerate() {
            validate_name(&m.name)?;
            if m.count == 0 {
                return Err(ClientError::TypeMismatch(format!(
                    "{}.{}: count must be >= 1",
                    name, m.name
                )));
            }
            if members[..i].iter().any(|o| o.name == m.name) {
                return Err(ClientError::Duplicate(format!("{}.{}", name, m.name)));
            }
            inner.element_size(m.ty)?;
        }
        inner.types.push(TypeEntry {
            name: name.to_string(),
            members: members.to_vec(),
        });
        Ok(TypeId::custom(inner.types.len() as u32))
    }

    fn subscribe(
        &self,
        handle: &TagHandle,
        class: EventClass,
        deliver_payload: bool,
    ) -> Result<SubscriptionId> {
        let mut inner = self.lock()?;
        let entry = inner.entry(handle.index)?;
        let end = handle.byte as usize + handle.size.max(1) as usize;
        if end > entry.data.len() {
            return Err(ClientError::Io(format!(
                "subscription [{}..{}] beyond tag {} of {} bytes",
                handle.byte,
                end,
                entry.def.name,
                entry.data.len()
            )));
        }
        let id = inner.next_sub;
        inner.next_sub += 1;
        inner.subs.insert(
            id,
            Subscription {
                index: handle.index,
                byte: handle.byte,
                size: handle.size.max(1),
                class,
                send_data: deliver_payload,
            },
        );
        debug!("sim: sub#{} {} on tag #{}", id, class, handle.index);
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .subs
            .remove(&id.0)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        inner.pending.retain(|(p, _)| *p != id);
        Ok(())
    }

    fn set_subscription_options(
        &self,
        id: SubscriptionId,
        opts: SubscriptionOptions,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let sub = inner
            .subs
            .get_mut(&id.0)
            .ok_or_else(|| ClientError::NotFound(id.to_string()))?;
        sub.send_data = opts.send_data;
        Ok(())
    }

    fn wait_event(&self, timeout_ms: u64) -> Result<Option<SubscriptionId>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut inner = self.lock()?;
        loop {
            if let Some((id, payload)) = inner.pending.pop_front() {
                inner.current_payload = Some(payload);
                return Ok(Some(id));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(inner, deadline - now)
                .map_err(|_| ClientError::Connection("server state poisoned".into()))?;
            inner = guard;
            if !inner.connected {
                return Err(ClientError::NotConnected);
            }
        }
    }

    fn poll_event(&self) -> Option<SubscriptionId> {
        let mut inner = self.lock().ok()?;
        let (id, payload) = inner.pending.pop_front()?;
        inner.current_payload = Some(payload);
        Some(id)
    }

    fn fetch_payload(&self, buf: &mut [u8]) -> Result<usize> {
        let inner = self.lock()?;
        let payload = inner
            .current_payload
            .as_ref()
            .ok_or_else(|| ClientError::Io("no event data".into()))?;
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(n)
    }

    fn scalar_to_string(&self, ty: TypeId, bytes: &[u8], index: usize) -> Result<String> {
        scalar::to_string(ty, bytes, index)
    }

    fn string_to_scalar(&self, text: &str, ty: TypeId, index: usize) -> Result<Bytes> {
        scalar::from_string(text, ty, index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_tags() {
        let server = MemoryServer::connected();
        let last = server.resolve_handle(TAG_LASTINDEX).unwrap();
        let mut buf = [0u8; 4];
        server.read_bytes(&last, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 2);
        assert!(server.delete_tag(1).is_err());
    }

    #[test]
    fn test_not_connected() {
        let server = MemoryServer::new();
        assert_eq!(server.tag_by_index(0), Err(ClientError::NotConnected));
        server.connect().unwrap();
        assert!(server.tag_by_index(0).is_ok());
    }

    #[test]
    fn test_resolve_nested_path() {
        let server = MemoryServer::connected();
        let pt = server
            .add_type("Pt", &[Member::new("x", TypeId::INT, 1), Member::new("on", TypeId::BOOL, 3)])
            .unwrap();
        server.add_tag("Line", pt, 4, 0).unwrap();
        // Pt = 2 字节 INT + 1 字节位区
        let h = server.resolve_handle("Line[2].on[1]").unwrap();
        assert_eq!((h.byte, h.bit, h.size, h.ty, h.count), (8, 1, 1, TypeId::BOOL, 1));
        let whole = server.resolve_handle("Line").unwrap();
        assert_eq!(whole.size, 12);
        assert!(server.resolve_handle("Line.x").is_err());
        assert!(server.resolve_handle("Line[4]").is_err());
        assert!(server.resolve_handle("Nope").is_err());
    }

    #[test]
    fn test_masked_write() {
        let server = MemoryServer::connected();
        server.add_tag("Flags", TypeId::BOOL, 8, 0).unwrap();
        server.set_value("Flags[3]", "true").unwrap();
        server.set_value("Flags[5]", "1").unwrap();
        server.set_value("Flags[3]", "false").unwrap();
        let h = server.resolve_handle("Flags").unwrap();
        let mut buf = [0u8; 1];
        server.read_bytes(&h, &mut buf).unwrap();
        assert_eq!(buf[0], 0b0010_0000);
    }

    #[test]
    fn test_structural_events_with_payload() {
        let server = MemoryServer::connected();
        let added = server.resolve_handle(TAG_ADDED).unwrap();
        let id = server.subscribe(&added, EventClass::StructuralAdd, true).unwrap();
        let h = server.add_tag("New", TypeId::DINT, 1, 0).unwrap();

        assert_eq!(server.wait_event(10).unwrap(), Some(id));
        let mut buf = [0u8; 4];
        assert_eq!(server.fetch_payload(&mut buf).unwrap(), 4);
        assert_eq!(u32::from_le_bytes(buf), h.index);
        assert_eq!(server.wait_event(10).unwrap(), None);
    }

    #[test]
    fn test_value_changed_only_on_change() {
        let server = MemoryServer::connected();
        server.add_tag("V", TypeId::INT, 2, 0).unwrap();
        let h = server.resolve_handle("V[1]").unwrap();
        let id = server.subscribe(&h, EventClass::ValueChanged, true).unwrap();

        server.set_value("V[0]", "5").unwrap();
        assert_eq!(server.poll_event(), None);
        server.set_value("V[1]", "7").unwrap();
        assert_eq!(server.poll_event(), Some(id));
        server.set_value("V[1]", "7").unwrap();
        assert_eq!(server.poll_event(), None);
    }

    #[test]
    fn test_delete_drops_subscriptions() {
        let server = MemoryServer::connected();
        let h = server.add_tag("Gone", TypeId::INT, 1, 0).unwrap();
        server.subscribe(&h, EventClass::ValueChanged, true).unwrap();
        assert_eq!(server.subscription_count(), 1);
        server.delete_tag(h.index).unwrap();
        assert_eq!(server.subscription_count(), 0);
        let mut buf = [0u8; 2];
        assert_eq!(
            server.read_bytes(&h, &mut buf),
            Err(ClientError::StaleHandle(h.index))
        );
    }

    #[test]
    fn test_read_into_short_buffer() {
        let server = MemoryServer::connected();
        server.add_tag("Wide", TypeId::DINT, 2, 0).unwrap();
        let h = server.resolve_handle("Wide").unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(server.read_bytes(&h, &mut buf), Err(ClientError::Io(_))));
        let mut buf = [0u8; 8];
        assert!(server.read_bytes(&h, &mut buf).is_ok());
    }

    #[test]
    fn test_subscribe_outside_tag_rejected() {
        let server = MemoryServer::connected();
        let h = server.add_tag("Small", TypeId::INT, 1, 0).unwrap();
        let past_end = TagHandle { byte: 2, ..h };
        let too_wide = TagHandle { size: 8, ..h };
        for bad in [past_end, too_wide] {
            assert!(matches!(
                server.subscribe(&bad, EventClass::ValueChanged, true),
                Err(ClientError::Io(_))
            ));
        }
        assert_eq!(server.subscription_count(), 0);

        // 拒绝后服务端照常工作
        let id = server.subscribe(&h, EventClass::ValueChanged, true).unwrap();
        server.set_value("Small", "3").unwrap();
        assert_eq!(server.poll_event(), Some(id));
    }

    #[test]
    fn test_wait_times_out() {
        let server = MemoryServer::connected();
        let start = Instant::now();
        assert_eq!(server.wait_event(50).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_add_type_validation() {
        let server = MemoryServer::connected();
        assert!(server.add_type("Empty", &[]).is_err());
        assert!(server.add_type("REAL", &[Member::new("a", TypeId::INT, 1)]).is_err());
        assert!(server
            .add_type("Dup", &[Member::new("a", TypeId::INT, 1), Member::new("a", TypeId::INT, 1)])
            .is_err());
        assert!(server
            .add_type("Bad", &[Member::new("a", TypeId::custom(42), 1)])
            .is_err());
        let ok = server.add_type("Good", &[Member::new("a", TypeId::INT, 2)]).unwrap();
        assert_eq!(server.type_name(ok).unwrap(), "Good");
        assert!(server
            .list_builtin_types()
            .iter()
            .any(|(n, t)| n == "Good" && *t == ok));
    }
}
