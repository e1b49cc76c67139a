//! 监视列表
//!
//! 单独关注的标签路径，每项持有自己的缓冲区和一个值变化订阅。

use std::sync::Arc;

use tracing::{debug, info};

use crate::client::{ClientError, Result, TagServerClient};
use crate::codec::{LeafAddress, ValueCodec};
use crate::events::{EventSubscriptionManager, Notification};
use crate::types::{SubscriptionId, TagHandle, TagIndex, TypeId};

/// 监视项
#[derive(Debug, Clone)]
pub struct WatchEntry {
    pub path: String,
    pub handle: TagHandle,
    pub subscription: SubscriptionId,
    pub buffer: Vec<u8>,
    pub value: Option<String>,
}

impl WatchEntry {
    fn addr(&self) -> LeafAddress {
        LeafAddress::new(0, self.handle.bit, self.handle.ty, self.handle.count)
    }
}

pub struct WatchList {
    client: Arc<dyn TagServerClient>,
    codec: ValueCodec,
    entries: Vec<WatchEntry>,
}

impl WatchList {
    pub fn new(client: Arc<dyn TagServerClient>) -> Self {
        Self {
            codec: ValueCodec::new(client.clone()),
            client,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[WatchEntry] {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&WatchEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// 添加监视：解析路径、读初值、注册值变化订阅
    pub fn add(&mut self, events: &EventSubscriptionManager, path: &str) -> Result<&WatchEntry> {
        if self.get(path).is_some() {
            return Err(ClientError::Duplicate(path.to_string()));
        }
        let handle = self.client.resolve_handle(path)?;
        if handle.ty.is_custom() || (handle.count > 1 && handle.ty != TypeId::CHAR) {
            return Err(ClientError::NotSupported(format!(
                "{} is not a single value",
                path
            )));
        }

        let mut buffer = vec![0u8; handle.size as usize];
        self.client.read_bytes(&handle, &mut buffer)?;
        let subscription = events.watch(&handle)?;

        let mut entry = WatchEntry {
            path: path.to_string(),
            handle,
            subscription,
            buffer,
            value: None,
        };
        entry.value = self.codec.decode(&entry.buffer, &entry.addr(), 0)?;
        info!("watch: + {} = {}", path, entry.value.as_deref().unwrap_or(""));
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// 应用值变化通知，返回被更新的项
    pub fn apply(&mut self, notification: &Notification) -> Option<&WatchEntry> {
        let (id, data) = match notification {
            Notification::ValueChanged { id, data } => (*id, data),
            _ => return None,
        };
        let pos = self.entries.iter().position(|e| e.subscription == id)?;
        let entry = &mut self.entries[pos];
        let n = data.len().min(entry.buffer.len());
        entry.buffer[..n].copy_from_slice(&data[..n]);
        match self.codec.decode(&entry.buffer, &entry.addr(), 0) {
            Ok(v) => entry.value = v,
            Err(e) => debug!("watch: decode of {} failed: {}", entry.path, e),
        }
        Some(&self.entries[pos])
    }

    pub fn remove(&mut self, events: &EventSubscriptionManager, path: &str) -> Result<()> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.path == path)
            .ok_or_else(|| ClientError::NotFound(path.to_string()))?;
        let entry = self.entries.remove(pos);
        events.unwatch(entry.subscription)
    }

    /// 标签被删除后丢弃它的所有监视项
    pub fn forget_tag(&mut self, events: &EventSubscriptionManager, index: TagIndex) -> usize {
        let before = self.entries.len();
        let (gone, keep): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.handle.index == index);
        self.entries = keep;
        for e in gone {
            // 服务端删除标签时已经删掉了订阅
            if let Err(err) = events.unwatch(e.subscription) {
                debug!("watch: {} already gone: {}", e.path, err);
            }
        }
        before - self.entries.len()
    }

    pub fn clear(&mut self, events: &EventSubscriptionManager) {
        for e in self.entries.drain(..) {
            if let Err(err) = events.unwatch(e.subscription) {
                debug!("watch: unsubscribe {} failed: {}", e.path, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryServer;
    use crate::types::Member;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryServer>, EventSubscriptionManager, WatchList) {
        let server = Arc::new(MemoryServer::connected());
        let events = EventSubscriptionManager::new(server.clone(), 50);
        let list = WatchList::new(server.clone());
        (server, events, list)
    }

    #[test]
    fn test_add_reads_initial_value() {
        let (server, events, mut list) = setup();
        server.add_tag("Speed", TypeId::UINT, 4, 0).unwrap();
        server.set_value("Speed[2]", "1200").unwrap();
        let e = list.add(&events, "Speed[2]").unwrap();
        assert_eq!(e.value.as_deref(), Some("1200"));
        assert!(matches!(
            list.add(&events, "Speed[2]"),
            Err(ClientError::Duplicate(_))
        ));
    }

    #[test]
    fn test_rejects_arrays_and_compounds() {
        let (server, events, mut list) = setup();
        let ty = server
            .add_type("Box", &[Member::new("w", TypeId::INT, 1)])
            .unwrap();
        server.add_tag("Arr", TypeId::DINT, 3, 0).unwrap();
        server.add_tag("Bx", ty, 1, 0).unwrap();
        server.add_tag("Txt", TypeId::CHAR, 8, 0).unwrap();
        assert!(matches!(list.add(&events, "Arr"), Err(ClientError::NotSupported(_))));
        assert!(matches!(list.add(&events, "Bx"), Err(ClientError::NotSupported(_))));
        assert!(list.add(&events, "Bx.w").is_ok());
        assert!(list.add(&events, "Txt").is_ok());
        assert_eq!(server.subscription_count(), 2);
    }

    #[test]
    fn test_value_changed_updates_entry() {
        let (server, mut events, mut list) = setup();
        server.add_tag("Flags", TypeId::BOOL, 16, 0).unwrap();
        let rx = events.start().unwrap();
        list.add(&events, "Flags[11]").unwrap();

        server.set_value("Flags[11]", "true").unwrap();
        let n = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let e = list.apply(&n).unwrap();
        assert_eq!(e.path, "Flags[11]");
        assert_eq!(e.value.as_deref(), Some("true"));
        events.stop();
    }

    #[test]
    fn test_remove_and_clear_unsubscribe() {
        let (server, events, mut list) = setup();
        server.add_tag("A", TypeId::INT, 1, 0).unwrap();
        server.add_tag("B", TypeId::INT, 1, 0).unwrap();
        list.add(&events, "A").unwrap();
        list.add(&events, "B").unwrap();
        assert_eq!(server.subscription_count(), 2);

        list.remove(&events, "A").unwrap();
        assert_eq!(server.subscription_count(), 1);
        assert!(list.remove(&events, "A").is_err());
        list.clear(&events);
        assert_eq!(server.subscription_count(), 0);
        assert!(list.entries().is_empty());
    }

    #[test]
    fn test_forget_deleted_tag() {
        let (server, events, mut list) = setup();
        let h = server.add_tag("T", TypeId::INT, 2, 0).unwrap();
        list.add(&events, "T[0]").unwrap();
        list.add(&events, "T[1]").unwrap();
        server.delete_tag(h.index).unwrap();
        assert_eq!(list.forget_tag(&events, h.index), 2);
        assert!(list.entries().is_empty());
    }
}
