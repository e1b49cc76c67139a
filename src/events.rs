//! 事件订阅管理
//!
//! 后台线程阻塞等待服务端事件，把结果转成 [`Notification`] 通过通道发给
//! 持有标签树的一方。后台线程从不直接修改标签树。
//!
//! 状态流转：
//! ```text
//! Idle -> Subscribing -> Listening -> Draining -> Closed
//!              |                                   ^
//!              +------------ 订阅失败 -------------+
//! ```
//! 等待超时是唯一的停止检查点，所以停止延迟最多一个超时周期。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, Result, TagServerClient};
use crate::types::{EventClass, SubscriptionId, TagHandle, TagIndex, TAG_ADDED, TAG_DELETED};

/// 默认等待超时 (ms)
pub const DEFAULT_EVENT_TIMEOUT_MS: u64 = 500;

/// 发给消费方的通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    TagAdded(TagIndex),
    TagDeleted(TagIndex),
    /// 单个被监视范围的新数据
    ValueChanged { id: SubscriptionId, data: Bytes },
    /// 事件线程退出；`Some` 表示因错误退出
    Closed(Option<ClientError>),
}

/// 管理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Subscribing,
    Listening,
    Draining,
    Closed,
}

/// 订阅 ID 到事件含义的映射
#[derive(Debug, Clone, Copy)]
enum Route {
    Added,
    Deleted,
    Value { size: u32 },
}

type Routes = Arc<Mutex<HashMap<SubscriptionId, Route>>>;

/// 事件订阅管理器
pub struct EventSubscriptionManager {
    client: Arc<dyn TagServerClient>,
    timeout_ms: u64,
    state: Arc<Mutex<ManagerState>>,
    running: Arc<AtomicBool>,
    routes: Routes,
    worker: Option<JoinHandle<()>>,
}

impl EventSubscriptionManager {
    pub fn new(client: Arc<dyn TagServerClient>, timeout_ms: u64) -> Self {
        Self {
            client,
            timeout_ms: timeout_ms.max(1),
            state: Arc::new(Mutex::new(ManagerState::Idle)),
            running: Arc::new(AtomicBool::new(false)),
            routes: Arc::new(Mutex::new(HashMap::new())),
            worker: None,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ManagerState::Closed)
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn set_state(&self, next: ManagerState) {
        set_state(&self.state, next);
    }

    /// 注册结构事件订阅并启动事件线程
    ///
    /// 任一订阅失败时已成功的订阅会被删除，状态进入 `Closed`，
    /// 返回 `SubscriptionFailed`。
    pub fn start(&mut self) -> Result<Receiver<Notification>> {
        match self.state() {
            ManagerState::Idle | ManagerState::Closed => {}
            other => {
                return Err(ClientError::SubscriptionFailed(format!(
                    "manager already {:?}",
                    other
                )))
            }
        }
        self.set_state(ManagerState::Subscribing);

        let added = match self.subscribe_structural(TAG_ADDED, EventClass::StructuralAdd) {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e, &[])),
        };
        let deleted = match self.subscribe_structural(TAG_DELETED, EventClass::StructuralDelete) {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e, &[added])),
        };

        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(added, Route::Added);
            routes.insert(deleted, Route::Deleted);
        }

        let (tx, rx) = mpsc::channel::<Notification>();
        self.running.store(true, Ordering::SeqCst);
        self.set_state(ManagerState::Listening);
        info!(
            "events: listening ({} / {}, timeout {} ms)",
            added, deleted, self.timeout_ms
        );

        let listener = Listener {
            client: self.client.clone(),
            timeout_ms: self.timeout_ms,
            state: self.state.clone(),
            running: self.running.clone(),
            routes: self.routes.clone(),
            tx,
        };
        self.worker = Some(thread::spawn(move || listener.run()));
        Ok(rx)
    }

    fn subscribe_structural(&self, name: &str, class: EventClass) -> Result<SubscriptionId> {
        let handle = self.client.resolve_handle(name)?;
        self.client.subscribe(&handle, class, true)
    }

    fn fail(&self, cause: ClientError, undo: &[SubscriptionId]) -> ClientError {
        for id in undo {
            if let Err(e) = self.client.unsubscribe(*id) {
                debug!("events: cleanup of {} failed: {}", id, e);
            }
        }
        self.set_state(ManagerState::Closed);
        error!("events: subscription failed: {}", cause);
        match cause {
            ClientError::SubscriptionFailed(_) => cause,
            other => ClientError::SubscriptionFailed(other.to_string()),
        }
    }

    /// 监视一个范围的值变化，通知以 `ValueChanged` 送达
    ///
    /// 订阅期间持有路由锁，事件线程要等路由登记完才能分发这个 ID 的事件。
    pub fn watch(&self, handle: &TagHandle) -> Result<SubscriptionId> {
        let mut routes = self
            .routes
            .lock()
            .map_err(|_| ClientError::SubscriptionFailed("route table poisoned".into()))?;
        let id = self
            .client
            .subscribe(handle, EventClass::ValueChanged, true)?;
        routes.insert(id, Route::Value { size: handle.size });
        drop(routes);
        debug!("events: watching tag {} as {}", handle.index, id);
        Ok(id)
    }

    pub fn unwatch(&self, id: SubscriptionId) -> Result<()> {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&id);
        }
        self.client.unsubscribe(id)
    }

    /// 请求停止并等待事件线程退出
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            info!("events: stopping...");
            if worker.join().is_err() {
                warn!("events: listener thread panicked");
                self.set_state(ManagerState::Closed);
            }
        }
    }
}

impl Drop for EventSubscriptionManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<ManagerState>, next: ManagerState) {
    if let Ok(mut s) = state.lock() {
        debug!("events: {:?} -> {:?}", *s, next);
        *s = next;
    }
}

/// 事件线程持有的部分
struct Listener {
    client: Arc<dyn TagServerClient>,
    timeout_ms: u64,
    state: Arc<Mutex<ManagerState>>,
    running: Arc<AtomicBool>,
    routes: Routes,
    tx: Sender<Notification>,
}

impl Listener {
    fn run(self) {
        let mut exit_error = None;
        let mut received = 0u64;

        while self.running.load(Ordering::SeqCst) {
            match self.client.wait_event(self.timeout_ms) {
                Ok(Some(id)) => {
                    received += 1;
                    if let Some(n) = self.dispatch(id) {
                        if self.tx.send(n).is_err() {
                            debug!("events: receiver dropped");
                            break;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!("events: connection lost: {}", e);
                    exit_error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!("events: wait failed, retrying: {}", e);
                }
            }
        }

        set_state(&self.state, ManagerState::Draining);
        self.running.store(false, Ordering::SeqCst);
        let ids: Vec<SubscriptionId> = match self.routes.lock() {
            Ok(mut routes) => routes.drain().map(|(id, _)| id).collect(),
            Err(_) => Vec::new(),
        };
        if exit_error.is_none() {
            for id in ids {
                if let Err(e) = self.client.unsubscribe(id) {
                    debug!("events: unsubscribe {} failed: {}", id, e);
                }
            }
        }
        set_state(&self.state, ManagerState::Closed);
        info!("events: closed after {} events", received);
        let _ = self.tx.send(Notification::Closed(exit_error));
    }

    fn dispatch(&self, id: SubscriptionId) -> Option<Notification> {
        let route = self.routes.lock().ok()?.get(&id).copied();
        let route = match route {
            Some(r) => r,
            None => {
                debug!("events: dropping event for unknown {}", id);
                return None;
            }
        };

        match route {
            Route::Added | Route::Deleted => {
                let mut buf = [0u8; 4];
                let index = match self.client.fetch_payload(&mut buf) {
                    Ok(4) => u32::from_le_bytes(buf),
                    Ok(n) => {
                        warn!("events: short payload ({} bytes) for {}", n, id);
                        return None;
                    }
                    Err(e) => {
                        warn!("events: payload fetch failed for {}: {}", id, e);
                        return None;
                    }
                };
                Some(match route {
                    Route::Added => Notification::TagAdded(index),
                    _ => Notification::TagDeleted(index),
                })
            }
            Route::Value { size } => {
                let mut buf = vec![0u8; size as usize];
                match self.client.fetch_payload(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Some(Notification::ValueChanged {
                            id,
                            data: Bytes::from(buf),
                        })
                    }
                    Err(e) => {
                        warn!("events: payload fetch failed for {}: {}", id, e);
                        None
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryServer;
    use crate::types::{Member, SubscriptionOptions, TagDef, TypeId};
    use std::sync::atomic::AtomicU32;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(2);

    /// 在内存服务端外面包一层，按计数注入失败
    struct FlakyServer {
        inner: MemoryServer,
        wait_failures: AtomicU32,
        fetch_failures: AtomicU32,
        fail_resolve: Option<&'static str>,
        /// 值订阅建立后立即写入 (路径, 值)
        write_on_subscribe: Option<(&'static str, &'static str)>,
    }

    impl FlakyServer {
        fn new(inner: MemoryServer) -> Self {
            Self {
                inner,
                wait_failures: AtomicU32::new(0),
                fetch_failures: AtomicU32::new(0),
                fail_resolve: None,
                write_on_subscribe: None,
            }
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    impl TagServerClient for FlakyServer {
        fn connect(&self) -> Result<()> {
            self.inner.connect()
        }
        fn disconnect(&self) -> Result<()> {
            self.inner.disconnect()
        }
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
        fn tag_by_index(&self, index: TagIndex) -> Result<TagDef> {
            self.inner.tag_by_index(index)
        }
        fn tag_by_name(&self, name: &str) -> Result<TagDef> {
            self.inner.tag_by_name(name)
        }
        fn resolve_handle(&self, path: &str) -> Result<TagHandle> {
            if self.fail_resolve == Some(path) {
                return Err(ClientError::NotFound(path.to_string()));
            }
            self.inner.resolve_handle(path)
        }
        fn read_bytes(&self, handle: &TagHandle, buf: &mut [u8]) -> Result<()> {
            self.inner.read_bytes(handle, buf)
        }
        fn write_bytes(&self, handle: &TagHandle, data: &[u8], mask: Option<&[u8]>) -> Result<()> {
            self.inner.write_bytes(handle, data, mask)
        }
        fn list_members(&self, ty: TypeId) -> Result<Vec<Member>> {
            self.inner.list_members(ty)
        }
        fn list_builtin_types(&self) -> Vec<(String, TypeId)> {
            self.inner.list_builtin_types()
        }
        fn type_name(&self, ty: TypeId) -> Result<String> {
            self.inner.type_name(ty)
        }
        fn add_tag(&self, name: &str, ty: TypeId, count: u32, attrs: u32) -> Result<TagHandle> {
            self.inner.add_tag(name, ty, count, attrs)
        }
        fn delete_tag(&self, index: TagIndex) -> Result<()> {
            self.inner.delete_tag(index)
        }
        fn add_type(&self, name: &str, members: &[Member]) -> Result<TypeId> {
            self.inner.add_type(name, members)
        }
        fn subscribe(
            &self,
            handle: &TagHandle,
            class: EventClass,
            deliver_payload: bool,
        ) -> Result<SubscriptionId> {
            let id = self.inner.subscribe(handle, class, deliver_payload)?;
            if class == EventClass::ValueChanged {
                if let Some((path, value)) = self.write_on_subscribe {
                    self.inner.set_value(path, value)?;
                }
            }
            Ok(id)
        }
        fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
            self.inner.unsubscribe(id)
        }
        fn set_subscription_options(
            &self,
            id: SubscriptionId,
            opts: SubscriptionOptions,
        ) -> Result<()> {
            self.inner.set_subscription_options(id, opts)
        }
        fn wait_event(&self, timeout_ms: u64) -> Result<Option<SubscriptionId>> {
            if take_one(&self.wait_failures) {
                return Err(ClientError::Io("wait interrupted".into()));
            }
            self.inner.wait_event(timeout_ms)
        }
        fn poll_event(&self) -> Option<SubscriptionId> {
            self.inner.poll_event()
        }
        fn fetch_payload(&self, buf: &mut [u8]) -> Result<usize> {
            if take_one(&self.fetch_failures) {
                return Err(ClientError::Io("payload lost".into()));
            }
            self.inner.fetch_payload(buf)
        }
        fn scalar_to_string(&self, ty: TypeId, bytes: &[u8], index: usize) -> Result<String> {
            self.inner.scalar_to_string(ty, bytes, index)
        }
        fn string_to_scalar(&self, text: &str, ty: TypeId, index: usize) -> Result<Bytes> {
            self.inner.string_to_scalar(text, ty, index)
        }
    }

    #[test]
    fn test_structural_notifications() {
        let server = Arc::new(MemoryServer::connected());
        let mut mgr = EventSubscriptionManager::new(server.clone(), 50);
        let rx = mgr.start().unwrap();
        assert_eq!(mgr.state(), ManagerState::Listening);
        assert_eq!(server.subscription_count(), 2);

        let h = server.add_tag("Pump", TypeId::DINT, 1, 0).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Notification::TagAdded(h.index));
        server.delete_tag(h.index).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Notification::TagDeleted(h.index));
        mgr.stop();
    }

    #[test]
    fn test_stop_within_one_timeout() {
        let server = Arc::new(MemoryServer::connected());
        let mut mgr = EventSubscriptionManager::new(server.clone(), 100);
        let rx = mgr.start().unwrap();

        let start = Instant::now();
        mgr.stop();
        // 一个超时周期加调度余量
        assert!(start.elapsed() < Duration::from_millis(100 + 400));
        assert_eq!(mgr.state(), ManagerState::Closed);
        assert_eq!(server.subscription_count(), 0);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Notification::Closed(None));
    }

    #[test]
    fn test_subscribe_failure_closes() {
        let server = Arc::new(MemoryServer::new());
        let mut mgr = EventSubscriptionManager::new(server, 50);
        assert!(matches!(
            mgr.start(),
            Err(ClientError::SubscriptionFailed(_))
        ));
        assert_eq!(mgr.state(), ManagerState::Closed);
    }

    #[test]
    fn test_value_changed_payload() {
        let server = Arc::new(MemoryServer::connected());
        server.add_tag("Level", TypeId::INT, 1, 0).unwrap();
        let mut mgr = EventSubscriptionManager::new(server.clone(), 50);
        let rx = mgr.start().unwrap();
        // 添加标签产生的结构事件在订阅之前，不会送达
        let h = server.resolve_handle("Level").unwrap();
        let id = mgr.watch(&h).unwrap();

        server.set_value("Level", "-3").unwrap();
        let n = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(
            n,
            Notification::ValueChanged {
                id,
                data: Bytes::copy_from_slice(&(-3i16).to_le_bytes()),
            }
        );
        mgr.unwatch(id).unwrap();
        assert_eq!(server.subscription_count(), 2);
        mgr.stop();
    }

    #[test]
    fn test_disconnect_ends_listener() {
        let server = Arc::new(MemoryServer::connected());
        let mut mgr = EventSubscriptionManager::new(server.clone(), 50);
        let rx = mgr.start().unwrap();
        server.disconnect().unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Notification::Closed(Some(ClientError::NotConnected))
        );
        mgr.stop();
        assert_eq!(mgr.state(), ManagerState::Closed);
    }

    #[test]
    fn test_wait_errors_retried_and_failed_fetch_dropped() {
        let mut flaky = FlakyServer::new(MemoryServer::connected());
        flaky.wait_failures = AtomicU32::new(3);
        flaky.fetch_failures = AtomicU32::new(1);
        let server = Arc::new(flaky);
        let mut mgr = EventSubscriptionManager::new(server.clone(), 50);
        let rx = mgr.start().unwrap();

        let a = server.add_tag("A", TypeId::INT, 1, 0).unwrap();
        let b = server.add_tag("B", TypeId::INT, 1, 0).unwrap();
        // A 的负载取失败，事件被丢弃；线程继续运行
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Notification::TagAdded(b.index));
        assert_ne!(a.index, b.index);
        assert_eq!(server.wait_failures.load(Ordering::SeqCst), 0);
        assert_eq!(mgr.state(), ManagerState::Listening);

        mgr.stop();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Notification::Closed(None));
        assert_eq!(server.inner.subscription_count(), 0);
    }

    #[test]
    fn test_second_subscription_failure_rolls_back_first() {
        let mut flaky = FlakyServer::new(MemoryServer::connected());
        flaky.fail_resolve = Some(TAG_DELETED);
        let server = Arc::new(flaky);
        let mut mgr = EventSubscriptionManager::new(server.clone(), 50);
        assert!(matches!(
            mgr.start(),
            Err(ClientError::SubscriptionFailed(_))
        ));
        assert_eq!(mgr.state(), ManagerState::Closed);
        assert_eq!(server.inner.subscription_count(), 0);
    }

    #[test]
    fn test_watch_sees_change_made_during_subscribe() {
        let mut flaky = FlakyServer::new(MemoryServer::connected());
        flaky.write_on_subscribe = Some(("Level", "9"));
        let server = Arc::new(flaky);
        server.add_tag("Level", TypeId::INT, 1, 0).unwrap();
        let mut mgr = EventSubscriptionManager::new(server.clone(), 50);
        let rx = mgr.start().unwrap();

        let h = server.resolve_handle("Level").unwrap();
        let id = mgr.watch(&h).unwrap();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Notification::ValueChanged {
                id,
                data: Bytes::copy_from_slice(&9i16.to_le_bytes()),
            }
        );
        mgr.stop();
    }
}
