//! 标签查看器核心
//!
//! 把服务端标签的类型定义展开成可寻址的树，按位精确地解码/编码叶子值，
//! 并通过事件订阅在标签增删时保持树的实时性。
//!
//! # 示例
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dax_tagview::{EventSubscriptionManager, LiveTagSet, MemoryServer, TagServerClient, TypeId};
//!
//! let server = Arc::new(MemoryServer::connected());
//! let mut live = LiveTagSet::new(server.clone(), true);
//! live.populate().unwrap();
//!
//! let mut events = EventSubscriptionManager::new(server.clone(), 500);
//! let rx = events.start().unwrap();
//!
//! server.add_tag("Counter", TypeId::UDINT, 1, 0).unwrap();
//! while let Ok(n) = rx.recv_timeout(std::time::Duration::from_millis(500)) {
//!     live.apply(&n);
//! }
//! live.refresh().unwrap();
//! print!("{}", live.tree().render());
//! events.stop();
//! ```

pub mod catalog;
pub mod client;
pub mod codec;
pub mod config;
pub mod events;
pub mod live;
pub mod scalar;
pub mod sim;
pub mod tree;
pub mod types;
pub mod watch;

pub use catalog::{MemberLayout, TypeCatalog, TypeInfo};
pub use client::{delete_tag_by_name, write_text, ClientError, Result, TagServerClient};
pub use codec::{LeafAddress, ValueCodec};
pub use config::ViewerConfig;
pub use events::{EventSubscriptionManager, ManagerState, Notification, DEFAULT_EVENT_TIMEOUT_MS};
pub use live::{LiveTagSet, TagRef};
pub use sim::MemoryServer;
pub use tree::{NodeId, NodeKind, TagNode, TagTree, TagTreeBuilder};
pub use types::{
    EventClass, Member, PrimitiveKind, SubscriptionId, SubscriptionOptions, TagDef, TagHandle,
    TagIndex, TypeId,
};
pub use watch::{WatchEntry, WatchList};
