//! # Vivian Events
//!
//! In-process publish/subscribe. Producers (memory manager, plugins,
//! scheduler, health monitor) publish named events; subscribers register by
//! exact type, regex prefix, one-shot, or globally.
//!
//! ```text
//! EventBus
//!   ├── subscribe("user_login", h)         exact
//!   ├── subscribe_once("ready", h)         fires once, then removed
//!   ├── subscribe_global(h)                every event
//!   ├── subscribe_pattern("^memory_", h)   regex, matched at the start
//!   ├── publish / queue_event + drain      sync or thread-per-handler
//!   └── EventLog                           ring buffer + JSONL file,
//!                                          filtered history and replay
//! ```

pub mod bus;
pub mod event;
pub mod log;
pub mod plugin;

pub use bus::{EventBus, Handler, SubscriptionId, SubscriptionInfo, SubscriptionKind};
pub use event::{Event, PublishOptions};
pub use log::{EventLog, HistoryQuery};
pub use plugin::{EventPlugin, EventSelector, HandlerSpec, PluginCapability};
