//! 事件总线
//!
//! 模块间异步通信：发布立即返回，每个订阅者独立投递。

pub mod event;
pub mod event_bus;

pub use event::{matches_pattern, Event};
pub use event_bus::{handler, DispatchStats, EventBus, EventHandler};
