//! 钩子系统
//!
//! 生命周期与请求流水线扩展点：按优先级有序分发，单个回调失败相互隔离。

pub mod registry;
pub mod types;

pub use registry::HookRegistry;
pub use types::{HookCallback, HookContext, HookOutcome, HookResult, HookType};
