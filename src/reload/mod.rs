//! 热重载
//!
//! - `queue` - 重载窗口内的请求缓冲
//! - `coordinator` - 停止、替换、回滚与放行

pub mod coordinator;
pub mod queue;

pub use coordinator::{HotReloadCoordinator, ReloadOutcome, ReloadRecord};
pub use queue::{DrainSummary, ReloadBuffer};
