//! API 模块
//!
//! 对外提供的宿主接口。
//!
//! - `host`: PluginHost 主接口，组装并驱动各子系统

pub mod host;

pub use host::{HostState, PluginHost, PluginHostBuilder};
