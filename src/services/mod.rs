//! 服务目录与权限网关
//!
//! - `directory` - 模块之间按 `(owner, name)` 导出和查找服务
//! - `gate` - 宿主服务访问控制

pub mod directory;
pub mod gate;

pub use directory::{ExportedService, ServiceDirectory, ServiceHandle};
pub use gate::{HostService, HostServices, PermissionGate, ServiceAccessor};
