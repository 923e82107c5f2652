//! # Chips Plugin Core - 薯片插件编排内核
//!
//! 在一个宿主进程内加载、连接并管理一组相互独立开发的模块：
//!
//! - **依赖解析**: 按声明的依赖与版本约束计算加载顺序，拒绝缺失、不兼容与循环依赖
//! - **生命周期**: Load → Initialize → Start → Stop → Unload 状态机，每步有超时并隔离失败
//! - **钩子**: 生命周期与请求流水线扩展点，按优先级分发
//! - **事件总线**: 发布即返回，每个订阅者按序投递
//! - **服务目录与权限网关**: 模块间服务导出，宿主服务按授予的能力访问
//! - **热重载**: 替换运行中的模块，失败时回滚，重载窗口内的请求排队等待
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_plugin_core::{HostConfig, PluginHost};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = PluginHost::new(HostConfig::default())?;
//!     host.load_all(Vec::new()).await?;
//!
//!     println!("{:?}", host.check_all().await.status);
//!     host.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 模块描述、依赖解析、生命周期与存储
//! - `hooks` - 钩子注册与分发
//! - `bus` - 事件总线
//! - `services` - 服务目录与权限网关
//! - `reload` - 热重载
//! - `core` - 宿主配置
//! - `utils` - 错误类型、日志与工具函数
//! - `api` - 宿主接口

#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod bus;
pub mod core;
pub mod hooks;
pub mod module;
pub mod reload;
pub mod services;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{HostState, PluginHost, PluginHostBuilder};

pub use bus::{handler, DispatchStats, Event, EventBus, EventHandler};

pub use hooks::{HookCallback, HookContext, HookOutcome, HookRegistry, HookResult, HookType};

pub use module::{
    ArtifactSource, Capability, ConfigSchema, DependencyGraph, DependencyResolver, DependencySpec,
    HealthReport, HealthStatus, ManifestFormat, ManifestParser, Module, ModuleArtifact,
    ModuleContext, ModuleDescriptor, ModuleHealth, ModuleInfo, ModuleState, PermissionGrant,
    StaticArtifactSource,
};

pub use reload::{HotReloadCoordinator, ReloadOutcome, ReloadRecord};

pub use services::{HostService, HostServices, PermissionGate, ServiceDirectory, ServiceHandle};

pub use utils::{error_code, generate_id, generate_uuid, status_code, CoreError, ErrorKind, Result};
pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{
    EventConfig, HostConfig, HostConfigBuilder, HotReloadConfig, LifecycleConfig, LogConfig,
};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
