//! 模块管理
//!
//! - `metadata` - 模块描述、能力、状态等数据类型
//! - `parser` - 清单解析
//! - `dependency` - 依赖图与解析器
//! - `plugin` - 模块契约与制品
//! - `context` - 传给模块回调的作用域上下文
//! - `registry` - 实例注册表
//! - `storage` - 模块隔离存储
//! - `health` - 健康与指标
//! - `lifecycle` - 生命周期控制器

pub mod context;
pub mod dependency;
pub mod health;
pub mod lifecycle;
pub mod metadata;
pub mod parser;
pub mod plugin;
pub mod registry;
pub mod storage;

// 重导出常用类型
pub use context::ModuleContext;
pub use dependency::{DependencyEdge, DependencyGraph, DependencyResolver, LoadPlan, OmittedDependency};
pub use health::{HealthCounters, HealthReport, HealthTracker, ModuleHealth};
pub use lifecycle::{Collaborators, LifecycleController};
pub use metadata::{
    Capability, ConfigSchema, DependencySpec, HealthStatus, ModuleDescriptor, ModuleInfo,
    ModuleState, PermissionGrant,
};
pub use parser::{ManifestFormat, ManifestParser};
pub use plugin::{ArtifactSource, Module, ModuleArtifact, ModuleFactory, StaticArtifactSource};
pub use registry::{ModuleInstance, ModuleRegistry};
pub use storage::{KeyValueBackend, MemoryBackend, ModuleStorage};
