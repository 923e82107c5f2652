//! 模块契约
//!
//! 外部加载器把清单解析为 [`ModuleDescriptor`]，连同一个能构造模块实例的工厂
//! 打包成 [`ModuleArtifact`] 交给内核。内核只通过 [`Module`] trait 与模块交互。
//!
//! # 示例
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use chips_plugin_core::module::{Module, ModuleArtifact, ModuleContext, ModuleDescriptor};
//! use chips_plugin_core::hooks::{HookContext, HookType};
//! use std::sync::Arc;
//!
//! struct Audit;
//!
//! #[async_trait]
//! impl Module for Audit {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     fn version(&self) -> semver::Version {
//!         semver::Version::new(1, 0, 0)
//!     }
//!
//!     async fn initialize(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
//!         ctx.register_hook(HookType::PostDispatch, 10, Arc::new(|hook: &mut HookContext| {
//!             tracing::info!(target = ?hook.target(), "请求已处理");
//!             Ok(())
//!         }))
//!         .await?;
//!         Ok(())
//!     }
//! }
//!
//! let descriptor = ModuleDescriptor::parse("audit", "1.0.0").unwrap();
//! let artifact = ModuleArtifact::new(descriptor, || Ok(Arc::new(Audit)));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::module::context::ModuleContext;
use crate::module::metadata::{ConfigSchema, DependencySpec, ModuleDescriptor};
use crate::utils::{CoreError, Result};

/// 模块生命周期契约
///
/// 所有回调都可能被内核的操作超时打断。`initialize` 只做注册，不启动后台任务；
/// 后台任务和连接在 `start` 中建立，在 `stop` 中结束。`stop` 可能被调用多次。
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> Version;

    /// 模块自己声明的依赖；非空时必须与清单一致
    fn dependencies(&self) -> Vec<DependencySpec> {
        Vec::new()
    }

    /// 注册钩子、订阅与导出
    async fn initialize(&self, ctx: &ModuleContext) -> anyhow::Result<()>;

    async fn start(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// 模块自带的配置模式，清单中声明的模式优先
    fn config_schema(&self) -> Option<ConfigSchema> {
        None
    }

    /// 运行中收到新配置（已通过模式校验）
    async fn on_config_change(&self, _ctx: &ModuleContext, _config: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 模块实例工厂
pub type ModuleFactory = Arc<dyn Fn() -> anyhow::Result<Arc<dyn Module>> + Send + Sync>;

/// 可加载的模块制品：描述 + 实例工厂
///
/// 热重载时旧制品被缓存，回滚时用它重新构造实例。
#[derive(Clone)]
pub struct ModuleArtifact {
    pub descriptor: ModuleDescriptor,
    factory: ModuleFactory,
}

impl ModuleArtifact {
    pub fn new<F>(descriptor: ModuleDescriptor, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn version(&self) -> &Version {
        &self.descriptor.version
    }

    /// 构造实例并核对名称、版本与依赖声明
    pub fn instantiate(&self) -> Result<Arc<dyn Module>> {
        let module = (self.factory)().map_err(|e| CoreError::LifecycleFailed {
            module: self.descriptor.name.clone(),
            phase: "load".to_string(),
            reason: format!("{:#}", e),
        })?;

        let mut problems = Vec::new();
        if module.name() != self.descriptor.name {
            problems.push(format!("实例名称 '{}' 与清单不一致", module.name()));
        }
        if module.version() != self.descriptor.version {
            problems.push(format!(
                "实例版本 {} 与清单版本 {} 不一致",
                module.version(),
                self.descriptor.version
            ));
        }
        let declared = module.dependencies();
        if !declared.is_empty() {
            for dep in declared.iter().filter(|d| !self.descriptor.dependencies.contains(d)) {
                problems.push(format!("实例声明的依赖 '{} {}' 不在清单中", dep.name, dep.constraint));
            }
            for dep in self.descriptor.dependencies.iter().filter(|d| !declared.contains(d)) {
                problems.push(format!("清单依赖 '{} {}' 未被实例声明", dep.name, dep.constraint));
            }
        }
        if !problems.is_empty() {
            return Err(CoreError::InvalidManifest {
                module: self.descriptor.name.clone(),
                reason: problems.join("; "),
            });
        }
        Ok(module)
    }
}

impl std::fmt::Debug for ModuleArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleArtifact")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version.to_string())
            .finish()
    }
}

/// 制品来源，热重载时从这里取更新后的制品
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(&self, name: &str) -> anyhow::Result<ModuleArtifact>;
}

/// 内存中的制品表
#[derive(Debug, Default)]
pub struct StaticArtifactSource {
    artifacts: RwLock<HashMap<String, ModuleArtifact>>,
}

impl StaticArtifactSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入（或替换）制品
    pub async fn put(&self, artifact: ModuleArtifact) {
        self.artifacts
            .write()
            .await
            .insert(artifact.descriptor.name.clone(), artifact);
    }
}

#[async_trait]
impl ArtifactSource for StaticArtifactSource {
    async fn fetch(&self, name: &str) -> anyhow::Result<ModuleArtifact> {
        self.artifacts
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("没有模块 '{}' 的制品", name))
    }
}
