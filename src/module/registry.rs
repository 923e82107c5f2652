//! 模块实例注册表
//!
//! 保存所有已加载的模块实例，保证模块名唯一。状态只由生命周期控制器修改。
//!
//! 每个实例有一个递增的代次（generation）。热重载后旧实例持有的上下文代次
//! 与注册表不一致，它发起的注册和故障上报都会被拒绝。

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::module::context::ModuleContext;
use crate::module::metadata::{ModuleDescriptor, ModuleState, PermissionGrant};
use crate::module::plugin::{Module, ModuleArtifact};
use crate::utils::{CoreError, Result};

/// 已加载的模块实例
#[derive(Clone)]
pub struct ModuleInstance {
    pub descriptor: ModuleDescriptor,
    pub module: Arc<dyn Module>,
    /// 构造该实例的制品，回滚时复用
    pub artifact: ModuleArtifact,
    pub state: ModuleState,
    pub grant: PermissionGrant,
    pub loaded_at: DateTime<Utc>,
    pub generation: u64,
    pub context: ModuleContext,
}

impl ModuleInstance {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("name", &self.descriptor.name)
            .field("version", &self.descriptor.version.to_string())
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish()
    }
}

/// 模块实例注册表
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    /// 模块名 -> 实例
    instances: RwLock<HashMap<String, ModuleInstance>>,
    generation: AtomicU64,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配新的实例代次
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 插入实例，重名时拒绝
    pub async fn insert(&self, instance: ModuleInstance) -> Result<()> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(instance.name()) {
            return Err(CoreError::ModuleAlreadyLoaded(instance.name().to_string()));
        }
        debug!(module = %instance.name(), generation = instance.generation, "实例已登记");
        instances.insert(instance.name().to_string(), instance);
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Option<ModuleInstance> {
        self.instances.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<ModuleInstance> {
        self.instances.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.instances.read().await.contains_key(name)
    }

    pub async fn state(&self, name: &str) -> Option<ModuleState> {
        self.instances.read().await.get(name).map(|i| i.state)
    }

    /// 条件转换：当前状态满足 `allowed` 时切换到 `to`，返回原状态
    pub async fn transition(
        &self,
        name: &str,
        action: &str,
        allowed: fn(&ModuleState) -> bool,
        to: ModuleState,
    ) -> Result<ModuleState> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
        if !allowed(&instance.state) {
            return Err(CoreError::InvalidStateTransition {
                module: name.to_string(),
                from: instance.state.to_string(),
                action: action.to_string(),
            });
        }
        let from = instance.state;
        instance.state = to;
        debug!(module = %name, from = %from, to = %to, "状态转换");
        Ok(from)
    }

    /// 指定代次的实例转入 `to`，并在持有写锁期间执行 `release`
    ///
    /// 持锁期间新实例无法插入，旧上下文的注册检查要等 `release` 结束后才能
    /// 读到新状态，因此不会再有该代次的注册遗留下来。代次不一致或 `allowed`
    /// 不成立时什么也不做，返回 false。
    pub async fn retire<F, Fut>(
        &self,
        name: &str,
        generation: u64,
        allowed: fn(&ModuleState) -> bool,
        to: ModuleState,
        release: F,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut instances = self.instances.write().await;
        match instances.get_mut(name) {
            Some(instance) if instance.generation == generation && allowed(&instance.state) => {
                debug!(module = %name, from = %instance.state, to = %to, "状态转换");
                instance.state = to;
            }
            _ => return false,
        }
        release().await;
        true
    }

    /// 该代次是否仍是当前实例
    pub async fn is_current(&self, name: &str, generation: u64) -> bool {
        self.instances
            .read()
            .await
            .get(name)
            .is_some_and(|i| i.generation == generation)
    }

    /// 该代次是否还能注册钩子、订阅与导出
    pub async fn accepts_registrations(&self, name: &str, generation: u64) -> bool {
        self.instances.read().await.get(name).is_some_and(|i| {
            i.generation == generation
                && matches!(
                    i.state,
                    ModuleState::Loading | ModuleState::Initialized | ModuleState::Running
                )
        })
    }

    /// 模块名（已排序）
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn descriptors(&self) -> Vec<ModuleDescriptor> {
        let mut descriptors: Vec<ModuleDescriptor> = self
            .instances
            .read()
            .await
            .values()
            .map(|i| i.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// 全部实例快照（按名称排序）
    pub async fn snapshot(&self) -> Vec<ModuleInstance> {
        let mut all: Vec<ModuleInstance> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.descriptor.name.cmp(&b.descriptor.name));
        all
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}
