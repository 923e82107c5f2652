//! 模块上下文
//!
//! 生命周期控制器为每个实例创建一个上下文，传给 `initialize`、`start`、`stop`
//! 等回调。模块只能通过它接触钩子注册表、事件总线、服务目录、自己的存储和
//! 经过权限网关的宿主服务。
//!
//! 上下文绑定实例代次：实例被停止或被热重载替换后，旧上下文上的注册请求
//! 返回 `InvalidStateTransition`，故障上报被忽略。

use std::any::Any;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::bus::{Event, EventBus, EventHandler};
use crate::hooks::{HookCallback, HookContext, HookRegistry, HookType};
use crate::module::health::HealthTracker;
use crate::module::metadata::ModuleState;
use crate::module::registry::ModuleRegistry;
use crate::module::storage::ModuleStorage;
use crate::services::{PermissionGate, ServiceDirectory, ServiceHandle};
use crate::utils::{CoreError, Result};

/// 上下文依赖的共享组件
#[derive(Clone)]
pub(crate) struct SharedComponents {
    pub hooks: Arc<HookRegistry>,
    pub events: Arc<EventBus>,
    pub services: Arc<ServiceDirectory>,
    pub health: Arc<HealthTracker>,
    pub registry: Weak<ModuleRegistry>,
}

/// 传给模块回调的作用域上下文
#[derive(Clone)]
pub struct ModuleContext {
    module: String,
    generation: u64,
    config: Arc<RwLock<Value>>,
    storage: ModuleStorage,
    gate: PermissionGate,
    shared: SharedComponents,
}

impl ModuleContext {
    pub(crate) fn new(
        module: &str,
        generation: u64,
        config: Value,
        storage: ModuleStorage,
        gate: PermissionGate,
        shared: SharedComponents,
    ) -> Self {
        Self {
            module: module.to_string(),
            generation,
            config: Arc::new(RwLock::new(config)),
            storage,
            gate,
            shared,
        }
    }

    /// 所属模块名
    pub fn module_name(&self) -> &str {
        &self.module
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn ensure_live(&self, action: &str) -> Result<()> {
        let registry = self
            .shared
            .registry
            .upgrade()
            .ok_or_else(|| CoreError::Internal("宿主已关闭".to_string()))?;
        if registry.accepts_registrations(&self.module, self.generation).await {
            return Ok(());
        }
        let from = if registry.is_current(&self.module, self.generation).await {
            registry
                .state(&self.module)
                .await
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unloaded".to_string())
        } else {
            "replaced".to_string()
        };
        Err(CoreError::InvalidStateTransition {
            module: self.module.clone(),
            from,
            action: action.to_string(),
        })
    }

    // ==================== 钩子 ====================

    /// 注册钩子回调，返回句柄
    pub async fn register_hook(
        &self,
        hook_type: HookType,
        priority: i32,
        callback: HookCallback,
    ) -> Result<String> {
        self.ensure_live("register_hook").await?;
        let handle = self
            .shared
            .hooks
            .register(hook_type, priority, &self.module, callback)
            .await;
        // 注册期间实例可能已被停止
        if let Err(e) = self.ensure_live("register_hook").await {
            let _ = self.shared.hooks.unregister(&handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    pub async fn unregister_hook(&self, handle: &str) -> Result<()> {
        self.shared.hooks.unregister(handle).await
    }

    // ==================== 事件 ====================

    /// 订阅事件，返回订阅 ID
    pub async fn subscribe(&self, pattern: &str, handler: EventHandler) -> Result<String> {
        self.ensure_live("subscribe").await?;
        let id = self
            .shared
            .events
            .subscribe(&self.module, pattern, handler)
            .await;
        if let Err(e) = self.ensure_live("subscribe").await {
            let _ = self.shared.events.unsubscribe(&id).await;
            return Err(e);
        }
        Ok(id)
    }

    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        self.shared.events.unsubscribe(id).await
    }

    /// 以本模块为来源发布事件，立即返回入队的订阅者数量
    pub async fn publish(&self, name: &str, payload: Value) -> Result<usize> {
        self.ensure_live("publish").await?;
        Ok(self
            .shared
            .events
            .publish(Event::new(name, self.module.as_str(), payload))
            .await)
    }

    // ==================== 服务目录 ====================

    pub async fn export(&self, name: &str, handle: ServiceHandle) -> Result<()> {
        self.ensure_live("export").await?;
        self.shared.services.export(&self.module, name, handle).await?;
        if let Err(e) = self.ensure_live("export").await {
            self.shared.services.unexport(&self.module, name).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn lookup(&self, owner: &str, name: &str) -> Result<ServiceHandle> {
        self.shared.services.lookup(&self.module, owner, name).await
    }

    pub async fn lookup_as<T: Any + Send + Sync>(&self, owner: &str, name: &str) -> Result<Arc<T>> {
        self.shared
            .services
            .lookup_as::<T>(&self.module, owner, name)
            .await
    }

    // ==================== 存储、宿主服务、配置 ====================

    pub fn storage(&self) -> &ModuleStorage {
        &self.storage
    }

    /// 经过权限网关的宿主服务
    pub fn host(&self) -> &PermissionGate {
        &self.gate
    }

    /// 当前配置
    pub async fn config(&self) -> Value {
        self.config.read().await.clone()
    }

    pub async fn config_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.config().await)?)
    }

    pub(crate) async fn replace_config(&self, config: Value) {
        *self.config.write().await = config;
    }

    // ==================== 故障上报 ====================

    /// 模块自行上报致命故障：实例转入 Error、失去全部注册，并分发 `OnError` 钩子
    ///
    /// 已被替换或已停止的实例上报时忽略，返回 false。
    pub async fn report_failure(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let Some(registry) = self.shared.registry.upgrade() else {
            return false;
        };
        let shared = &self.shared;
        let module = self.module.as_str();
        let retired = registry
            .retire(module, self.generation, ModuleState::can_fail, ModuleState::Error, || async move {
                shared.hooks.unregister_all(module).await;
                shared.events.unsubscribe_all(module).await;
                shared.services.unregister_all(module).await;
            })
            .await;
        if !retired {
            debug!(module = %self.module, generation = self.generation, "忽略过期实例的故障上报");
            return false;
        }

        error!(module = %self.module, generation = self.generation, reason = %reason, "模块上报故障");
        self.shared
            .health
            .record_error(&self.module, format!("模块上报故障: {}", reason))
            .await;

        let mut hook_ctx = HookContext::new(HookType::OnError)
            .with_target(self.module.as_str())
            .with_error(reason);
        self.shared.hooks.dispatch(HookType::OnError, &mut hook_ctx).await;
        true
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module", &self.module)
            .field("generation", &self.generation)
            .finish()
    }
}
