//! PluginHost
//!
//! 插件宿主的对外接口，把各子系统组装在一起：
//!
//! - 请求流水线：在各扩展点分发钩子
//! - 事件：发布与订阅统计
//! - 模块管理：批量加载、单模块加载卸载、配置下发、热重载
//! - 运维查询：模块列表、健康、依赖图、重载历史
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_plugin_core::{HookContext, HookType, HostConfig, PluginHost};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HostConfig::builder()
//!         .operation_timeout_ms(5_000)
//!         .reload_queue_size(256)
//!         .build();
//!
//!     let host = PluginHost::new(config)?;
//!     host.load_all(Vec::new()).await?;
//!
//!     let mut ctx = HookContext::new(HookType::PreDispatch).with_target("auth");
//!     host.dispatch(HookType::PreDispatch, &mut ctx).await?;
//!
//!     host.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bus::{DispatchStats, Event, EventBus};
use crate::core::config::HostConfig;
use crate::hooks::{HookContext, HookOutcome, HookRegistry, HookType};
use crate::module::dependency::DependencyGraph;
use crate::module::health::{HealthReport, HealthTracker, ModuleHealth};
use crate::module::lifecycle::{Collaborators, LifecycleController, HOST_SOURCE};
use crate::module::metadata::ModuleInfo;
use crate::module::plugin::{ArtifactSource, ModuleArtifact};
use crate::module::storage::{KeyValueBackend, MemoryBackend};
use crate::reload::{HotReloadCoordinator, ReloadRecord};
use crate::services::{HostService, HostServices, ServiceDirectory};
use crate::utils::logger::fields;
use crate::utils::{CoreError, Result};

/// 宿主状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// 已创建，尚未批量加载
    Created,
    /// 运行中
    Running,
    /// 正在关闭
    ShuttingDown,
    /// 已关闭
    Shutdown,
}

impl HostState {
    pub fn is_running(&self) -> bool {
        matches!(self, HostState::Running)
    }

    /// 是否还能加载模块
    pub fn accepts_modules(&self) -> bool {
        matches!(self, HostState::Created | HostState::Running)
    }
}

/// 插件宿主
pub struct PluginHost {
    config: HostConfig,
    state: RwLock<HostState>,
    hooks: Arc<HookRegistry>,
    events: Arc<EventBus>,
    services: Arc<ServiceDirectory>,
    health: Arc<HealthTracker>,
    lifecycle: Arc<LifecycleController>,
    reload: Arc<HotReloadCoordinator>,
    started_at: RwLock<Option<Instant>>,
}

impl PluginHost {
    /// 使用内存存储、无宿主服务、无制品来源创建宿主
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> PluginHostBuilder {
        PluginHostBuilder::default()
    }

    // ==================== 模块管理 ====================

    /// 批量加载并启动
    ///
    /// 成功后宿主进入 Running 并发布 `host.started`。
    pub async fn load_all(&self, artifacts: Vec<ModuleArtifact>) -> Result<Vec<String>> {
        self.ensure_accepts_modules().await?;
        let order = self.lifecycle.load_all(artifacts).await?;

        {
            let mut state = self.state.write().await;
            if *state == HostState::Created {
                *state = HostState::Running;
                *self.started_at.write().await = Some(Instant::now());
                let mut payload = serde_json::Map::new();
                payload.insert(fields::VERSION.to_string(), json!(crate::VERSION));
                payload.insert(fields::MODULES.to_string(), json!(order));
                self.events
                    .publish(Event::new("host.started", HOST_SOURCE, Value::Object(payload)))
                    .await;
                info!(modules = order.len(), "插件宿主已启动");
            }
        }
        Ok(order)
    }

    /// 加载、初始化并启动单个模块
    pub async fn load_module(&self, artifact: ModuleArtifact) -> Result<()> {
        self.ensure_accepts_modules().await?;
        let name = artifact.name().to_string();
        self.lifecycle.load(artifact).await?;
        self.lifecycle.activate(&name).await
    }

    /// 停止并卸载单个模块
    pub async fn unload_module(&self, name: &str) -> Result<()> {
        self.lifecycle.stop(name).await?;
        self.lifecycle.unload(name).await
    }

    /// 校验并下发模块配置
    pub async fn update_module_config(&self, name: &str, config: Value) -> Result<()> {
        self.lifecycle.apply_config(name, config).await
    }

    // ==================== 请求流水线 ====================

    /// 在扩展点分发钩子
    ///
    /// 流水线钩子的目标模块正在热重载时先在重载缓冲中等待，缓冲已满或等待
    /// 超时返回 `TemporarilyUnavailable`。
    pub async fn dispatch(&self, hook_type: HookType, ctx: &mut HookContext) -> Result<Vec<HookOutcome>> {
        if hook_type.is_pipeline() {
            if let Some(target) = ctx.target() {
                let target = target.to_string();
                self.reload.admit(&target).await?;
            }
        }
        Ok(self.hooks.dispatch(hook_type, ctx).await)
    }

    /// 工作单元进入模块前的准入检查
    pub async fn admit(&self, module: &str) -> Result<()> {
        self.reload.admit(module).await
    }

    // ==================== 事件 ====================

    pub async fn publish(&self, event: Event) -> usize {
        self.events.publish(event).await
    }

    /// 以宿主为来源发布事件
    pub async fn publish_named(&self, name: &str, payload: Value) -> usize {
        self.events.publish(Event::new(name, HOST_SOURCE, payload)).await
    }

    pub fn bus_stats(&self) -> DispatchStats {
        self.events.stats()
    }

    // ==================== 热重载 ====================

    /// 从制品来源取新版本并重载
    pub async fn reload(&self, name: &str) -> Result<ReloadRecord> {
        self.ensure_accepts_modules().await?;
        self.reload.reload(name).await
    }

    /// 用给定制品重载
    pub async fn reload_with(&self, artifact: ModuleArtifact) -> Result<ReloadRecord> {
        self.ensure_accepts_modules().await?;
        self.reload.reload_with(artifact).await
    }

    pub async fn reload_history(&self, name: &str) -> Vec<ReloadRecord> {
        self.reload.history_for(name).await
    }

    pub async fn is_reloading(&self, name: &str) -> bool {
        self.reload.is_reloading(name).await
    }

    /// 正在等待某模块重载完成的请求数
    pub async fn queued_requests(&self, name: &str) -> usize {
        self.reload.queued(name).await
    }

    // ==================== 运维查询 ====================

    pub async fn list_modules(&self) -> Vec<ModuleInfo> {
        self.lifecycle.list_modules().await
    }

    pub async fn get_health(&self, name: &str) -> Result<ModuleHealth> {
        self.lifecycle.module_health(name).await
    }

    /// 全部模块的健康汇总
    pub async fn check_all(&self) -> HealthReport {
        let mut modules = Vec::new();
        for info in self.lifecycle.list_modules().await {
            match self.lifecycle.module_health(&info.name).await {
                Ok(health) => modules.push(health),
                // 查询期间被卸载
                Err(e) => debug!(module = %info.name, "跳过健康检查: {}", e),
            }
        }
        HealthReport::aggregate(modules)
    }

    /// 依赖邻接表：模块 -> 它依赖的模块
    pub async fn get_dependency_graph(&self) -> BTreeMap<String, Vec<String>> {
        self.lifecycle.dependency_graph().await.adjacency()
    }

    pub async fn dependency_graph(&self) -> DependencyGraph {
        self.lifecycle.dependency_graph().await
    }

    pub async fn get_dependents(&self, name: &str) -> Vec<String> {
        self.lifecycle.dependents(name).await
    }

    // ==================== 关闭 ====================

    /// 关闭宿主：发布 `host.shutting_down`，按依赖逆序停止并卸载全部模块
    ///
    /// 单个模块的失败只记录日志。重复调用是空操作。
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if matches!(*state, HostState::ShuttingDown | HostState::Shutdown) {
                return Ok(());
            }
            *state = HostState::ShuttingDown;
        }
        info!("正在关闭插件宿主...");

        self.events
            .publish(Event::new(
                "host.shutting_down",
                HOST_SOURCE,
                json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
            ))
            .await;

        let failures = self.lifecycle.shutdown_all().await;
        if !failures.is_empty() {
            warn!(failures = failures.len(), "关闭过程中有模块失败");
        }

        *self.state.write().await = HostState::Shutdown;
        info!("插件宿主已关闭");
        Ok(())
    }

    // ==================== 访问器 ====================

    pub async fn state(&self) -> HostState {
        *self.state.read().await
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn services(&self) -> &Arc<ServiceDirectory> {
        &self.services
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    pub async fn uptime(&self) -> Option<Duration> {
        self.started_at.read().await.map(|t| t.elapsed())
    }

    async fn ensure_accepts_modules(&self) -> Result<()> {
        let state = *self.state.read().await;
        if state.accepts_modules() {
            Ok(())
        } else {
            Err(CoreError::InitFailed(format!("宿主当前状态 {:?} 不允许加载模块", state)))
        }
    }
}

/// PluginHost 构建器
#[derive(Default)]
pub struct PluginHostBuilder {
    config: HostConfig,
    host_services: HostServices,
    storage_backend: Option<Arc<dyn KeyValueBackend>>,
    source: Option<Arc<dyn ArtifactSource>>,
}

impl PluginHostBuilder {
    pub fn config(mut self, config: HostConfig) -> Self {
        self.config = config;
        self
    }

    /// 注册一个宿主服务，模块经权限网关访问
    pub fn host_service(mut self, service: Arc<dyn HostService>) -> Self {
        self.host_services.register(service);
        self
    }

    /// 模块存储后端，缺省为内存
    pub fn storage_backend(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.storage_backend = Some(backend);
        self
    }

    /// 热重载的制品来源
    pub fn artifact_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> Result<PluginHost> {
        let config = self.config;
        config.validate()?;
        info!("初始化插件宿主 v{}", crate::VERSION);

        let health = Arc::new(HealthTracker::new());
        let hooks = Arc::new(HookRegistry::new(health.clone()));
        let events = Arc::new(EventBus::new(config.events.clone(), health.clone()));
        let services = Arc::new(ServiceDirectory::new());
        debug!(capabilities = ?self.host_services.capabilities(), "宿主服务");

        let lifecycle = Arc::new(
            LifecycleController::new(
                config.lifecycle.clone(),
                Collaborators {
                    hooks: hooks.clone(),
                    events: events.clone(),
                    services: services.clone(),
                    health: health.clone(),
                    host_services: Arc::new(self.host_services),
                    storage_backend: self
                        .storage_backend
                        .unwrap_or_else(|| Arc::new(MemoryBackend::new())),
                },
            )
            .with_module_configs(config.modules.clone()),
        );

        let mut coordinator = HotReloadCoordinator::new(config.hot_reload.clone(), lifecycle.clone());
        if let Some(source) = self.source {
            coordinator = coordinator.with_source(source);
        }

        Ok(PluginHost {
            config,
            state: RwLock::new(HostState::Created),
            hooks,
            events,
            services,
            health,
            lifecycle,
            reload: Arc::new(coordinator),
            started_at: RwLock::new(None),
        })
    }
}
