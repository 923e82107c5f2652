//! 生命周期控制器
//!
//! 驱动每个模块实例走完状态机：
//!
//! ```text
//! Unloaded → Loading → Initialized → Running → Stopped → Unloaded
//!               │           │           │
//!               └───────────┴───────────┴──→ Error
//! ```
//!
//! - 每次调用模块代码（initialize/start/stop/cleanup/on_config_change）都受
//!   操作超时约束，超时或失败的实例转入 Error 并分发 `OnError` 钩子。
//! - 实例转入 Stopped 或 Error 时，在同一次状态写入中批量注销该模块的钩子、
//!   订阅与导出；对已停止的实例再次 `stop` 是空操作。
//! - 批量加载按依赖顺序执行，任一模块初始化或启动失败即停止后续步骤。
//! - 全量关闭按加载顺序的逆序执行，单个模块失败只记录，不影响其它模块。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{Event, EventBus};
use crate::core::config::LifecycleConfig;
use crate::hooks::registry::panic_message;
use crate::hooks::{HookContext, HookRegistry, HookType};
use crate::module::context::{ModuleContext, SharedComponents};
use crate::module::dependency::{DependencyEdge, DependencyGraph, DependencyResolver};
use crate::module::health::{HealthTracker, ModuleHealth};
use crate::module::metadata::{ModuleInfo, ModuleState};
use crate::module::plugin::ModuleArtifact;
use crate::module::registry::{ModuleInstance, ModuleRegistry};
use crate::module::storage::{KeyValueBackend, ModuleStorage};
use crate::services::{HostServices, PermissionGate, ServiceDirectory};
use crate::utils::logger::fields;
use crate::utils::{CoreError, Result};

/// 宿主发布生命周期事件时使用的来源名
pub const HOST_SOURCE: &str = "host";

/// 控制器协作的共享组件
#[derive(Clone)]
pub struct Collaborators {
    pub hooks: Arc<HookRegistry>,
    pub events: Arc<EventBus>,
    pub services: Arc<ServiceDirectory>,
    pub health: Arc<HealthTracker>,
    pub host_services: Arc<HostServices>,
    pub storage_backend: Arc<dyn KeyValueBackend>,
}

/// 生命周期控制器
pub struct LifecycleController {
    config: LifecycleConfig,
    registry: Arc<ModuleRegistry>,
    parts: Collaborators,
    /// 模块名 -> 当前配置
    module_configs: RwLock<HashMap<String, Value>>,
}

impl LifecycleController {
    pub fn new(config: LifecycleConfig, parts: Collaborators) -> Self {
        info!(operation_timeout_ms = config.operation_timeout_ms, "创建生命周期控制器");
        Self {
            config,
            registry: Arc::new(ModuleRegistry::new()),
            parts,
            module_configs: RwLock::new(HashMap::new()),
        }
    }

    /// 设置初始的模块配置
    pub fn with_module_configs(mut self, configs: HashMap<String, Value>) -> Self {
        self.module_configs = RwLock::new(configs);
        self
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.parts.health
    }

    // ==================== 单模块转换 ====================

    /// 加载：创建实例并进入 Loading
    ///
    /// 只检查与该模块相连的依赖边：必需依赖必须已加载且版本满足约束。
    #[instrument(skip_all, fields(module = %artifact.name()))]
    pub async fn load(&self, artifact: ModuleArtifact) -> Result<()> {
        let mut descriptor = artifact.descriptor.clone();
        descriptor
            .validate()
            .map_err(|problems| CoreError::InvalidManifest {
                module: descriptor.name.clone(),
                reason: problems.join("; "),
            })?;

        let name = descriptor.name.clone();
        if self.registry.contains(&name).await {
            return Err(CoreError::ModuleAlreadyLoaded(name));
        }
        DependencyResolver::recheck_module(&descriptor, &self.registry.descriptors().await)?;

        let module = artifact.instantiate()?;
        if descriptor.config_schema.is_none() {
            descriptor.config_schema = module.config_schema();
        }

        let config = self
            .module_configs
            .read()
            .await
            .get(&name)
            .cloned()
            .unwrap_or_else(|| json!({}));
        descriptor.validate_config(&config)?;

        let generation = self.registry.next_generation();
        let grant = descriptor.grant();
        let storage = ModuleStorage::new(&name, self.parts.storage_backend.clone());
        let gate = PermissionGate::new(
            name.as_str(),
            grant.clone(),
            self.parts.host_services.clone(),
            self.parts.health.clone(),
        );
        let context = ModuleContext::new(&name, generation, config, storage, gate, self.shared());

        let version = descriptor.version.to_string();
        self.registry
            .insert(ModuleInstance {
                descriptor,
                module,
                artifact,
                state: ModuleState::Loading,
                grant,
                loaded_at: chrono::Utc::now(),
                generation,
                context,
            })
            .await?;

        info!(module = %name, version = %version, generation, "模块已加载");
        Ok(())
    }

    /// Loading → Initialized
    #[instrument(skip(self))]
    pub async fn initialize(&self, name: &str) -> Result<()> {
        let instance = self.instance_in(name, "initialize", ModuleState::can_initialize).await?;
        let ctx = instance.context.clone();
        let module = instance.module.clone();

        let result = self
            .run_phase(name, "initialize", async move { module.initialize(&ctx).await })
            .await;
        match result {
            Ok(()) => {
                self.registry
                    .transition(name, "initialize", ModuleState::can_initialize, ModuleState::Initialized)
                    .await?;
                info!(module = %name, "模块已初始化");
                Ok(())
            }
            Err(e) => Err(self.mark_failed(&instance, "initialize", e).await),
        }
    }

    /// Initialized → Running
    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<()> {
        let instance = self.instance_in(name, "start", ModuleState::can_start).await?;
        let ctx = instance.context.clone();
        let module = instance.module.clone();

        let result = self
            .run_phase(name, "start", async move { module.start(&ctx).await })
            .await;
        match result {
            Ok(()) => {
                self.registry
                    .transition(name, "start", ModuleState::can_start, ModuleState::Running)
                    .await?;
                info!(module = %name, version = %instance.descriptor.version, "模块已启动");
                self.announce("module.started", &instance).await;
                Ok(())
            }
            Err(e) => Err(self.mark_failed(&instance, "start", e).await),
        }
    }

    /// → Stopped，并在同一次状态写入中批量注销钩子、订阅与导出
    ///
    /// 已停止的实例再次停止直接返回成功。Stop 回调失败时实例转入 Error，
    /// 注销照常执行。进入 Error 的实例（回调失败或模块上报故障）同样立即
    /// 失去全部注册。
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        let instance = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;

        if instance.state == ModuleState::Stopped {
            debug!(module = %name, "模块已停止，跳过");
            return Ok(());
        }
        if !instance.state.can_stop() {
            return Err(CoreError::InvalidStateTransition {
                module: name.to_string(),
                from: instance.state.to_string(),
                action: "stop".to_string(),
            });
        }

        let ctx = instance.context.clone();
        let module = instance.module.clone();
        let result = self
            .run_phase(name, "stop", async move { module.stop(&ctx).await })
            .await;

        match result {
            Ok(()) => {
                self.registry
                    .retire(
                        name,
                        instance.generation,
                        ModuleState::can_stop,
                        ModuleState::Stopped,
                        || self.release_registrations(name),
                    )
                    .await;
                info!(module = %name, "模块已停止");
                self.announce("module.stopped", &instance).await;
                Ok(())
            }
            Err(e) => Err(self.mark_failed(&instance, "stop", e).await),
        }
    }

    /// → Unloaded：调用 Cleanup、释放存储并移除实例
    ///
    /// 仍有已加载模块以必需依赖指向它时拒绝。
    #[instrument(skip(self))]
    pub async fn unload(&self, name: &str) -> Result<()> {
        let dependents = self.required_dependents(name).await;
        if !dependents.is_empty() {
            return Err(CoreError::ModuleHasDependents {
                module: name.to_string(),
                dependents,
            });
        }
        self.unload_instance(name, true).await
    }

    /// 卸载实例
    ///
    /// `forget` 为 false 时保留健康计数（热重载替换）。Cleanup 失败只记录，
    /// 实例仍被移除。
    pub(crate) async fn unload_instance(&self, name: &str, forget: bool) -> Result<()> {
        let instance = self.instance_in(name, "unload", ModuleState::can_unload).await?;

        let ctx = instance.context.clone();
        let module = instance.module.clone();
        if let Err(e) = self
            .run_phase(name, "cleanup", async move { module.cleanup(&ctx).await })
            .await
        {
            warn!(module = %name, error_code = e.error_code(), "{}", e);
            self.parts.health.record_error(name, e.to_string()).await;
        }

        // Loading 或初始化失败的实例也可能留有注册
        self.release_registrations(name).await;
        instance.context.storage().release();
        self.registry.remove(name).await;

        if forget {
            self.parts.health.forget(name).await;
        }
        info!(module = %name, "模块已卸载");
        Ok(())
    }

    /// Initialize + Start
    pub async fn activate(&self, name: &str) -> Result<()> {
        self.initialize(name).await?;
        self.start(name).await
    }

    // ==================== 批量操作 ====================

    /// 批量加载
    ///
    /// 与已加载模块一起解析依赖，按解析顺序依次 load、initialize；全部初始化
    /// 后分发 `ProcessStart` 钩子，再依次 start。任一步失败立即返回，已完成的
    /// 模块保持当前状态，失败的模块处于 Error。
    #[instrument(skip_all, fields(count = artifacts.len()))]
    pub async fn load_all(&self, artifacts: Vec<ModuleArtifact>) -> Result<Vec<String>> {
        for artifact in &artifacts {
            artifact
                .descriptor
                .validate()
                .map_err(|problems| CoreError::InvalidManifest {
                    module: artifact.descriptor.name.clone(),
                    reason: problems.join("; "),
                })?;
        }

        let mut descriptors = self.registry.descriptors().await;
        descriptors.extend(artifacts.iter().map(|a| a.descriptor.clone()));
        let plan = DependencyResolver::resolve(&descriptors)?;
        for omitted in &plan.omitted_optional {
            info!(
                module = %omitted.module,
                dependency = %omitted.dependency,
                reason = %omitted.reason,
                "可选依赖未建立"
            );
        }

        let mut pending: HashMap<String, ModuleArtifact> = artifacts
            .into_iter()
            .map(|a| (a.descriptor.name.clone(), a))
            .collect();
        let mut batch = Vec::with_capacity(pending.len());
        for name in &plan.order {
            if let Some(artifact) = pending.remove(name) {
                batch.push(name.clone());
                self.load(artifact).await?;
            }
        }
        info!(order = ?batch, "加载顺序");

        for name in &batch {
            self.initialize(name).await?;
        }

        let mut hook_ctx = HookContext::new(HookType::ProcessStart).with_data("modules", json!(batch));
        self.parts
            .hooks
            .dispatch(HookType::ProcessStart, &mut hook_ctx)
            .await;

        for name in &batch {
            self.start(name).await?;
        }

        info!(count = batch.len(), "批量加载完成");
        Ok(batch)
    }

    /// 全量关闭
    ///
    /// 分发 `ProcessShutdown` 钩子后按依赖逆序停止并卸载全部模块，
    /// 返回过程中遇到的错误。
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self) -> Vec<CoreError> {
        let order = self.shutdown_order().await;
        info!(order = ?order, "开始关闭全部模块");

        let mut hook_ctx = HookContext::new(HookType::ProcessShutdown).with_data("modules", json!(order));
        self.parts
            .hooks
            .dispatch(HookType::ProcessShutdown, &mut hook_ctx)
            .await;

        let mut failures = Vec::new();
        for name in &order {
            if self.registry.state(name).await == Some(ModuleState::Loading) {
                continue;
            }
            if let Err(e) = self.stop(name).await {
                warn!(module = %name, error_code = e.error_code(), "关闭时停止模块失败: {}", e);
                failures.push(e);
            }
        }
        for name in &order {
            if let Err(e) = self.unload_instance(name, true).await {
                warn!(module = %name, error_code = e.error_code(), "关闭时卸载模块失败: {}", e);
                failures.push(e);
            }
        }

        info!(failures = failures.len(), "全部模块已关闭");
        failures
    }

    /// 关闭顺序：加载顺序的逆序
    pub async fn shutdown_order(&self) -> Vec<String> {
        let descriptors = self.registry.descriptors().await;
        let mut order = match DependencyResolver::resolve(&descriptors) {
            Ok(plan) => plan.order,
            Err(e) => {
                warn!("关闭顺序解析失败，按名称顺序关闭: {}", e);
                descriptors.into_iter().map(|d| d.name).collect()
            }
        };
        order.reverse();
        order
    }

    // ==================== 配置 ====================

    /// 校验并下发新配置
    ///
    /// 运行中或已初始化的模块会收到 `on_config_change`，回调失败时保留旧配置。
    #[instrument(skip(self, config))]
    pub async fn apply_config(&self, name: &str, config: Value) -> Result<()> {
        let instance = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
        instance.descriptor.validate_config(&config)?;

        if matches!(instance.state, ModuleState::Initialized | ModuleState::Running) {
            let ctx = instance.context.clone();
            let module = instance.module.clone();
            let value = config.clone();
            if let Err(e) = self
                .run_phase(name, "config_change", async move {
                    module.on_config_change(&ctx, value).await
                })
                .await
            {
                warn!(module = %name, error_code = e.error_code(), "{}", e);
                self.parts.health.record_error(name, e.to_string()).await;
                return Err(e);
            }
        }

        instance.context.replace_config(config.clone()).await;
        self.module_configs
            .write()
            .await
            .insert(name.to_string(), config);
        info!(module = %name, "模块配置已更新");
        Ok(())
    }

    // ==================== 查询 ====================

    pub async fn instance(&self, name: &str) -> Option<ModuleInstance> {
        self.registry.get(name).await
    }

    pub async fn state(&self, name: &str) -> Option<ModuleState> {
        self.registry.state(name).await
    }

    pub async fn list_modules(&self) -> Vec<ModuleInfo> {
        let mut infos = Vec::new();
        for instance in self.registry.snapshot().await {
            let counters = self.parts.health.counters(instance.name()).await;
            let desc = &instance.descriptor;
            infos.push(ModuleInfo {
                name: desc.name.clone(),
                version: desc.version.to_string(),
                state: instance.state,
                priority: desc.priority,
                dependencies: desc.dependencies.iter().map(|d| d.name.clone()).collect(),
                permissions: instance.grant.iter().map(|c| c.to_string()).collect(),
                loaded_at: instance.loaded_at,
                error_count: counters.error_count,
                last_error: counters.last_error,
            });
        }
        infos
    }

    pub async fn module_health(&self, name: &str) -> Result<ModuleHealth> {
        let instance = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
        let counters = self.parts.health.counters(name).await;
        Ok(ModuleHealth::new(
            name,
            &instance.descriptor.version.to_string(),
            instance.state,
            counters,
        ))
    }

    /// 已加载模块之间的依赖图
    pub async fn dependency_graph(&self) -> DependencyGraph {
        let descriptors = self.registry.descriptors().await;
        let mut graph = DependencyGraph::new();
        for desc in &descriptors {
            graph.add_module(&desc.name, desc.priority);
        }
        for desc in &descriptors {
            for dep in &desc.dependencies {
                if graph.contains_module(&dep.name) {
                    graph.add_edge(DependencyEdge {
                        from: desc.name.clone(),
                        to: dep.name.clone(),
                        constraint: dep.constraint.clone(),
                        optional: dep.optional,
                    });
                }
            }
        }
        graph
    }

    /// 直接依赖该模块的已加载模块（含可选依赖）
    pub async fn dependents(&self, name: &str) -> Vec<String> {
        self.dependency_graph().await.get_dependents(name)
    }

    async fn required_dependents(&self, name: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .registry
            .descriptors()
            .await
            .into_iter()
            .filter(|d| d.name != name)
            .filter(|d| d.dependencies.iter().any(|dep| dep.name == name && !dep.optional))
            .map(|d| d.name)
            .collect();
        dependents.sort();
        dependents
    }

    // ==================== 内部 ====================

    fn shared(&self) -> SharedComponents {
        SharedComponents {
            hooks: self.parts.hooks.clone(),
            events: self.parts.events.clone(),
            services: self.parts.services.clone(),
            health: self.parts.health.clone(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    async fn instance_in(
        &self,
        name: &str,
        action: &str,
        allowed: fn(&ModuleState) -> bool,
    ) -> Result<ModuleInstance> {
        let instance = self
            .registry
            .get(name)
            .await
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))?;
        if !allowed(&instance.state) {
            return Err(CoreError::InvalidStateTransition {
                module: name.to_string(),
                from: instance.state.to_string(),
                action: action.to_string(),
            });
        }
        Ok(instance)
    }

    /// 在超时与 panic 隔离下执行一次模块回调
    async fn run_phase<F>(&self, name: &str, phase: &str, fut: F) -> Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send,
    {
        let started = Instant::now();
        let outcome = timeout(self.config.operation_timeout(), AssertUnwindSafe(fut).catch_unwind()).await;
        let duration_us = started.elapsed().as_micros() as u64;

        match outcome {
            Ok(Ok(Ok(()))) => {
                debug!(module = %name, phase, duration_us, "生命周期回调完成");
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(CoreError::LifecycleFailed {
                module: name.to_string(),
                phase: phase.to_string(),
                reason: format!("{:#}", e),
            }),
            Ok(Err(panic)) => Err(CoreError::LifecycleFailed {
                module: name.to_string(),
                phase: phase.to_string(),
                reason: panic_message(&*panic),
            }),
            Err(_) => Err(CoreError::LifecycleTimeout {
                module: name.to_string(),
                phase: phase.to_string(),
                timeout_ms: self.config.operation_timeout_ms,
            }),
        }
    }

    /// 记录失败并把实例转入 Error
    async fn mark_failed(&self, instance: &ModuleInstance, phase: &str, err: CoreError) -> CoreError {
        let name = instance.name();
        self.registry
            .retire(
                name,
                instance.generation,
                ModuleState::can_fail,
                ModuleState::Error,
                || self.release_registrations(name),
            )
            .await;
        error!(module = %name, phase, error_code = err.error_code(), "{}", err);
        self.parts.health.record_error(name, err.to_string()).await;

        let mut hook_ctx = HookContext::new(HookType::OnError)
            .with_target(name)
            .with_error(err.to_string())
            .with_data("phase", json!(phase));
        self.parts.hooks.dispatch(HookType::OnError, &mut hook_ctx).await;
        err
    }

    async fn release_registrations(&self, name: &str) {
        let hooks = self.parts.hooks.unregister_all(name).await;
        let subscriptions = self.parts.events.unsubscribe_all(name).await;
        let exports = self.parts.services.unregister_all(name).await;
        debug!(module = %name, hooks, subscriptions, exports, "已批量注销模块注册");
    }

    async fn announce(&self, event: &str, instance: &ModuleInstance) {
        let mut payload = serde_json::Map::new();
        payload.insert(fields::MODULE.to_string(), json!(instance.name()));
        payload.insert(
            fields::VERSION.to_string(),
            json!(instance.descriptor.version.to_string()),
        );
        payload.insert(fields::GENERATION.to_string(), json!(instance.generation));
        self.parts
            .events
            .publish(Event::new(event, HOST_SOURCE, Value::Object(payload)))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EventConfig;
    use crate::module::metadata::{DependencySpec, ModuleDescriptor};
    use crate::module::plugin::Module;
    use crate::module::storage::MemoryBackend;
    use async_trait::async_trait;
    use semver::Version;
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Scripted {
        name: String,
        version: Version,
        log: Log,
        fail: Option<&'static str>,
    }

    impl Scripted {
        fn step(&self, phase: &str) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, phase));
            if self.fail == Some(phase) {
                anyhow::bail!("{} failed", phase);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Module for Scripted {
        fn name(&self) -> &str {
            &self.name
        }

        fn version(&self) -> Version {
            self.version.clone()
        }

        async fn initialize(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
            ctx.register_hook(HookType::PreDispatch, 0, Arc::new(|_: &mut HookContext| Ok(())))
                .await?;
            ctx.export("svc", Arc::new(self.name.clone())).await?;
            self.step("initialize")
        }

        async fn start(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            if self.fail == Some("hang") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            self.step("start")
        }

        async fn stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            self.step("stop")
        }

        async fn cleanup(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            self.step("cleanup")
        }
    }

    fn artifact(desc: ModuleDescriptor, log: &Log, fail: Option<&'static str>) -> ModuleArtifact {
        let log = log.clone();
        let name = desc.name.clone();
        let version = desc.version.clone();
        ModuleArtifact::new(desc, move || {
            Ok(Arc::new(Scripted {
                name: name.clone(),
                version: version.clone(),
                log: log.clone(),
                fail,
            }))
        })
    }

    fn controller(timeout_ms: u64) -> LifecycleController {
        let health = Arc::new(HealthTracker::new());
        LifecycleController::new(
            LifecycleConfig {
                operation_timeout_ms: timeout_ms,
            },
            Collaborators {
                hooks: Arc::new(HookRegistry::new(health.clone())),
                events: Arc::new(EventBus::new(EventConfig::default(), health.clone())),
                services: Arc::new(ServiceDirectory::new()),
                health,
                host_services: Arc::new(HostServices::new()),
                storage_backend: Arc::new(MemoryBackend::new()),
            },
        )
    }

    fn desc(name: &str) -> ModuleDescriptor {
        ModuleDescriptor::parse(name, "1.0.0").unwrap()
    }

    #[tokio::test]
    async fn test_single_module_state_machine() {
        let ctl = controller(1_000);
        let log = Log::default();
        ctl.load(artifact(desc("a"), &log, None)).await.unwrap();
        assert_eq!(ctl.state("a").await, Some(ModuleState::Loading));

        assert!(matches!(
            ctl.start("a").await,
            Err(CoreError::InvalidStateTransition { .. })
        ));

        ctl.initialize("a").await.unwrap();
        assert_eq!(ctl.state("a").await, Some(ModuleState::Initialized));
        ctl.start("a").await.unwrap();
        assert_eq!(ctl.state("a").await, Some(ModuleState::Running));
        assert_eq!(ctl.parts.hooks.count_for("a").await, 1);

        ctl.stop("a").await.unwrap();
        ctl.stop("a").await.unwrap();
        assert_eq!(ctl.state("a").await, Some(ModuleState::Stopped));
        assert_eq!(ctl.parts.hooks.count_for("a").await, 0);
        assert_eq!(ctl.parts.services.count_for("a").await, 0);

        ctl.unload("a").await.unwrap();
        assert_eq!(ctl.state("a").await, None);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:initialize", "a:start", "a:stop", "a:cleanup"]
        );
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_dependency() {
        let ctl = controller(1_000);
        let log = Log::default();
        ctl.load(artifact(desc("a"), &log, None)).await.unwrap();
        assert!(matches!(
            ctl.load(artifact(desc("a"), &log, None)).await,
            Err(CoreError::ModuleAlreadyLoaded(_))
        ));

        let needs_db = desc("app").with_dependency(DependencySpec::required("db", "^1"));
        assert!(matches!(
            ctl.load(artifact(needs_db, &log, None)).await,
            Err(CoreError::DependencyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_timeout_moves_to_error() {
        let ctl = controller(50);
        let log = Log::default();
        ctl.load(artifact(desc("slow"), &log, Some("hang"))).await.unwrap();
        ctl.initialize("slow").await.unwrap();

        let err = ctl.start("slow").await.unwrap_err();
        assert!(matches!(err, CoreError::LifecycleTimeout { timeout_ms: 50, .. }));
        assert_eq!(ctl.state("slow").await, Some(ModuleState::Error));
        assert_eq!(ctl.health().error_count("slow").await, 1);

        // Error 状态可以停止并卸载
        ctl.stop("slow").await.unwrap();
        ctl.unload("slow").await.unwrap();
    }

    #[tokio::test]
    async fn test_load_all_orders_and_halts_on_failure() {
        let ctl = controller(1_000);
        let log = Log::default();
        let artifacts = vec![
            artifact(
                desc("app").with_dependency(DependencySpec::required("db", ">=1.0")),
                &log,
                None,
            ),
            artifact(desc("db"), &log, None),
            artifact(desc("broken").with_priority(10), &log, Some("initialize")),
        ];

        let err = ctl.load_all(artifacts).await.unwrap_err();
        assert!(matches!(err, CoreError::LifecycleFailed { .. }));
        assert_eq!(ctl.state("db").await, Some(ModuleState::Initialized));
        assert_eq!(ctl.state("app").await, Some(ModuleState::Initialized));
        assert_eq!(ctl.state("broken").await, Some(ModuleState::Error));
        assert!(!log.lock().unwrap().iter().any(|l| l.ends_with(":start")));

        let failures = ctl.shutdown_all().await;
        assert!(failures.is_empty(), "{failures:?}");
        assert!(ctl.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_unload_rejected_while_dependents_loaded() {
        let ctl = controller(1_000);
        let log = Log::default();
        ctl.load_all(vec![
            artifact(desc("db"), &log, None),
            artifact(desc("app").with_dependency(DependencySpec::required("db", "^1")), &log, None),
        ])
        .await
        .unwrap();

        ctl.stop("db").await.unwrap();
        assert!(matches!(
            ctl.unload("db").await,
            Err(CoreError::ModuleHasDependents { .. })
        ));
        assert_eq!(ctl.dependents("db").await, vec!["app"]);
        assert_eq!(ctl.shutdown_order().await, vec!["app", "db"]);
    }
}
