//! # 生命周期集成测试
//!
//! 通过 PluginHost 验证：
//! - 依赖顺序加载、逆序关闭
//! - 缺失、不兼容与循环依赖的拒绝
//! - 阶段失败、超时与 panic 的隔离
//! - 卸载后注册全部清除
//! - 权限网关与配置下发

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use chips_plugin_core::{
    handler, Capability, CoreError, HealthStatus, HookContext, HookType, HostService, HostState,
    Module, ModuleArtifact, ModuleContext, ModuleDescriptor, ModuleState, PluginHost,
};
use common::{entries, module, new_log, test_config, visited, Fault};

fn host() -> PluginHost {
    PluginHost::new(test_config()).unwrap()
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("missing log entry {entry}: {log:?}"))
}

// ============================================================================
// 加载与关闭顺序
// ============================================================================

#[tokio::test]
async fn test_load_all_follows_dependency_order() {
    let log = new_log();
    let host = host();

    // 故意逆序提供
    let order = host
        .load_all(vec![
            module("api", "1.0.0", &log).requires("auth", "^1.0").build(),
            module("auth", "1.2.0", &log).requires("store", ">=0.5, <2").build(),
            module("store", "1.0.0", &log).build(),
        ])
        .await
        .unwrap();

    assert_eq!(order, vec!["store", "auth", "api"]);
    assert_eq!(host.state().await, HostState::Running);

    let log_entries = entries(&log);
    assert!(position(&log_entries, "store@1.0.0:initialize") < position(&log_entries, "auth@1.2.0:initialize"));
    assert!(position(&log_entries, "auth@1.2.0:start") < position(&log_entries, "api@1.0.0:start"));
    // 全部初始化完成后才开始启动
    assert!(position(&log_entries, "api@1.0.0:initialize") < position(&log_entries, "store@1.0.0:start"));

    let modules = host.list_modules().await;
    assert_eq!(modules.len(), 3);
    assert!(modules.iter().all(|m| m.state == ModuleState::Running));

    let graph = host.get_dependency_graph().await;
    assert_eq!(graph["api"], vec!["auth".to_string()]);
    assert_eq!(graph["auth"], vec!["store".to_string()]);
    assert!(graph["store"].is_empty());
    assert_eq!(host.get_dependents("store").await, vec!["auth".to_string()]);

    host.shutdown().await.unwrap();
    assert_eq!(host.state().await, HostState::Shutdown);
    assert!(host.list_modules().await.is_empty());

    let log_entries = entries(&log);
    assert!(position(&log_entries, "api@1.0.0:stop") < position(&log_entries, "auth@1.2.0:stop"));
    assert!(position(&log_entries, "auth@1.2.0:stop") < position(&log_entries, "store@1.0.0:stop"));

    // 重复关闭是空操作
    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_dependency_rejects_whole_batch() {
    let log = new_log();
    let host = host();

    let err = host
        .load_all(vec![
            module("store", "1.0.0", &log).build(),
            module("api", "1.0.0", &log).requires("auth", "^1").build(),
        ])
        .await
        .unwrap_err();

    match err {
        CoreError::DependencyNotFound { module, dependency, .. } => {
            assert_eq!(module, "api");
            assert_eq!(dependency, "auth");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(host.list_modules().await.is_empty());
    assert!(entries(&log).is_empty());
}

#[tokio::test]
async fn test_version_mismatch_reports_versions() {
    let log = new_log();
    let host = host();

    let err = host
        .load_all(vec![
            module("store", "1.4.0", &log).build(),
            module("auth", "1.0.0", &log).requires("store", "^2.0").build(),
        ])
        .await
        .unwrap_err();

    match err {
        CoreError::VersionMismatch { module, dependency, found, .. } => {
            assert_eq!(module, "auth");
            assert_eq!(dependency, "store");
            assert_eq!(found, "1.4.0");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_cycle_is_reported_with_chain() {
    let log = new_log();
    let host = host();

    let err = host
        .load_all(vec![
            module("a", "1.0.0", &log).requires("b", "*").build(),
            module("b", "1.0.0", &log).requires("c", "*").build(),
            module("c", "1.0.0", &log).requires("a", "*").build(),
        ])
        .await
        .unwrap_err();

    match err {
        CoreError::CircularDependency { chain } => {
            for name in ["a", "b", "c"] {
                assert!(chain.contains(&name.to_string()), "chain {chain:?} misses {name}");
            }
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(host.list_modules().await.is_empty());
}

#[tokio::test]
async fn test_missing_optional_dependency_is_tolerated() {
    let log = new_log();
    let host = host();

    host.load_all(vec![module("api", "1.0.0", &log).optional("metrics", "^1").build()])
        .await
        .unwrap();

    assert_eq!(
        host.lifecycle().state("api").await,
        Some(ModuleState::Running)
    );
    assert!(host.get_dependency_graph().await["api"].is_empty());
}

// ============================================================================
// 失败隔离
// ============================================================================

#[tokio::test]
async fn test_start_failure_leaves_other_modules_running() {
    let log = new_log();
    let host = host();

    let err = host
        .load_all(vec![
            module("store", "1.0.0", &log).build(),
            module("auth", "1.0.0", &log)
                .requires("store", "^1")
                .fault(Fault::Fail("start"))
                .build(),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::LifecycleFailed { ref phase, .. } if phase == "start"));
    assert_eq!(host.lifecycle().state("store").await, Some(ModuleState::Running));
    assert_eq!(host.lifecycle().state("auth").await, Some(ModuleState::Error));

    let health = host.get_health("auth").await.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.counters.error_count >= 1);
    assert!(health.counters.last_error.unwrap().contains("start failed"));

    let report = host.check_all().await;
    assert_eq!(report.status, HealthStatus::Unhealthy);

    // 进入 Error 的实例不再保留任何注册
    assert_eq!(host.hooks().count_for("auth").await, 0);
    assert!(host.events().subscriptions_for("auth").await.is_empty());
    assert_eq!(host.services().count_for("auth").await, 0);
    assert_eq!(host.hooks().count_for("store").await, 1);

    // 关闭照常完成
    host.shutdown().await.unwrap();
    assert!(host.list_modules().await.is_empty());
}

#[tokio::test]
async fn test_hanging_initialize_times_out() {
    let log = new_log();
    let host = host();

    let err = host
        .load_module(module("slow", "1.0.0", &log).fault(Fault::Hang("initialize")).build())
        .await
        .unwrap_err();

    match err {
        CoreError::LifecycleTimeout { module, phase, timeout_ms } => {
            assert_eq!(module, "slow");
            assert_eq!(phase, "initialize");
            assert_eq!(timeout_ms, 500);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(host.lifecycle().state("slow").await, Some(ModuleState::Error));
}

#[tokio::test]
async fn test_panic_in_start_is_contained() {
    let log = new_log();
    let host = host();

    host.load_module(module("steady", "1.0.0", &log).build()).await.unwrap();
    let err = host
        .load_module(module("boom", "1.0.0", &log).fault(Fault::Panic("start")).build())
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::LifecycleFailed { ref module, .. } if module == "boom"));
    assert_eq!(host.lifecycle().state("boom").await, Some(ModuleState::Error));
    assert_eq!(host.lifecycle().state("steady").await, Some(ModuleState::Running));
}

// ============================================================================
// 卸载
// ============================================================================

#[tokio::test]
async fn test_unload_removes_every_registration() {
    let log = new_log();
    let host = host();
    host.load_all(vec![module("auth", "1.0.0", &log).build()]).await.unwrap();

    assert_eq!(host.hooks().count_for("auth").await, 1);
    assert_eq!(host.events().subscriptions_for("auth").await.len(), 1);
    assert_eq!(host.services().count_for("auth").await, 1);

    host.unload_module("auth").await.unwrap();

    assert_eq!(host.hooks().count_for("auth").await, 0);
    assert!(host.events().subscriptions_for("auth").await.is_empty());
    assert_eq!(host.services().count_for("auth").await, 0);
    assert!(host.lifecycle().state("auth").await.is_none());

    let log_entries = entries(&log);
    assert!(position(&log_entries, "auth@1.0.0:stop") < position(&log_entries, "auth@1.0.0:cleanup"));
}

#[tokio::test]
async fn test_unload_with_dependents_is_rejected() {
    let log = new_log();
    let host = host();
    host.load_all(vec![
        module("store", "1.0.0", &log).build(),
        module("auth", "1.0.0", &log).requires("store", "^1").build(),
    ])
    .await
    .unwrap();

    host.lifecycle().stop("store").await.unwrap();
    let err = host.lifecycle().unload("store").await.unwrap_err();
    match err {
        CoreError::ModuleHasDependents { module, dependents } => {
            assert_eq!(module, "store");
            assert_eq!(dependents, vec!["auth".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(host.lifecycle().state("store").await, Some(ModuleState::Stopped));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let log = new_log();
    let host = host();
    host.load_module(module("auth", "1.0.0", &log).build()).await.unwrap();

    host.lifecycle().stop("auth").await.unwrap();
    host.lifecycle().stop("auth").await.unwrap();

    let stops = entries(&log).iter().filter(|e| *e == "auth@1.0.0:stop").count();
    assert_eq!(stops, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registrations_racing_stop_never_survive() {
    let log = new_log();
    let host = Arc::new(host());
    host.load_module(module("auth", "1.0.0", &log).build()).await.unwrap();
    let ctx = host.lifecycle().instance("auth").await.unwrap().context;

    let mut attempts = Vec::new();
    for i in 0..100 {
        let ctx = ctx.clone();
        attempts.push(tokio::spawn(async move {
            if i % 2 == 0 {
                ctx.register_hook(HookType::PostDispatch, 0, Arc::new(|_: &mut HookContext| Ok(())))
                    .await
                    .is_ok()
            } else {
                ctx.subscribe("race.*", handler(|_| async { Ok::<(), anyhow::Error>(()) }))
                    .await
                    .is_ok()
            }
        }));
    }
    host.lifecycle().stop("auth").await.unwrap();
    for attempt in attempts {
        attempt.await.unwrap();
    }

    assert_eq!(host.lifecycle().state("auth").await, Some(ModuleState::Stopped));
    assert_eq!(host.hooks().count_for("auth").await, 0);
    assert!(host.events().subscriptions_for("auth").await.is_empty());
}

#[tokio::test]
async fn test_reported_failure_drops_registrations() {
    let log = new_log();
    let host = host();
    host.load_all(vec![
        module("store", "1.0.0", &log).build(),
        module("auth", "1.0.0", &log).build(),
    ])
    .await
    .unwrap();
    let ctx = host.lifecycle().instance("auth").await.unwrap().context;

    assert!(ctx.report_failure("connection pool exhausted").await);
    // 重复上报被忽略
    assert!(!ctx.report_failure("again").await);

    assert_eq!(host.lifecycle().state("auth").await, Some(ModuleState::Error));
    assert_eq!(host.hooks().count_for("auth").await, 0);
    assert!(host.events().subscriptions_for("auth").await.is_empty());
    assert_eq!(host.services().count_for("auth").await, 0);
    assert!(ctx
        .register_hook(HookType::PreDispatch, 0, Arc::new(|_: &mut HookContext| Ok(())))
        .await
        .is_err());

    let mut hook_ctx = HookContext::new(HookType::PreDispatch).with_target("auth");
    host.dispatch(HookType::PreDispatch, &mut hook_ctx).await.unwrap();
    assert_eq!(visited(&hook_ctx), vec!["store@1.0.0".to_string()]);

    let health = host.get_health("auth").await.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.counters.last_error.unwrap().contains("connection pool exhausted"));

    // Error 实例仍可正常停止与卸载
    host.unload_module("auth").await.unwrap();
    assert!(host.lifecycle().state("auth").await.is_none());
}

#[tokio::test]
async fn test_duplicate_load_is_rejected() {
    let log = new_log();
    let host = host();
    host.load_module(module("auth", "1.0.0", &log).build()).await.unwrap();

    let err = host
        .load_module(module("auth", "1.1.0", &log).build())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ModuleAlreadyLoaded(ref name) if name == "auth"));
}

// ============================================================================
// 权限网关
// ============================================================================

struct CountingDatabase {
    calls: AtomicUsize,
}

#[async_trait]
impl HostService for CountingDatabase {
    fn capability(&self) -> Capability {
        Capability::Database
    }

    async fn invoke(&self, operation: &str, _params: Value) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "operation": operation }))
    }
}

/// 启动时访问数据库，结果写入存储
struct DbClient {
    name: String,
}

#[async_trait]
impl Module for DbClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> semver::Version {
        semver::Version::new(1, 0, 0)
    }

    async fn initialize(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        let outcome = match ctx.host().database().call("ping", json!({})).await {
            Ok(_) => "allowed".to_string(),
            Err(e) => e.error_code().to_string(),
        };
        ctx.storage().set("db", outcome).await?;
        Ok(())
    }
}

fn db_client(name: &str, granted: bool) -> ModuleArtifact {
    let mut descriptor = ModuleDescriptor::parse(name, "1.0.0").unwrap();
    if granted {
        descriptor = descriptor.with_permission("database");
    }
    let name = name.to_string();
    ModuleArtifact::new(descriptor, move || Ok(Arc::new(DbClient { name: name.clone() })))
}

#[tokio::test]
async fn test_permission_gate_blocks_ungranted_modules() {
    let database = Arc::new(CountingDatabase {
        calls: AtomicUsize::new(0),
    });
    let host = PluginHost::builder()
        .config(test_config())
        .host_service(database.clone())
        .build()
        .unwrap();

    host.load_all(vec![db_client("reporting", true), db_client("sandbox", false)])
        .await
        .unwrap();

    let reporting = host.lifecycle().instance("reporting").await.unwrap();
    let sandbox = host.lifecycle().instance("sandbox").await.unwrap();
    assert_eq!(
        reporting.context.storage().get("db").await.unwrap(),
        Some(json!("allowed"))
    );
    assert_eq!(
        sandbox.context.storage().get("db").await.unwrap(),
        Some(json!(chips_plugin_core::error_code::PERMISSION_DENIED))
    );

    // 被拒绝的调用不会到达服务
    assert_eq!(database.calls.load(Ordering::SeqCst), 1);

    // 拒绝计入安全统计，不计为模块错误
    let health = host.get_health("sandbox").await.unwrap();
    assert_eq!(health.counters.permission_denials, 1);
    assert_eq!(health.counters.error_count, 0);
    assert_eq!(health.status, HealthStatus::Healthy);
}

// ============================================================================
// 配置
// ============================================================================

#[tokio::test]
async fn test_config_is_validated_against_schema() {
    let log = new_log();
    let config = chips_plugin_core::HostConfig::builder()
        .operation_timeout_ms(500)
        .module_config("auth", json!({ "ttl": "soon" }))
        .build();
    let host = PluginHost::new(config).unwrap();

    let schema = json!({
        "type": "object",
        "required": ["ttl"],
        "properties": { "ttl": { "type": "integer" } }
    });
    let inner = module("auth", "1.0.0", &log).build();
    let artifact = ModuleArtifact::new(
        inner.descriptor.clone().with_config_schema(schema),
        move || Ok(inner.instantiate()?),
    );

    let err = host.load_module(artifact).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidConfigValue { ref key, .. } if key == "modules.auth"));
    assert!(host.lifecycle().state("auth").await.is_none());

    // 合法配置可以在运行中下发
    let schema_ok = module("cache", "1.0.0", &log).build();
    host.load_module(schema_ok).await.unwrap();
    host.update_module_config("cache", json!({ "size": 64 })).await.unwrap();
    let cache = host.lifecycle().instance("cache").await.unwrap();
    assert_eq!(cache.context.config().await, json!({ "size": 64 }));
}
