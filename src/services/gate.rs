//! 权限网关
//!
//! 宿主服务（数据库、缓存、路由、配置、文件系统、网络、命令执行以及自定义服务）
//! 只能通过网关访问。每次调用都检查调用模块的 [`PermissionGrant`]，未授权时返回
//! `PermissionDenied` 并写入 `security` 目标的日志，底层服务不会被调用。
//!
//! 网关不串行化对底层服务的访问，并发由服务自身负责。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{trace, warn};

use crate::module::health::HealthTracker;
use crate::module::metadata::{Capability, PermissionGrant};
use crate::utils::logger::SECURITY_TARGET;
use crate::utils::{CoreError, Result};

/// 宿主服务
///
/// 具体实现（数据库连接池、缓存客户端等）由宿主提供，内核只负责访问控制。
#[async_trait]
pub trait HostService: Send + Sync {
    /// 访问该服务所需的能力
    fn capability(&self) -> Capability;

    /// 执行一次操作
    async fn invoke(&self, operation: &str, params: Value) -> anyhow::Result<Value>;
}

/// 宿主服务表：能力 -> 服务实现
#[derive(Clone, Default)]
pub struct HostServices {
    services: HashMap<Capability, Arc<dyn HostService>>,
}

impl HostServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册服务，同一能力重复注册时后者覆盖前者
    pub fn register(&mut self, service: Arc<dyn HostService>) -> &mut Self {
        self.services.insert(service.capability(), service);
        self
    }

    pub fn with(mut self, service: Arc<dyn HostService>) -> Self {
        self.register(service);
        self
    }

    pub fn get(&self, capability: &Capability) -> Option<Arc<dyn HostService>> {
        self.services.get(capability).cloned()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.services.keys().cloned().collect();
        caps.sort();
        caps
    }
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// 单个模块的权限网关
#[derive(Clone)]
pub struct PermissionGate {
    module: String,
    grant: PermissionGrant,
    services: Arc<HostServices>,
    health: Arc<HealthTracker>,
}

impl PermissionGate {
    pub fn new(
        module: impl Into<String>,
        grant: PermissionGrant,
        services: Arc<HostServices>,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            module: module.into(),
            grant,
            services,
            health,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn grant(&self) -> &PermissionGrant {
        &self.grant
    }

    /// 检查授权，拒绝时记录安全日志
    pub async fn check(&self, capability: &Capability) -> Result<()> {
        if self.grant.allows(capability) {
            return Ok(());
        }
        warn!(
            target: SECURITY_TARGET,
            module = %self.module,
            capability = %capability,
            "权限被拒绝"
        );
        self.health.record_permission_denied(&self.module).await;
        Err(CoreError::PermissionDenied {
            module: self.module.clone(),
            capability: capability.to_string(),
        })
    }

    /// 检查授权后委托给宿主服务
    pub async fn invoke(&self, capability: &Capability, operation: &str, params: Value) -> Result<Value> {
        self.check(capability).await?;
        let service = self
            .services
            .get(capability)
            .ok_or_else(|| CoreError::HostServiceUnavailable(capability.to_string()))?;
        trace!(module = %self.module, capability = %capability, operation, "调用宿主服务");
        Ok(service.invoke(operation, params).await?)
    }

    /// 按能力取得访问器
    pub fn service(&self, capability: Capability) -> ServiceAccessor<'_> {
        ServiceAccessor {
            gate: self,
            capability,
        }
    }

    pub fn database(&self) -> ServiceAccessor<'_> {
        self.service(Capability::Database)
    }

    pub fn cache(&self) -> ServiceAccessor<'_> {
        self.service(Capability::Cache)
    }

    pub fn router(&self) -> ServiceAccessor<'_> {
        self.service(Capability::Router)
    }

    pub fn config(&self) -> ServiceAccessor<'_> {
        self.service(Capability::Config)
    }

    pub fn filesystem(&self) -> ServiceAccessor<'_> {
        self.service(Capability::Filesystem)
    }

    pub fn network(&self) -> ServiceAccessor<'_> {
        self.service(Capability::Network)
    }

    pub fn exec(&self) -> ServiceAccessor<'_> {
        self.service(Capability::Exec)
    }

    pub fn custom(&self, name: &str) -> ServiceAccessor<'_> {
        self.service(Capability::from(name))
    }
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("module", &self.module)
            .field("grant", &self.grant)
            .finish()
    }
}

/// 宿主服务访问器
///
/// 不缓存授权结果，每次 [`call`](Self::call) 都重新经过网关检查。
pub struct ServiceAccessor<'a> {
    gate: &'a PermissionGate,
    capability: Capability,
}

impl ServiceAccessor<'_> {
    pub fn capability(&self) -> &Capability {
        &self.capability
    }

    pub async fn call(&self, operation: &str, params: Value) -> Result<Value> {
        self.gate.invoke(&self.capability, operation, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingService {
        capability: Capability,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HostService for CountingService {
        fn capability(&self) -> Capability {
            self.capability.clone()
        }

        async fn invoke(&self, operation: &str, params: Value) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "op": operation, "params": params }))
        }
    }

    fn setup(grant: &[Capability]) -> (PermissionGate, Arc<CountingService>, Arc<HealthTracker>) {
        let db = Arc::new(CountingService {
            capability: Capability::Database,
            calls: AtomicUsize::new(0),
        });
        let services = Arc::new(HostServices::new().with(db.clone()));
        let health = Arc::new(HealthTracker::new());
        let gate = PermissionGate::new(
            "billing",
            PermissionGrant::new(grant.iter().cloned()),
            services,
            health.clone(),
        );
        (gate, db, health)
    }

    #[tokio::test]
    async fn test_denied_call_never_reaches_service() {
        let (gate, db, health) = setup(&[Capability::Cache]);

        for _ in 0..3 {
            let err = gate.database().call("query", json!("select 1")).await.unwrap_err();
            assert!(err.is_permission_denied());
        }
        assert_eq!(db.calls.load(Ordering::SeqCst), 0);

        let counters = health.counters("billing").await;
        assert_eq!(counters.permission_denials, 3);
        assert_eq!(counters.error_count, 0);
    }

    #[tokio::test]
    async fn test_granted_call_is_delegated() {
        let (gate, db, _) = setup(&[Capability::Database]);
        let result = gate.database().call("query", json!([1])).await.unwrap();
        assert_eq!(result["op"], "query");
        assert_eq!(db.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_granted_but_missing_service() {
        let (gate, _, _) = setup(&[Capability::Exec, Capability::from("audit.write")]);
        assert!(matches!(
            gate.exec().call("run", json!(null)).await,
            Err(CoreError::HostServiceUnavailable(_))
        ));
        assert!(matches!(
            gate.custom("audit.write").call("append", json!(null)).await,
            Err(CoreError::HostServiceUnavailable(_))
        ));
        assert!(gate.custom("audit.read").call("x", json!(null)).await.unwrap_err().is_permission_denied());
    }
}
