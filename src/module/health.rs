//! 健康与指标追踪
//!
//! 按模块名记录错误计数、最后错误、每个钩子类型的耗时、权限拒绝次数
//! 和热重载历史。计数以模块名为键，热重载替换实例时保留。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::hooks::HookType;
use crate::module::metadata::{HealthStatus, ModuleState};
use crate::utils::metrics::{LatencyRecorder, LatencySnapshot};

#[derive(Debug, Default)]
struct ModuleCounters {
    error_count: u64,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
    permission_denials: u64,
    event_failures: u64,
    reloads: u64,
    rollbacks: u64,
    hooks: HashMap<HookType, Arc<LatencyRecorder>>,
}

/// 单个模块的计数快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCounters {
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    pub permission_denials: u64,
    pub event_failures: u64,
    pub reloads: u64,
    pub rollbacks: u64,
    /// 钩子类型 -> 耗时统计
    pub hooks: BTreeMap<String, LatencySnapshot>,
}

/// `get_health` 的返回值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub name: String,
    pub version: String,
    pub state: ModuleState,
    pub status: HealthStatus,
    #[serde(flatten)]
    pub counters: HealthCounters,
    pub checked_at: DateTime<Utc>,
}

impl ModuleHealth {
    pub fn new(name: &str, version: &str, state: ModuleState, counters: HealthCounters) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            state,
            status: HealthStatus::derive(state, counters.error_count),
            counters,
            checked_at: Utc::now(),
        }
    }
}

/// 宿主整体健康
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub modules: Vec<ModuleHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// 任一模块不健康则整体不健康，否则任一降级则整体降级
    pub fn aggregate(modules: Vec<ModuleHealth>) -> Self {
        let status = if modules.iter().any(|m| m.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if modules.iter().any(|m| m.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            modules,
            checked_at: Utc::now(),
        }
    }
}

/// 健康追踪器
#[derive(Debug, Default)]
pub struct HealthTracker {
    modules: RwLock<HashMap<String, ModuleCounters>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次错误：计数加一并覆盖最后错误
    pub async fn record_error(&self, module: &str, error: impl Into<String>) {
        let mut modules = self.modules.write().await;
        let counters = modules.entry(module.to_string()).or_default();
        counters.error_count += 1;
        counters.last_error = Some(error.into());
        counters.last_error_at = Some(Utc::now());
    }

    /// 记录一次钩子调用，失败同时计入错误
    pub async fn record_hook(
        &self,
        module: &str,
        hook_type: HookType,
        latency_us: u64,
        failure: Option<String>,
    ) {
        let mut modules = self.modules.write().await;
        let counters = modules.entry(module.to_string()).or_default();
        counters
            .hooks
            .entry(hook_type)
            .or_insert_with(|| Arc::new(LatencyRecorder::new()))
            .record(failure.is_none(), latency_us);

        if let Some(reason) = failure {
            counters.error_count += 1;
            counters.last_error = Some(format!("{} 钩子失败: {}", hook_type, reason));
            counters.last_error_at = Some(Utc::now());
        }
    }

    /// 记录一次事件处理失败
    pub async fn record_event_failure(&self, module: &str, event: &str, reason: &str) {
        let mut modules = self.modules.write().await;
        let counters = modules.entry(module.to_string()).or_default();
        counters.event_failures += 1;
        counters.error_count += 1;
        counters.last_error = Some(format!("事件 '{}' 处理失败: {}", event, reason));
        counters.last_error_at = Some(Utc::now());
    }

    /// 记录一次权限拒绝（不计入错误）
    pub async fn record_permission_denied(&self, module: &str) {
        let mut modules = self.modules.write().await;
        modules.entry(module.to_string()).or_default().permission_denials += 1;
    }

    /// 记录一次热重载结果
    pub async fn record_reload(&self, module: &str, rolled_back: bool) {
        let mut modules = self.modules.write().await;
        let counters = modules.entry(module.to_string()).or_default();
        if rolled_back {
            counters.rollbacks += 1;
        } else {
            counters.reloads += 1;
        }
    }

    pub async fn error_count(&self, module: &str) -> u64 {
        self.modules
            .read()
            .await
            .get(module)
            .map(|c| c.error_count)
            .unwrap_or(0)
    }

    pub async fn last_error(&self, module: &str) -> Option<String> {
        self.modules
            .read()
            .await
            .get(module)
            .and_then(|c| c.last_error.clone())
    }

    /// 计数快照，未记录过的模块返回全零
    pub async fn counters(&self, module: &str) -> HealthCounters {
        let modules = self.modules.read().await;
        let Some(c) = modules.get(module) else {
            return HealthCounters::default();
        };
        HealthCounters {
            error_count: c.error_count,
            last_error: c.last_error.clone(),
            last_error_at: c.last_error_at,
            permission_denials: c.permission_denials,
            event_failures: c.event_failures,
            reloads: c.reloads,
            rollbacks: c.rollbacks,
            hooks: c
                .hooks
                .iter()
                .map(|(hook, recorder)| (hook.to_string(), recorder.snapshot()))
                .collect(),
        }
    }

    /// 模块被显式卸载后丢弃其计数
    pub async fn forget(&self, module: &str) {
        self.modules.write().await.remove(module);
    }
}
