//! 热重载协调器
//!
//! 原地替换一个运行中的模块：
//!
//! 1. 为该模块开启请求缓冲
//! 2. 停止旧实例
//! 3. 卸载旧实例（保留健康计数）
//! 4. 用新制品加载新实例
//! 5. 初始化并启动新实例，随后观察一个宽限窗口
//! 6. 活动实例进入 Running 后按到达顺序放行缓冲
//!
//! 第 4、5 步失败或新实例在宽限窗口内上报故障时，用缓存的旧制品重跑 2–5 步
//! 恢复服务，并以 `error` 级别记录回滚。回滚也失败时模块停留在 Error，缓冲中的
//! 请求收到 `TemporarilyUnavailable`。依赖该模块的其它模块不会被自动重载。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::core::config::HotReloadConfig;
use crate::module::dependency::DependencyResolver;
use crate::module::lifecycle::LifecycleController;
use crate::module::metadata::ModuleState;
use crate::module::plugin::{ArtifactSource, ModuleArtifact};
use crate::reload::queue::ReloadBuffer;
use crate::utils::logger::RELOAD_TARGET;
use crate::utils::{prefixed_id, CoreError, Result};

/// 单次重载的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadOutcome {
    /// 新版本已运行
    Replaced,
    /// 新版本失败，旧版本已恢复
    RolledBack,
    /// 新旧版本都未能运行
    Failed,
    /// 替换前的检查未通过，旧实例未被触碰
    Rejected,
}

/// 重载记录
#[derive(Debug, Clone, Serialize)]
pub struct ReloadRecord {
    pub ticket: String,
    pub module: String,
    pub from_version: String,
    pub to_version: String,
    pub outcome: ReloadOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub released: usize,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

const MAX_HISTORY: usize = 256;

/// 热重载协调器
pub struct HotReloadCoordinator {
    config: HotReloadConfig,
    lifecycle: Arc<LifecycleController>,
    source: Option<Arc<dyn ArtifactSource>>,
    /// 模块名 -> 正在进行的重载缓冲
    buffers: RwLock<HashMap<String, Arc<ReloadBuffer>>>,
    history: RwLock<Vec<ReloadRecord>>,
}

impl HotReloadCoordinator {
    pub fn new(config: HotReloadConfig, lifecycle: Arc<LifecycleController>) -> Self {
        Self {
            config,
            lifecycle,
            source: None,
            buffers: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    /// 设置制品来源，[`reload`](Self::reload) 从这里取更新后的制品
    pub fn with_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// 从制品来源取新制品并重载
    pub async fn reload(&self, name: &str) -> Result<ReloadRecord> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| CoreError::Internal("未配置制品来源".to_string()))?;
        let artifact = source.fetch(name).await.map_err(|e| CoreError::ReloadFailed {
            module: name.to_string(),
            reason: format!("获取制品失败: {:#}", e),
            rolled_back: false,
        })?;
        self.reload_with(artifact).await
    }

    /// 用给定制品替换同名的运行中模块
    #[instrument(skip_all, fields(module = %artifact.name(), version = %artifact.version()))]
    pub async fn reload_with(&self, artifact: ModuleArtifact) -> Result<ReloadRecord> {
        let name = artifact.name().to_string();
        if !self.config.enabled {
            return Err(CoreError::InvalidConfigValue {
                key: "hot_reload.enabled".to_string(),
                reason: "热重载已禁用".to_string(),
            });
        }

        let previous = self
            .lifecycle
            .instance(&name)
            .await
            .ok_or_else(|| CoreError::ModuleNotFound(name.clone()))?;

        let buffer = {
            let mut buffers = self.buffers.write().await;
            if buffers.contains_key(&name) {
                return Err(CoreError::ReloadInProgress(name));
            }
            let buffer = Arc::new(ReloadBuffer::new(
                name.as_str(),
                self.config.queue_size,
                self.config.queue_timeout(),
            ));
            buffers.insert(name.clone(), buffer.clone());
            buffer
        };

        let ticket = prefixed_id("reload");
        let started_at = Utc::now();
        let started = Instant::now();
        info!(
            module = %name,
            ticket = %ticket,
            from = %previous.descriptor.version,
            to = %artifact.version(),
            "开始热重载"
        );

        let (outcome, reason) = self.execute(&name, &artifact, &previous.artifact).await;

        let released = match outcome {
            ReloadOutcome::Failed => {
                buffer.fail_all("热重载失败，模块不可用").await.released
            }
            _ => buffer.release_all().await.released,
        };
        self.buffers.write().await.remove(&name);

        match outcome {
            ReloadOutcome::Replaced => self.lifecycle.health().record_reload(&name, false).await,
            ReloadOutcome::RolledBack | ReloadOutcome::Failed => {
                self.lifecycle.health().record_reload(&name, true).await
            }
            ReloadOutcome::Rejected => {}
        }

        let record = ReloadRecord {
            ticket,
            module: name.clone(),
            from_version: previous.descriptor.version.to_string(),
            to_version: artifact.version().to_string(),
            outcome,
            reason: reason.clone(),
            released,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        {
            let mut history = self.history.write().await;
            history.push(record.clone());
            if history.len() > MAX_HISTORY {
                let excess = history.len() - MAX_HISTORY;
                history.drain(..excess);
            }
        }

        match outcome {
            ReloadOutcome::Replaced => {
                info!(
                    module = %name,
                    version = %record.to_version,
                    released,
                    duration_ms = record.duration_ms,
                    "热重载完成"
                );
                Ok(record)
            }
            ReloadOutcome::Rejected => {
                warn!(module = %name, "热重载被拒绝，旧实例保持运行");
                Err(CoreError::ReloadFailed {
                    module: name,
                    reason: reason.unwrap_or_default(),
                    rolled_back: false,
                })
            }
            ReloadOutcome::RolledBack => Err(CoreError::ReloadFailed {
                module: name,
                reason: reason.unwrap_or_default(),
                rolled_back: true,
            }),
            ReloadOutcome::Failed => Err(CoreError::ReloadFailed {
                module: name,
                reason: reason.unwrap_or_default(),
                rolled_back: false,
            }),
        }
    }

    async fn execute(
        &self,
        name: &str,
        artifact: &ModuleArtifact,
        previous: &ModuleArtifact,
    ) -> (ReloadOutcome, Option<String>) {
        // 只复查与该模块相连的依赖边
        let loaded = self.lifecycle.registry().descriptors().await;
        if let Err(e) = artifact
            .descriptor
            .validate()
            .map_err(|problems| CoreError::InvalidManifest {
                module: name.to_string(),
                reason: problems.join("; "),
            })
            .and_then(|_| DependencyResolver::recheck_module(&artifact.descriptor, &loaded))
        {
            return (ReloadOutcome::Rejected, Some(e.to_string()));
        }

        let failure = match self.replace(name, artifact).await {
            Ok(()) => return (ReloadOutcome::Replaced, None),
            Err(e) => e.to_string(),
        };

        error!(
            target: RELOAD_TARGET,
            module = %name,
            from = %artifact.version(),
            to = %previous.version(),
            reason = %failure,
            "新版本未能运行，回滚到上一版本"
        );

        match self.replace(name, previous).await {
            Ok(()) => {
                error!(
                    target: RELOAD_TARGET,
                    module = %name,
                    version = %previous.version(),
                    "回滚完成，旧版本已恢复运行"
                );
                (ReloadOutcome::RolledBack, Some(failure))
            }
            Err(e) => {
                error!(
                    target: RELOAD_TARGET,
                    module = %name,
                    error_code = e.error_code(),
                    "回滚失败，模块不可用: {}", e
                );
                (
                    ReloadOutcome::Failed,
                    Some(format!("{}; 回滚失败: {}", failure, e)),
                )
            }
        }
    }

    /// 停止并卸载当前实例，加载并启动给定制品，然后观察宽限窗口
    async fn replace(&self, name: &str, artifact: &ModuleArtifact) -> Result<()> {
        if let Some(state) = self.lifecycle.state(name).await {
            if state != ModuleState::Loading {
                if let Err(e) = self.lifecycle.stop(name).await {
                    warn!(module = %name, "停止旧实例失败，继续卸载: {}", e);
                }
            }
            self.lifecycle.unload_instance(name, false).await?;
        }

        self.lifecycle.load(artifact.clone()).await?;
        self.lifecycle.activate(name).await?;

        let grace = self.config.grace_period();
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }
        match self.lifecycle.state(name).await {
            Some(ModuleState::Running) => Ok(()),
            state => Err(CoreError::LifecycleFailed {
                module: name.to_string(),
                phase: "grace_period".to_string(),
                reason: format!(
                    "宽限窗口内实例状态变为 {}",
                    state.map(|s| s.to_string()).unwrap_or_else(|| "unloaded".to_string())
                ),
            }),
        }
    }

    /// 工作单元进入模块前调用：该模块正在重载时排队等待
    pub async fn admit(&self, name: &str) -> Result<()> {
        let buffer = self.buffers.read().await.get(name).cloned();
        match buffer {
            Some(buffer) => buffer.wait().await,
            None => Ok(()),
        }
    }

    pub async fn is_reloading(&self, name: &str) -> bool {
        self.buffers.read().await.contains_key(name)
    }

    /// 某模块当前缓冲的请求数
    pub async fn queued(&self, name: &str) -> usize {
        let buffer = self.buffers.read().await.get(name).cloned();
        match buffer {
            Some(buffer) => buffer.len().await,
            None => 0,
        }
    }

    /// 重载历史（最近在后）
    pub async fn history(&self) -> Vec<ReloadRecord> {
        self.history.read().await.clone()
    }

    pub async fn history_for(&self, name: &str) -> Vec<ReloadRecord> {
        self.history
            .read()
            .await
            .iter()
            .filter(|r| r.module == name)
            .cloned()
            .collect()
    }
}
