//! 模块存储
//!
//! 每个模块拥有一个隔离的键值命名空间。实际持久化委托给宿主提供的
//! [`KeyValueBackend`]（数据库或内存），键在后端中统一加上 `模块名/` 前缀，
//! 模块之间互不可见。
//!
//! 模块卸载时句柄被释放：之后的读写返回错误，已写入的数据保留在后端，
//! 同名模块重新加载后仍可读取。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::utils::{CoreError, Result};

/// 键值存储后端
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()>;

    /// 返回键是否存在
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// 以 `prefix` 开头的全部键（已排序）
    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

/// 内存后端
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<String, Value>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .data
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// 单个模块的存储句柄
#[derive(Clone)]
pub struct ModuleStorage {
    module: String,
    prefix: String,
    backend: Arc<dyn KeyValueBackend>,
    released: Arc<AtomicBool>,
}

impl ModuleStorage {
    pub fn new(module: &str, backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            module: module.to_string(),
            prefix: format!("{}/", module),
            backend,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    fn ensure_active(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(CoreError::InvalidStateTransition {
                module: self.module.clone(),
                from: "unloaded".to_string(),
                action: "storage access".to_string(),
            });
        }
        Ok(())
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_active()?;
        Ok(self.backend.get(&self.full_key(key)).await?)
    }

    /// 读取并反序列化
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: impl Serialize) -> Result<()> {
        self.ensure_active()?;
        let value = serde_json::to_value(value)?;
        Ok(self.backend.set(&self.full_key(key), value).await?)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_active()?;
        Ok(self.backend.delete(&self.full_key(key)).await?)
    }

    /// 本模块的全部键（不含命名空间前缀）
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.ensure_active()?;
        let keys = self.backend.keys(&self.prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }

    /// 释放句柄，之后的访问失败
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            debug!(module = %self.module, "模块存储已释放");
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ModuleStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleStorage")
            .field("module", &self.module)
            .field("released", &self.is_released())
            .finish()
    }
}

/// 统计各模块占用的键数量（运维查询用）
pub async fn usage_by_module(backend: &dyn KeyValueBackend) -> Result<HashMap<String, usize>> {
    let mut usage = HashMap::new();
    for key in backend.keys("").await? {
        if let Some((module, _)) = key.split_once('/') {
            *usage.entry(module.to_string()).or_insert(0) += 1;
        }
    }
    Ok(usage)
}
