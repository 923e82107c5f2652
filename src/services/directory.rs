//! 服务目录
//!
//! 一个模块导出的命名服务，由其它模块按 `(owner, name)` 查找。
//! 句柄对目录不透明，查找方用 [`ServiceDirectory::lookup_as`] 还原具体类型。

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::utils::{CoreError, Result};

/// 不透明的服务句柄
pub type ServiceHandle = Arc<dyn Any + Send + Sync>;

/// 目录条目摘要
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ExportedService {
    pub owner: String,
    pub name: String,
}

/// 服务目录
#[derive(Default)]
pub struct ServiceDirectory {
    /// (owner, name) -> 句柄
    services: RwLock<HashMap<(String, String), ServiceHandle>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 导出服务，同一 owner 下重名时拒绝
    pub async fn export(&self, owner: &str, name: &str, handle: ServiceHandle) -> Result<()> {
        let mut services = self.services.write().await;
        let key = (owner.to_string(), name.to_string());
        if services.contains_key(&key) {
            return Err(CoreError::ServiceAlreadyExported {
                owner: owner.to_string(),
                service: name.to_string(),
            });
        }
        services.insert(key, handle);
        debug!(module = %owner, service = %name, "服务已导出");
        Ok(())
    }

    /// 查找服务
    pub async fn lookup(&self, requester: &str, owner: &str, name: &str) -> Result<ServiceHandle> {
        let services = self.services.read().await;
        let handle = services
            .get(&(owner.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| CoreError::ServiceNotFound {
                owner: owner.to_string(),
                service: name.to_string(),
            })?;
        trace!(module = %requester, owner = %owner, service = %name, "服务查找命中");
        Ok(handle)
    }

    /// 查找并还原为具体类型
    pub async fn lookup_as<T: Any + Send + Sync>(
        &self,
        requester: &str,
        owner: &str,
        name: &str,
    ) -> Result<Arc<T>> {
        self.lookup(requester, owner, name)
            .await?
            .downcast::<T>()
            .map_err(|_| CoreError::ServiceTypeMismatch {
                owner: owner.to_string(),
                service: name.to_string(),
            })
    }

    /// 移除单个导出，返回是否存在
    pub async fn unexport(&self, owner: &str, name: &str) -> bool {
        self.services
            .write()
            .await
            .remove(&(owner.to_string(), name.to_string()))
            .is_some()
    }

    /// 移除某模块导出的全部服务，返回移除数量
    pub async fn unregister_all(&self, owner: &str) -> usize {
        let mut services = self.services.write().await;
        let before = services.len();
        services.retain(|(o, _), _| o != owner);
        let removed = before - services.len();
        if removed > 0 {
            debug!(module = %owner, removed, "已移除模块导出的全部服务");
        }
        removed
    }

    /// 所有导出（按 owner、name 排序）
    pub async fn list(&self) -> Vec<ExportedService> {
        let mut list: Vec<ExportedService> = self
            .services
            .read()
            .await
            .keys()
            .map(|(owner, name)| ExportedService {
                owner: owner.clone(),
                name: name.clone(),
            })
            .collect();
        list.sort();
        list
    }

    pub async fn count_for(&self, owner: &str) -> usize {
        self.services
            .read()
            .await
            .keys()
            .filter(|(o, _)| o == owner)
            .count()
    }
}
