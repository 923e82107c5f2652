//! 钩子注册表
//!
//! 每种钩子类型维护一个有序列表：优先级降序，同优先级按注册顺序。
//! 分发前先在读锁下取快照，回调执行期间其它模块可以并发注册或注销。
//! 单个回调失败或 panic 只记录到健康追踪器，不影响后续回调。

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use crate::hooks::types::{HookCallback, HookContext, HookOutcome, HookResult, HookType};
use crate::module::health::HealthTracker;
use crate::utils::{prefixed_id, CoreError, Result};

struct HookEntry {
    handle: String,
    owner: String,
    priority: i32,
    seq: u64,
    callback: HookCallback,
}

impl HookEntry {
    /// 排序键：优先级降序，注册序号升序
    fn sort_key(&self) -> (std::cmp::Reverse<i32>, u64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}

/// 钩子注册表
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookType, Vec<Arc<HookEntry>>>>,
    seq: AtomicU64,
    health: Arc<HealthTracker>,
}

impl HookRegistry {
    pub fn new(health: Arc<HealthTracker>) -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
            health,
        }
    }

    /// 注册回调，返回注册句柄
    pub async fn register(
        &self,
        hook_type: HookType,
        priority: i32,
        owner: &str,
        callback: HookCallback,
    ) -> String {
        let entry = Arc::new(HookEntry {
            handle: prefixed_id("hook"),
            owner: owner.to_string(),
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            callback,
        });
        let handle = entry.handle.clone();

        let mut hooks = self.hooks.write().await;
        let list = hooks.entry(hook_type).or_default();
        let key = entry.sort_key();
        let pos = list.partition_point(|e| e.sort_key() <= key);
        list.insert(pos, entry);

        debug!(hook = %hook_type, module = %owner, priority, handle = %handle, "钩子已注册");
        handle
    }

    /// 按句柄注销
    pub async fn unregister(&self, handle: &str) -> Result<()> {
        let mut hooks = self.hooks.write().await;
        for list in hooks.values_mut() {
            if let Some(pos) = list.iter().position(|e| e.handle == handle) {
                list.remove(pos);
                return Ok(());
            }
        }
        Err(CoreError::SubscriptionNotFound(handle.to_string()))
    }

    /// 注销某模块的全部回调，返回移除数量
    pub async fn unregister_all(&self, owner: &str) -> usize {
        let mut hooks = self.hooks.write().await;
        let mut removed = 0;
        for list in hooks.values_mut() {
            let before = list.len();
            list.retain(|e| e.owner != owner);
            removed += before - list.len();
        }
        if removed > 0 {
            debug!(module = %owner, removed, "已注销模块的全部钩子");
        }
        removed
    }

    /// 分发钩子
    ///
    /// 注册表为空时直接返回空列表。流水线钩子中回调请求跳过后，
    /// 剩余回调不再调用，也不出现在返回结果里。
    pub async fn dispatch(&self, hook_type: HookType, ctx: &mut HookContext) -> Vec<HookOutcome> {
        let snapshot: Vec<Arc<HookEntry>> = {
            let hooks = self.hooks.read().await;
            match hooks.get(&hook_type) {
                Some(list) if !list.is_empty() => list.clone(),
                _ => return Vec::new(),
            }
        };

        trace!(hook = %hook_type, callbacks = snapshot.len(), "开始分发钩子");

        let mut outcomes = Vec::with_capacity(snapshot.len());
        for entry in snapshot {
            let started = Instant::now();
            let result = match catch_unwind(AssertUnwindSafe(|| (entry.callback)(ctx))) {
                Ok(Ok(())) => HookResult::Success,
                Ok(Err(e)) => HookResult::Failed(format!("{:#}", e)),
                Err(panic) => HookResult::Panicked(panic_message(&*panic)),
            };
            let duration_us = started.elapsed().as_micros() as u64;

            let failure = match &result {
                HookResult::Success => None,
                HookResult::Failed(reason) | HookResult::Panicked(reason) => {
                    let err = CoreError::HookFailed {
                        owner: entry.owner.clone(),
                        hook: hook_type.to_string(),
                        reason: reason.clone(),
                    };
                    warn!(
                        hook = %hook_type,
                        module = %entry.owner,
                        error_code = err.error_code(),
                        "{}", err
                    );
                    Some(reason.clone())
                }
            };
            self.health
                .record_hook(&entry.owner, hook_type, duration_us, failure)
                .await;

            outcomes.push(HookOutcome {
                handle: entry.handle.clone(),
                owner: entry.owner.clone(),
                priority: entry.priority,
                result,
                duration_us,
            });

            if ctx.should_skip() {
                debug!(hook = %hook_type, module = %entry.owner, "回调请求跳过剩余钩子");
                break;
            }
        }
        outcomes
    }

    /// 某类型的回调数量
    pub async fn count(&self, hook_type: HookType) -> usize {
        self.hooks
            .read()
            .await
            .get(&hook_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// 某模块持有的回调数量
    pub async fn count_for(&self, owner: &str) -> usize {
        self.hooks
            .read()
            .await
            .values()
            .flatten()
            .filter(|e| e.owner == owner)
            .count()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}
