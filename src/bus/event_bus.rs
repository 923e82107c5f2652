//! 事件总线
//!
//! 模块间的异步发布订阅通道，与钩子注册表相互独立。
//!
//! - 每个订阅拥有一个有界队列和一个独立的投递任务，同一发布者发给同一订阅者的
//!   事件按发布顺序到达（每订阅者 FIFO），不同订阅者之间不保证顺序。
//! - `publish` 只把事件放入各订阅者队列后立即返回，从不等待处理器执行；
//!   队列已满时该订阅者丢弃此事件并记为一次事件错误。
//! - 处理器返回错误、panic 或超时只记录到该订阅者所属模块的健康计数。
//!
//! # 注销与迟到投递
//!
//! 模块停止时 [`EventBus::unsubscribe_all`] 批量移除其订阅。与此并发、且在
//! 移除之前已经开始的 `publish` 可能仍把事件放进该订阅者的队列，投递任务会在
//! 队列排空后退出，因此处理器可能在注销后收到少量迟到事件。这一竞争是良性的：
//! 处理器必须能安全地处理迟到投递。
//!
//! ```rust,no_run
//! use chips_plugin_core::bus::{Event, EventBus};
//! use chips_plugin_core::core::config::EventConfig;
//! use chips_plugin_core::module::health::HealthTracker;
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let bus = EventBus::new(EventConfig::default(), Arc::new(HealthTracker::new()));
//! bus.subscribe("audit", "user.*", Arc::new(|event: Event| {
//!     Box::pin(async move {
//!         tracing::info!(event = %event.name, "收到事件");
//!         Ok(())
//!     })
//! })).await;
//! bus.publish(Event::new("user.created", "auth", serde_json::json!({"id": 7}))).await;
//! # }
//! ```

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::bus::event::{matches_pattern, Event};
use crate::core::config::EventConfig;
use crate::hooks::registry::panic_message;
use crate::module::health::HealthTracker;
use crate::utils::{prefixed_id, CoreError, Result};

/// 事件处理器
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct SubscriptionEntry {
    id: String,
    owner: String,
    pattern: String,
    sender: mpsc::Sender<Event>,
}

#[derive(Debug, Default)]
struct StatsCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    dropped: AtomicU64,
}

/// 分发统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// 发布次数
    pub published: u64,
    /// 处理成功次数
    pub delivered: u64,
    /// 处理失败次数（含 panic）
    pub failed: u64,
    /// 处理超时次数
    pub timeouts: u64,
    /// 队列满被丢弃的次数
    pub dropped: u64,
}

/// 事件总线
pub struct EventBus {
    /// 订阅模式 -> 订阅列表
    subscriptions: RwLock<HashMap<String, Vec<Arc<SubscriptionEntry>>>>,
    stats: Arc<StatsCounters>,
    config: EventConfig,
    health: Arc<HealthTracker>,
}

impl EventBus {
    pub fn new(config: EventConfig, health: Arc<HealthTracker>) -> Self {
        debug!(
            handler_timeout_ms = config.handler_timeout_ms,
            queue_capacity = config.subscriber_queue_capacity,
            "创建事件总线"
        );
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            stats: Arc::new(StatsCounters::default()),
            config,
            health,
        }
    }

    /// 订阅事件，`pattern` 支持 `*` 和 `prefix.*`，返回订阅 ID
    pub async fn subscribe(&self, owner: &str, pattern: &str, handler: EventHandler) -> String {
        let (sender, receiver) = mpsc::channel(self.config.subscriber_queue_capacity.max(1));
        let entry = Arc::new(SubscriptionEntry {
            id: prefixed_id("sub"),
            owner: owner.to_string(),
            pattern: pattern.to_string(),
            sender,
        });
        let id = entry.id.clone();

        tokio::spawn(Self::run_worker(
            id.clone(),
            owner.to_string(),
            receiver,
            handler,
            self.config.handler_timeout(),
            self.stats.clone(),
            self.health.clone(),
        ));

        self.subscriptions
            .write()
            .await
            .entry(pattern.to_string())
            .or_default()
            .push(entry);

        debug!(module = %owner, event = %pattern, handle = %id, "已订阅事件");
        id
    }

    /// 投递任务：按到达顺序逐个调用处理器，发送端全部释放后退出
    async fn run_worker(
        id: String,
        owner: String,
        mut receiver: mpsc::Receiver<Event>,
        handler: EventHandler,
        handler_timeout: Duration,
        stats: Arc<StatsCounters>,
        health: Arc<HealthTracker>,
    ) {
        while let Some(event) = receiver.recv().await {
            let name = event.name.clone();
            let handler = handler.clone();
            let call = AssertUnwindSafe(async move { handler(event).await }).catch_unwind();

            let failure = match timeout(handler_timeout, call).await {
                Ok(Ok(Ok(()))) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Ok(Ok(Err(e))) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    Some(format!("{:#}", e))
                }
                Ok(Err(panic)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    Some(panic_message(&*panic))
                }
                Err(_) => {
                    stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    Some(format!("处理超时 ({}ms)", handler_timeout.as_millis()))
                }
            };

            if let Some(reason) = failure {
                let err = CoreError::EventHandlerFailed {
                    owner: owner.clone(),
                    event: name.clone(),
                    reason: reason.clone(),
                };
                warn!(module = %owner, event = %name, error_code = err.error_code(), "{}", err);
                health.record_event_failure(&owner, &name, &reason).await;
            }
        }
        trace!(handle = %id, module = %owner, "订阅投递任务退出");
    }

    /// 发布事件，立即返回入队的订阅者数量
    pub async fn publish(&self, event: Event) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<Arc<SubscriptionEntry>> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|(pattern, _)| matches_pattern(pattern, &event.name))
                .flat_map(|(_, subs)| subs.iter().cloned())
                .collect()
        };

        if targets.is_empty() {
            trace!(event = %event.name, source = %event.source, "没有匹配的订阅者");
            return 0;
        }

        let mut queued = 0;
        for sub in targets {
            match sub.sender.try_send(event.clone()) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        module = %sub.owner,
                        event = %event.name,
                        handle = %sub.id,
                        "订阅者队列已满，事件被丢弃"
                    );
                    self.health
                        .record_event_failure(&sub.owner, &event.name, "订阅者队列已满")
                        .await;
                }
                // 订阅已被注销
                Err(TrySendError::Closed(_)) => {}
            }
        }

        trace!(event = %event.name, source = %event.source, queued, "事件已发布");
        queued
    }

    /// 按订阅 ID 注销
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        for subs in subscriptions.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                subs.remove(pos);
                subscriptions.retain(|_, subs| !subs.is_empty());
                return Ok(());
            }
        }
        Err(CoreError::SubscriptionNotFound(id.to_string()))
    }

    /// 注销某模块的全部订阅，返回移除数量
    pub async fn unsubscribe_all(&self, owner: &str) -> usize {
        let mut subscriptions = self.subscriptions.write().await;
        let mut removed = 0;
        for subs in subscriptions.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.owner != owner);
            removed += before - subs.len();
        }
        subscriptions.retain(|_, subs| !subs.is_empty());
        if removed > 0 {
            debug!(module = %owner, removed, "已注销模块的全部订阅");
        }
        removed
    }

    /// 订阅总数
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.values().map(Vec::len).sum()
    }

    /// 某模块的订阅 ID
    pub async fn subscriptions_for(&self, owner: &str) -> Vec<String> {
        self.subscriptions
            .read()
            .await
            .values()
            .flatten()
            .filter(|s| s.owner == owner)
            .map(|s| s.id.clone())
            .collect()
    }

    /// 是否有订阅者会收到该事件名
    pub async fn has_subscribers(&self, name: &str) -> bool {
        self.subscriptions
            .read()
            .await
            .iter()
            .any(|(pattern, subs)| !subs.is_empty() && matches_pattern(pattern, name))
    }

    /// 订阅模式列表（去重排序）
    pub async fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .subscriptions
            .read()
            .await
            .values()
            .flatten()
            .map(|s| s.pattern.clone())
            .collect();
        patterns.sort();
        patterns.dedup();
        patterns
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            published: self.stats.published.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

/// 把异步闭包包装为 [`EventHandler`]
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}
