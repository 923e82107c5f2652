//! 热重载请求缓冲
//!
//! 重载窗口内，目标为该模块的工作单元在这里排队等待。缓冲区有容量上限，
//! 每个等待者有超时；新实例（或回滚后的旧实例）进入 Running 后按到达顺序放行。
//! 队列已满、等待超时或重载最终失败时，等待者收到 `TemporarilyUnavailable`，
//! 不会被静默丢弃，也不会无限阻塞。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::utils::{CoreError, Result};

/// 单个等待者
struct Waiter {
    sequence: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<()>>,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("sequence", &self.sequence)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

#[derive(Debug, Default)]
struct BufferState {
    waiters: VecDeque<Waiter>,
    /// 关闭后新请求直接放行
    closed: bool,
}

/// 放行结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// 成功通知的等待者
    pub released: usize,
    /// 已超时离开的等待者
    pub abandoned: usize,
}

/// 单个模块一次重载期间的请求缓冲
#[derive(Debug)]
pub struct ReloadBuffer {
    module: String,
    max_size: usize,
    timeout: Duration,
    state: Mutex<BufferState>,
    sequence: AtomicU64,
}

impl ReloadBuffer {
    pub fn new(module: impl Into<String>, max_size: usize, timeout: Duration) -> Self {
        Self {
            module: module.into(),
            max_size,
            timeout,
            state: Mutex::new(BufferState::default()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    fn unavailable(&self, reason: impl Into<String>) -> CoreError {
        CoreError::TemporarilyUnavailable {
            module: self.module.clone(),
            reason: reason.into(),
        }
    }

    /// 排队等待放行
    ///
    /// 缓冲区已关闭时立即返回成功。
    pub async fn wait(&self) -> Result<()> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            // 超时离开的等待者不再占用容量
            state.waiters.retain(|w| !w.tx.is_closed());
            if state.waiters.len() >= self.max_size {
                debug!(module = %self.module, max_size = self.max_size, "重载缓冲已满");
                return Err(self.unavailable(format!("重载缓冲已满 (max_size: {})", self.max_size)));
            }
            let (tx, rx) = oneshot::channel();
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            state.waiters.push_back(Waiter {
                sequence,
                enqueued_at: Instant::now(),
                tx,
            });
            trace!(module = %self.module, sequence, queue_len = state.waiters.len(), "请求进入重载缓冲");
            rx
        };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.unavailable("重载缓冲已被丢弃")),
            Err(_) => Err(self.unavailable(format!(
                "等待热重载超时 ({}ms)",
                self.timeout.as_millis()
            ))),
        }
    }

    /// 按到达顺序放行全部等待者并关闭缓冲
    pub async fn release_all(&self) -> DrainSummary {
        self.drain(|| Ok(())).await
    }

    /// 以 `TemporarilyUnavailable` 结束全部等待者并关闭缓冲
    pub async fn fail_all(&self, reason: &str) -> DrainSummary {
        self.drain(|| Err(self.unavailable(reason))).await
    }

    async fn drain<F: Fn() -> Result<()>>(&self, outcome: F) -> DrainSummary {
        let waiters = {
            let mut state = self.state.lock().await;
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };

        let mut summary = DrainSummary::default();
        for waiter in waiters {
            let waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64;
            if waiter.tx.send(outcome()).is_ok() {
                summary.released += 1;
                trace!(module = %self.module, sequence = waiter.sequence, waited_ms, "缓冲请求已放行");
            } else {
                summary.abandoned += 1;
            }
        }
        debug!(
            module = %self.module,
            released = summary.released,
            abandoned = summary.abandoned,
            "重载缓冲已清空"
        );
        summary
    }

    /// 当前排队数量（含已超时但尚未清理的等待者）
    pub async fn len(&self) -> usize {
        self.state.lock().await.waiters.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}
