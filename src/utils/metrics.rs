//! 钩子耗时统计
//!
//! 健康追踪器为每个 (模块, 钩子类型) 维护一个 [`LatencyRecorder`]，
//! 记录调用次数、失败次数和耗时分布，供运维工具通过 `get_health` 查询。
//!
//! ```rust
//! use chips_plugin_core::utils::metrics::LatencyRecorder;
//!
//! let recorder = LatencyRecorder::new();
//! recorder.record(true, 1500);
//! recorder.record(false, 5000);
//!
//! let snapshot = recorder.snapshot();
//! assert_eq!(snapshot.invocations, 2);
//! assert_eq!(snapshot.failures, 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// 耗时样本上限
const MAX_LATENCY_SAMPLES: usize = 2_048;

/// 耗时记录器
///
/// 计数器使用 `AtomicU64`，样本使用 `Mutex<Vec<u64>>`，可在分发线程间共享。
#[derive(Debug)]
pub struct LatencyRecorder {
    invocations: AtomicU64,
    failures: AtomicU64,
    total_us: AtomicU64,
    min_us: AtomicU64,
    max_us: AtomicU64,
    samples: Mutex<Vec<u64>>,
    last_invoked_at: Mutex<Option<DateTime<Utc>>>,
}

impl LatencyRecorder {
    /// 创建空的记录器
    pub fn new() -> Self {
        Self {
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_us: AtomicU64::new(0),
            min_us: AtomicU64::new(u64::MAX),
            max_us: AtomicU64::new(0),
            samples: Mutex::new(Vec::with_capacity(64)),
            last_invoked_at: Mutex::new(None),
        }
    }

    /// 记录一次调用
    ///
    /// * `success` - 回调是否成功
    /// * `latency_us` - 回调耗时（微秒）
    pub fn record(&self, success: bool, latency_us: u64) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(latency_us, Ordering::Relaxed);
        if !success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }

        self.min_us.fetch_min(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);

        if let Ok(mut samples) = self.samples.lock() {
            // 滑动窗口：超过上限时丢弃前一半
            if samples.len() >= MAX_LATENCY_SAMPLES {
                let half = samples.len() / 2;
                samples.drain(0..half);
            }
            samples.push(latency_us);
        }

        if let Ok(mut last) = self.last_invoked_at.lock() {
            *last = Some(Utc::now());
        }
    }

    /// 计算指定百分位数的耗时（最近等级法），没有样本时返回 0
    pub fn percentile(&self, p: f64) -> u64 {
        let p = p.clamp(0.0, 1.0);
        let Ok(samples) = self.samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }

        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx.min(sorted.len() - 1)]
    }

    /// 调用次数
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// 失败次数
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// 平均耗时（微秒）
    pub fn average(&self) -> u64 {
        let count = self.invocations();
        if count == 0 {
            return 0;
        }
        self.total_us.load(Ordering::Relaxed) / count
    }

    /// 导出快照
    pub fn snapshot(&self) -> LatencySnapshot {
        let min = self.min_us.load(Ordering::Relaxed);
        LatencySnapshot {
            invocations: self.invocations(),
            failures: self.failures(),
            avg_us: self.average(),
            min_us: if min == u64::MAX { 0 } else { min },
            max_us: self.max_us.load(Ordering::Relaxed),
            p50_us: self.percentile(0.50),
            p95_us: self.percentile(0.95),
            p99_us: self.percentile(0.99),
            last_invoked_at: self.last_invoked_at.lock().ok().and_then(|t| *t),
        }
    }
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// 耗时快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// 调用次数
    pub invocations: u64,
    /// 失败次数
    pub failures: u64,
    /// 平均耗时（微秒）
    pub avg_us: u64,
    /// 最小耗时（微秒）
    pub min_us: u64,
    /// 最大耗时（微秒）
    pub max_us: u64,
    /// P50（微秒）
    pub p50_us: u64,
    /// P95（微秒）
    pub p95_us: u64,
    /// P99（微秒）
    pub p99_us: u64,
    /// 最后一次调用时间
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_invoked_at: Option<DateTime<Utc>>,
}
