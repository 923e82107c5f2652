//! 钩子类型与钩子上下文

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 钩子类型
///
/// 生命周期钩子在进程启动、关闭时各分发一次；其余是请求流水线上的扩展点。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    /// 进程启动，任何模块 Start 之前
    ProcessStart,
    /// 进程关闭，任何模块 Stop 之前
    ProcessShutdown,
    /// 工作单元路由之前
    PreDispatch,
    /// 处理器完成之后
    PostDispatch,
    /// 响应定稿之前
    PreEmit,
    /// 响应发出之后
    PostEmit,
    /// 处理出错
    OnError,
}

impl HookType {
    pub const ALL: [HookType; 7] = [
        HookType::ProcessStart,
        HookType::ProcessShutdown,
        HookType::PreDispatch,
        HookType::PostDispatch,
        HookType::PreEmit,
        HookType::PostEmit,
        HookType::OnError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::ProcessStart => "process_start",
            HookType::ProcessShutdown => "process_shutdown",
            HookType::PreDispatch => "pre_dispatch",
            HookType::PostDispatch => "post_dispatch",
            HookType::PreEmit => "pre_emit",
            HookType::PostEmit => "post_emit",
            HookType::OnError => "on_error",
        }
    }

    /// 流水线钩子才携带可跳过的上下文
    pub fn is_pipeline(&self) -> bool {
        matches!(
            self,
            HookType::PreDispatch | HookType::PostDispatch | HookType::PreEmit | HookType::PostEmit
        )
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 钩子上下文
///
/// 一次分发内所有回调共享同一个上下文，可以通过 `data` 互相传递数据。
/// 流水线钩子中任一回调调用 [`HookContext::skip_remaining`] 后，
/// 本次分发不再调用后续回调。
#[derive(Debug, Clone)]
pub struct HookContext {
    hook_type: HookType,
    /// 工作单元的目标模块
    target: Option<String>,
    /// 错误描述，仅 OnError 使用
    error: Option<String>,
    data: HashMap<String, Value>,
    skip_requested: bool,
}

impl HookContext {
    pub fn new(hook_type: HookType) -> Self {
        Self {
            hook_type,
            target: None,
            error: None,
            data: HashMap::new(),
            skip_requested: false,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn hook_type(&self) -> HookType {
        self.hook_type
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    /// 请求跳过本次分发的剩余回调，生命周期钩子忽略该请求
    pub fn skip_remaining(&mut self) {
        self.skip_requested = true;
    }

    /// 跳过请求是否生效
    pub fn should_skip(&self) -> bool {
        self.skip_requested && self.hook_type.is_pipeline()
    }
}

/// 钩子回调
pub type HookCallback = Arc<dyn Fn(&mut HookContext) -> anyhow::Result<()> + Send + Sync>;

/// 单个回调的执行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum HookResult {
    Success,
    Failed(String),
    Panicked(String),
}

impl HookResult {
    pub fn is_success(&self) -> bool {
        matches!(self, HookResult::Success)
    }
}

/// 一次分发中每个回调的结果
#[derive(Debug, Clone, Serialize)]
pub struct HookOutcome {
    pub handle: String,
    pub owner: String,
    pub priority: i32,
    pub result: HookResult,
    pub duration_us: u64,
}
