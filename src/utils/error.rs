//! 插件编排内核错误类型定义
//!
//! 本模块定义了内核中使用的所有错误类型，按照错误来源分组：
//! 清单、依赖、权限、生命周期、钩子、事件、热重载、服务目录与配置。

use thiserror::Error;

/// 插件编排内核核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 清单错误 ====================

    /// 模块描述缺失必填字段或字段格式无效
    #[error("无效的模块清单: '{module}' - {reason}")]
    InvalidManifest {
        module: String,
        reason: String,
    },

    // ==================== 依赖错误 ====================

    /// 必需依赖未找到
    #[error("模块 '{module}' 的必需依赖 '{dependency}' ({constraint}) 未找到")]
    DependencyNotFound {
        module: String,
        dependency: String,
        constraint: String,
    },

    /// 版本不匹配
    #[error("版本不匹配: 模块 '{module}' 要求 '{dependency}' 满足 {required}, 但实际版本为 {found}")]
    VersionMismatch {
        module: String,
        dependency: String,
        required: String,
        found: String,
    },

    /// 循环依赖，chain 中每个模块出现一次，显示时闭合为 `a -> b -> c -> a`
    #[error("检测到循环依赖: {}", format_cycle(chain))]
    CircularDependency {
        chain: Vec<String>,
    },

    /// 模块有依赖者，无法卸载
    #[error("模块 '{module}' 被以下模块依赖，无法卸载: {dependents:?}")]
    ModuleHasDependents {
        module: String,
        dependents: Vec<String>,
    },

    // ==================== 权限错误 ====================

    /// 权限被拒绝
    #[error("权限被拒绝: 模块 '{module}' 未获授权使用 '{capability}'")]
    PermissionDenied {
        module: String,
        capability: String,
    },

    /// 宿主未提供该服务
    #[error("宿主服务不可用: '{0}'")]
    HostServiceUnavailable(String),

    // ==================== 生命周期错误 ====================

    /// 模块回调失败
    #[error("模块 '{module}' 在 {phase} 阶段失败: {reason}")]
    LifecycleFailed {
        module: String,
        phase: String,
        reason: String,
    },

    /// 模块回调超时
    #[error("模块 '{module}' 在 {phase} 阶段超时 ({timeout_ms}ms)")]
    LifecycleTimeout {
        module: String,
        phase: String,
        timeout_ms: u64,
    },

    /// 状态不允许该转换
    #[error("模块 '{module}' 当前状态 {from} 不允许执行 {action}")]
    InvalidStateTransition {
        module: String,
        from: String,
        action: String,
    },

    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// 模块已加载
    #[error("模块已加载: '{0}'")]
    ModuleAlreadyLoaded(String),

    // ==================== 钩子与事件错误 ====================

    /// 单个钩子回调失败（只记录，不中断分发）
    #[error("钩子 {hook} 的回调 (模块 '{owner}') 失败: {reason}")]
    HookFailed {
        owner: String,
        hook: String,
        reason: String,
    },

    /// 单个事件处理器失败（只记录，不影响发布者）
    #[error("事件 '{event}' 的订阅者 (模块 '{owner}') 处理失败: {reason}")]
    EventHandlerFailed {
        owner: String,
        event: String,
        reason: String,
    },

    /// 订阅未找到
    #[error("订阅未找到: '{0}'")]
    SubscriptionNotFound(String),

    // ==================== 服务目录错误 ====================

    /// 服务未找到
    #[error("服务未找到: '{owner}' 导出的 '{service}'")]
    ServiceNotFound {
        owner: String,
        service: String,
    },

    /// 同一模块重复导出同名服务
    #[error("服务已导出: '{owner}' 已导出 '{service}'")]
    ServiceAlreadyExported {
        owner: String,
        service: String,
    },

    /// 服务句柄类型与请求类型不一致
    #[error("服务类型不匹配: '{owner}' 导出的 '{service}' 不是请求的类型")]
    ServiceTypeMismatch {
        owner: String,
        service: String,
    },

    // ==================== 热重载错误 ====================

    /// 新版本未能进入运行状态
    #[error("模块 '{module}' 热重载失败 (已回滚: {rolled_back}): {reason}")]
    ReloadFailed {
        module: String,
        reason: String,
        rolled_back: bool,
    },

    /// 同一模块已有热重载在进行
    #[error("模块 '{0}' 正在热重载")]
    ReloadInProgress(String),

    /// 热重载窗口内请求无法被服务
    #[error("模块 '{module}' 暂时不可用: {reason}")]
    TemporarilyUnavailable {
        module: String,
        reason: String,
    },

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        key: String,
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

fn format_cycle(chain: &[String]) -> String {
    match chain.first() {
        Some(first) => format!("{} -> {}", chain.join(" -> "), first),
        None => String::new(),
    }
}

/// 内核操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 清单错误
    Manifest,
    /// 依赖错误
    Dependency,
    /// 权限错误
    Permission,
    /// 生命周期错误
    Lifecycle,
    /// 钩子错误
    Hook,
    /// 事件错误
    Event,
    /// 热重载错误
    Reload,
    /// 服务目录错误
    Service,
    /// 配置错误
    Config,
    /// 内部错误
    Internal,
}

/// 状态码常量
pub mod status_code {
    /// 成功
    pub const OK: u16 = 200;

    /// 请求格式错误
    pub const BAD_REQUEST: u16 = 400;

    /// 权限不足
    pub const FORBIDDEN: u16 = 403;

    /// 未找到
    pub const NOT_FOUND: u16 = 404;

    /// 请求超时
    pub const TIMEOUT: u16 = 408;

    /// 冲突
    pub const CONFLICT: u16 = 409;

    /// 依赖无法满足
    pub const FAILED_DEPENDENCY: u16 = 424;

    /// 内部错误
    pub const INTERNAL_ERROR: u16 = 500;

    /// 服务不可用
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// 错误码常量
pub mod error_code {
    // 清单错误 (MANIFEST-xxx)
    pub const MANIFEST_INVALID: &str = "MANIFEST-001";

    // 依赖错误 (DEPENDENCY-xxx)
    pub const DEPENDENCY_NOT_FOUND: &str = "DEPENDENCY-001";
    pub const DEPENDENCY_VERSION_MISMATCH: &str = "DEPENDENCY-002";
    pub const DEPENDENCY_CYCLE: &str = "DEPENDENCY-003";
    pub const DEPENDENCY_HAS_DEPENDENTS: &str = "DEPENDENCY-004";

    // 权限错误 (PERMISSION-xxx)
    pub const PERMISSION_DENIED: &str = "PERMISSION-001";
    pub const PERMISSION_SERVICE_UNAVAILABLE: &str = "PERMISSION-002";

    // 生命周期错误 (LIFECYCLE-xxx)
    pub const LIFECYCLE_CALLBACK_FAILED: &str = "LIFECYCLE-001";
    pub const LIFECYCLE_TIMEOUT: &str = "LIFECYCLE-002";
    pub const LIFECYCLE_INVALID_STATE: &str = "LIFECYCLE-003";
    pub const MODULE_NOT_FOUND: &str = "LIFECYCLE-004";
    pub const MODULE_ALREADY_LOADED: &str = "LIFECYCLE-005";

    // 钩子 / 事件错误
    pub const HOOK_CALLBACK_FAILED: &str = "HOOK-001";
    pub const EVENT_HANDLER_FAILED: &str = "EVENT-001";
    pub const EVENT_SUBSCRIPTION_NOT_FOUND: &str = "EVENT-002";

    // 服务目录错误 (SERVICE-xxx)
    pub const SERVICE_NOT_FOUND: &str = "SERVICE-001";
    pub const SERVICE_ALREADY_EXPORTED: &str = "SERVICE-002";
    pub const SERVICE_TYPE_MISMATCH: &str = "SERVICE-003";

    // 热重载错误 (RELOAD-xxx)
    pub const RELOAD_FAILED: &str = "RELOAD-001";
    pub const RELOAD_IN_PROGRESS: &str = "RELOAD-002";
    pub const RELOAD_UNAVAILABLE: &str = "RELOAD-003";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";
}

impl CoreError {
    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidManifest { .. } => ErrorKind::Manifest,
            CoreError::DependencyNotFound { .. }
            | CoreError::VersionMismatch { .. }
            | CoreError::CircularDependency { .. }
            | CoreError::ModuleHasDependents { .. } => ErrorKind::Dependency,
            CoreError::PermissionDenied { .. } | CoreError::HostServiceUnavailable(_) => {
                ErrorKind::Permission
            }
            CoreError::LifecycleFailed { .. }
            | CoreError::LifecycleTimeout { .. }
            | CoreError::InvalidStateTransition { .. }
            | CoreError::ModuleNotFound(_)
            | CoreError::ModuleAlreadyLoaded(_) => ErrorKind::Lifecycle,
            CoreError::HookFailed { .. } => ErrorKind::Hook,
            CoreError::EventHandlerFailed { .. } | CoreError::SubscriptionNotFound(_) => {
                ErrorKind::Event
            }
            CoreError::ServiceNotFound { .. }
            | CoreError::ServiceAlreadyExported { .. }
            | CoreError::ServiceTypeMismatch { .. } => ErrorKind::Service,
            CoreError::ReloadFailed { .. }
            | CoreError::ReloadInProgress(_)
            | CoreError::TemporarilyUnavailable { .. } => ErrorKind::Reload,
            CoreError::ConfigLoadFailed(_)
            | CoreError::InvalidConfigValue { .. }
            | CoreError::Yaml(_)
            | CoreError::Json(_) => ErrorKind::Config,
            CoreError::VersionParse(_) => ErrorKind::Manifest,
            _ => ErrorKind::Internal,
        }
    }

    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidManifest { .. } => error_code::MANIFEST_INVALID,
            CoreError::DependencyNotFound { .. } => error_code::DEPENDENCY_NOT_FOUND,
            CoreError::VersionMismatch { .. } => error_code::DEPENDENCY_VERSION_MISMATCH,
            CoreError::CircularDependency { .. } => error_code::DEPENDENCY_CYCLE,
            CoreError::ModuleHasDependents { .. } => error_code::DEPENDENCY_HAS_DEPENDENTS,
            CoreError::PermissionDenied { .. } => error_code::PERMISSION_DENIED,
            CoreError::HostServiceUnavailable(_) => error_code::PERMISSION_SERVICE_UNAVAILABLE,
            CoreError::LifecycleFailed { .. } => error_code::LIFECYCLE_CALLBACK_FAILED,
            CoreError::LifecycleTimeout { .. } => error_code::LIFECYCLE_TIMEOUT,
            CoreError::InvalidStateTransition { .. } => error_code::LIFECYCLE_INVALID_STATE,
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::ModuleAlreadyLoaded(_) => error_code::MODULE_ALREADY_LOADED,
            CoreError::HookFailed { .. } => error_code::HOOK_CALLBACK_FAILED,
            CoreError::EventHandlerFailed { .. } => error_code::EVENT_HANDLER_FAILED,
            CoreError::SubscriptionNotFound(_) => error_code::EVENT_SUBSCRIPTION_NOT_FOUND,
            CoreError::ServiceNotFound { .. } => error_code::SERVICE_NOT_FOUND,
            CoreError::ServiceAlreadyExported { .. } => error_code::SERVICE_ALREADY_EXPORTED,
            CoreError::ServiceTypeMismatch { .. } => error_code::SERVICE_TYPE_MISMATCH,
            CoreError::ReloadFailed { .. } => error_code::RELOAD_FAILED,
            CoreError::ReloadInProgress(_) => error_code::RELOAD_IN_PROGRESS,
            CoreError::TemporarilyUnavailable { .. } => error_code::RELOAD_UNAVAILABLE,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            _ => "UNKNOWN",
        }
    }

    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::InvalidManifest { .. } => status_code::BAD_REQUEST,
            CoreError::DependencyNotFound { .. }
            | CoreError::VersionMismatch { .. }
            | CoreError::CircularDependency { .. } => status_code::FAILED_DEPENDENCY,
            CoreError::ModuleHasDependents { .. } => status_code::CONFLICT,
            CoreError::PermissionDenied { .. } => status_code::FORBIDDEN,
            CoreError::ModuleNotFound(_)
            | CoreError::ServiceNotFound { .. }
            | CoreError::SubscriptionNotFound(_) => status_code::NOT_FOUND,
            CoreError::ModuleAlreadyLoaded(_)
            | CoreError::ServiceAlreadyExported { .. }
            | CoreError::ReloadInProgress(_)
            | CoreError::InvalidStateTransition { .. } => status_code::CONFLICT,
            CoreError::LifecycleTimeout { .. } => status_code::TIMEOUT,
            CoreError::TemporarilyUnavailable { .. } | CoreError::HostServiceUnavailable(_) => {
                status_code::SERVICE_UNAVAILABLE
            }
            CoreError::InvalidConfigValue { .. } => status_code::BAD_REQUEST,
            _ => status_code::INTERNAL_ERROR,
        }
    }

    /// 是否为权限拒绝
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, CoreError::PermissionDenied { .. })
    }

    /// 是否为热重载窗口内的暂时不可用
    pub fn is_temporarily_unavailable(&self) -> bool {
        matches!(self, CoreError::TemporarilyUnavailable { .. })
    }
}
