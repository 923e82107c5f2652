//! 模块元数据定义
//!
//! 模块描述（清单解析后的结构化形式）、依赖声明、权限、状态和运行时信息。

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::utils::{CoreError, Result};

/// 依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// 依赖的模块名
    pub name: String,

    /// 版本约束，支持 `>=`、`<`、`^`、`~`，逗号表示同时满足
    #[serde(default = "default_constraint", alias = "version")]
    pub constraint: String,

    /// 可选依赖缺失时不影响加载
    #[serde(default)]
    pub optional: bool,
}

fn default_constraint() -> String {
    "*".to_string()
}

impl DependencySpec {
    /// 必需依赖
    pub fn required(name: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: constraint.into(),
            optional: false,
        }
    }

    /// 可选依赖
    pub fn optional(name: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constraint: constraint.into(),
            optional: true,
        }
    }

    /// 解析版本约束
    pub fn requirement(&self) -> Result<VersionReq> {
        Ok(VersionReq::parse(&self.constraint)?)
    }

    /// 检查版本是否满足约束，约束无法解析时视为不满足
    pub fn matches(&self, version: &Version) -> bool {
        self.requirement()
            .map(|req| req.matches(version))
            .unwrap_or(false)
    }
}

/// 能力标志
///
/// 内置七种宿主服务能力，其余名称作为自定义能力保留原文。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    Database,
    Cache,
    Router,
    Config,
    Filesystem,
    Network,
    Exec,
    Custom(String),
}

impl Capability {
    /// 内置能力列表
    pub const BUILTIN: [Capability; 7] = [
        Capability::Database,
        Capability::Cache,
        Capability::Router,
        Capability::Config,
        Capability::Filesystem,
        Capability::Network,
        Capability::Exec,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            Capability::Database => "database",
            Capability::Cache => "cache",
            Capability::Router => "router",
            Capability::Config => "config",
            Capability::Filesystem => "filesystem",
            Capability::Network => "network",
            Capability::Exec => "exec",
            Capability::Custom(name) => name,
        }
    }

    /// 自定义能力名只允许小写字母、数字和 `_` `-` `.` `:`
    pub fn is_well_formed(&self) -> bool {
        match self {
            Capability::Custom(name) => {
                !name.is_empty()
                    && name.chars().all(|c| {
                        c.is_ascii_lowercase()
                            || c.is_ascii_digit()
                            || matches!(c, '_' | '-' | '.' | ':')
                    })
            }
            _ => true,
        }
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        match s.as_str() {
            "database" => Capability::Database,
            "cache" => Capability::Cache,
            "router" => Capability::Router,
            "config" => Capability::Config,
            "filesystem" => Capability::Filesystem,
            "network" => Capability::Network,
            "exec" => Capability::Exec,
            _ => Capability::Custom(s),
        }
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Capability::from(s.to_string())
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 权限授予
///
/// 加载时由清单生成，之后不可变。重新授权只能卸载后重新加载。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionGrant {
    capabilities: Arc<BTreeSet<Capability>>,
}

impl PermissionGrant {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            capabilities: Arc::new(capabilities.into_iter().collect()),
        }
    }

    /// 空授权
    pub fn none() -> Self {
        Self::default()
    }

    pub fn allows(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.iter()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// 配置模式
///
/// JSON Schema 的子集：`type`、`required`、`properties`（递归）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema(pub Value);

const SCHEMA_TYPES: [&str; 7] = [
    "object", "string", "number", "integer", "boolean", "array", "null",
];

impl ConfigSchema {
    pub fn new(schema: Value) -> Self {
        Self(schema)
    }

    /// 检查模式本身是否合法
    pub fn check(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        Self::check_node(&self.0, "$", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check_node(node: &Value, path: &str, errors: &mut Vec<String>) {
        let Some(obj) = node.as_object() else {
            errors.push(format!("{}: 模式必须是对象", path));
            return;
        };
        if let Some(ty) = obj.get("type") {
            match ty.as_str() {
                Some(t) if SCHEMA_TYPES.contains(&t) => {}
                _ => errors.push(format!("{}: 未知类型 {}", path, ty)),
            }
        }
        if let Some(required) = obj.get("required") {
            let ok = required
                .as_array()
                .map(|a| a.iter().all(Value::is_string))
                .unwrap_or(false);
            if !ok {
                errors.push(format!("{}: required 必须是字符串数组", path));
            }
        }
        if let Some(props) = obj.get("properties") {
            match props.as_object() {
                Some(props) => {
                    for (key, child) in props {
                        Self::check_node(child, &format!("{}.{}", path, key), errors);
                    }
                }
                None => errors.push(format!("{}: properties 必须是对象", path)),
            }
        }
    }

    /// 按模式校验配置值，返回所有不符合项
    pub fn validate(&self, value: &Value) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        Self::validate_node(&self.0, value, "$", &mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_node(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
        if let Some(ty) = schema.get("type").and_then(Value::as_str) {
            if !type_matches(ty, value) {
                errors.push(format!("{}: 期望 {}，实际为 {}", path, ty, type_name(value)));
                return;
            }
        }

        let Some(obj) = value.as_object() else {
            return;
        };

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    errors.push(format!("{}: 缺少必填字段 '{}'", path, key));
                }
            }
        }

        if let Some(props) = schema.get("properties").and_then(Value::as_object) {
            for (key, child_schema) in props {
                if let Some(child) = obj.get(key) {
                    Self::validate_node(child_schema, child, &format!("{}.{}", path, key), errors);
                }
            }
        }
    }
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "object" => value.is_object(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 模块描述
///
/// 加载开始时由清单生成，加载后不可变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// 模块名，宿主内唯一
    pub name: String,

    /// 模块版本
    pub version: Version,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    #[serde(default)]
    pub permissions: Vec<Capability>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<ConfigSchema>,

    /// 无依赖关系时的加载顺序，数值小的先加载
    #[serde(default)]
    pub priority: i32,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            dependencies: Vec::new(),
            permissions: Vec::new(),
            config_schema: None,
            priority: 0,
        }
    }

    /// 从版本字符串创建
    pub fn parse(name: impl Into<String>, version: &str) -> Result<Self> {
        let name = name.into();
        let version = Version::parse(version).map_err(|e| CoreError::InvalidManifest {
            module: name.clone(),
            reason: format!("无效的版本号 '{}': {}", version, e),
        })?;
        Ok(Self::new(name, version))
    }

    pub fn with_dependency(mut self, dep: DependencySpec) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn with_permission(mut self, capability: impl Into<Capability>) -> Self {
        self.permissions.push(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_config_schema(mut self, schema: Value) -> Self {
        self.config_schema = Some(ConfigSchema::new(schema));
        self
    }

    /// 生成权限授予
    pub fn grant(&self) -> PermissionGrant {
        PermissionGrant::new(self.permissions.iter().cloned())
    }

    /// 按名查找依赖声明
    pub fn dependency(&self, name: &str) -> Option<&DependencySpec> {
        self.dependencies.iter().find(|d| d.name == name)
    }

    /// 检查描述是否合法，返回全部问题
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("模块名不能为空".to_string());
        } else if self.name.chars().any(char::is_whitespace) {
            errors.push(format!("模块名不能包含空白字符: '{}'", self.name));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.name.trim().is_empty() {
                errors.push("依赖名不能为空".to_string());
                continue;
            }
            if dep.name == self.name {
                errors.push(format!("模块不能依赖自身: '{}'", dep.name));
            }
            if !seen.insert(dep.name.as_str()) {
                errors.push(format!("重复的依赖声明: '{}'", dep.name));
            }
            if let Err(e) = dep.requirement() {
                errors.push(format!(
                    "依赖 '{}' 的版本约束无效 '{}': {}",
                    dep.name, dep.constraint, e
                ));
            }
        }

        for cap in &self.permissions {
            if !cap.is_well_formed() {
                errors.push(format!("无效的能力名: '{}'", cap));
            }
        }

        if let Some(schema) = &self.config_schema {
            if let Err(schema_errors) = schema.check() {
                errors.extend(schema_errors.into_iter().map(|e| format!("configSchema {}", e)));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// 按本模块的配置模式校验配置，未声明模式时总是通过
    pub fn validate_config(&self, config: &Value) -> Result<()> {
        match &self.config_schema {
            Some(schema) => schema.validate(config).map_err(|errors| {
                CoreError::InvalidConfigValue {
                    key: format!("modules.{}", self.name),
                    reason: errors.join("; "),
                }
            }),
            None => Ok(()),
        }
    }
}

/// 模块状态
///
/// `Unloaded → Loading → Initialized → Running → Stopped → Unloaded`，
/// `Loading`、`Initialized`、`Running` 可进入 `Error`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Unloaded,
    Loading,
    Initialized,
    Running,
    Stopped,
    Error,
}

impl Default for ModuleState {
    fn default() -> Self {
        ModuleState::Unloaded
    }
}

impl ModuleState {
    /// 是否可以初始化
    pub fn can_initialize(&self) -> bool {
        matches!(self, ModuleState::Loading)
    }

    /// 是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, ModuleState::Initialized)
    }

    /// 是否需要执行停止（Stopped 上再次停止是空操作）
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            ModuleState::Initialized | ModuleState::Running | ModuleState::Error
        )
    }

    /// 是否可以卸载
    pub fn can_unload(&self) -> bool {
        matches!(
            self,
            ModuleState::Loading | ModuleState::Stopped | ModuleState::Error
        )
    }

    /// 是否可以进入 Error
    pub fn can_fail(&self) -> bool {
        matches!(
            self,
            ModuleState::Loading | ModuleState::Initialized | ModuleState::Running
        )
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Unloaded => "unloaded",
            ModuleState::Loading => "loading",
            ModuleState::Initialized => "initialized",
            ModuleState::Running => "running",
            ModuleState::Stopped => "stopped",
            ModuleState::Error => "error",
        };
        f.write_str(s)
    }
}

/// 模块运行时信息（运维查询用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub state: ModuleState,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub permissions: Vec<String>,
    pub loaded_at: DateTime<Utc>,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ModuleInfo {
    pub fn is_running(&self) -> bool {
        self.state == ModuleState::Running
    }
}

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// 运行中但有错误记录
    Degraded,
    /// 未运行或处于 Error
    Unhealthy,
}

impl HealthStatus {
    /// 由状态和错误计数推导
    pub fn derive(state: ModuleState, error_count: u64) -> Self {
        match state {
            ModuleState::Running if error_count == 0 => HealthStatus::Healthy,
            ModuleState::Running | ModuleState::Initialized => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}
