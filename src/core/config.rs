//! 宿主配置
//!
//! 定义插件宿主的配置结构和加载逻辑。配置文件按扩展名选择 JSON 或 YAML，
//! 缺省字段使用各自的默认值。

use crate::utils::{CoreError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 保留日志文件数
    #[serde(default = "default_max_files")]
    pub max_files: usize,

    /// 额外的 EnvFilter 指令
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

fn default_max_files() -> usize {
    7
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            max_files: default_max_files(),
            filter: None,
        }
    }
}

/// 生命周期配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// 单次 Initialize/Start/Stop/Cleanup 调用的超时（毫秒）
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

impl LifecycleConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// 热重载配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotReloadConfig {
    /// 是否允许热重载
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 重载期间缓冲的最大请求数
    #[serde(default = "default_reload_queue_size")]
    pub queue_size: usize,

    /// 缓冲请求的最长等待（毫秒）
    #[serde(default = "default_reload_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// 新实例启动后的观察窗口（毫秒），窗口内崩溃会触发回滚
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_reload_queue_size() -> usize {
    1024
}

fn default_reload_queue_timeout_ms() -> u64 {
    10_000
}

fn default_grace_period_ms() -> u64 {
    500
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_size: default_reload_queue_size(),
            queue_timeout_ms: default_reload_queue_timeout_ms(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl HotReloadConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// 事件总线配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventConfig {
    /// 单个订阅者处理一个事件的超时（毫秒）
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// 每个订阅者的投递队列容量
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
}

fn default_handler_timeout_ms() -> u64 {
    5_000
}

fn default_subscriber_queue_capacity() -> usize {
    1024
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
        }
    }
}

impl EventConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// 宿主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LogConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub hot_reload: HotReloadConfig,

    #[serde(default)]
    pub events: EventConfig,

    /// 模块名 → 模块配置，初始化前按模块的 config schema 校验
    #[serde(default)]
    pub modules: HashMap<String, Value>,
}

impl HostConfig {
    /// 创建配置构建器
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::new()
    }

    /// 从文件加载配置，`.json` 按 JSON 解析，其余按 YAML 解析
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("无法读取 {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_str_with_ext(&content, is_json_path(&path))?;
        config.config_path = Some(path);
        config.validate()?;
        Ok(config)
    }

    /// 从字符串解析
    pub fn from_str_with_ext(content: &str, json: bool) -> Result<Self> {
        let config: HostConfig = if json {
            serde_json::from_str(content)?
        } else {
            serde_yaml::from_str(content)?
        };
        Ok(config)
    }

    /// 校验数值范围
    pub fn validate(&self) -> Result<()> {
        fn positive(key: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(CoreError::InvalidConfigValue {
                    key: key.to_string(),
                    reason: "必须大于 0".to_string(),
                });
            }
            Ok(())
        }

        positive("lifecycle.operation_timeout_ms", self.lifecycle.operation_timeout_ms)?;
        positive("hot_reload.queue_size", self.hot_reload.queue_size as u64)?;
        positive("hot_reload.queue_timeout_ms", self.hot_reload.queue_timeout_ms)?;
        positive("events.handler_timeout_ms", self.events.handler_timeout_ms)?;
        positive(
            "events.subscriber_queue_capacity",
            self.events.subscriber_queue_capacity as u64,
        )?;

        for (name, value) in &self.modules {
            if !value.is_object() && !value.is_null() {
                return Err(CoreError::InvalidConfigValue {
                    key: format!("modules.{}", name),
                    reason: "模块配置必须是对象".to_string(),
                });
            }
        }
        Ok(())
    }

    /// 取模块配置，未配置时返回空对象
    pub fn module_config(&self, name: &str) -> Value {
        self.modules
            .get(name)
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// 合并另一个配置，只覆盖与默认值不同的字段
    pub fn merge(&mut self, other: HostConfig) {
        let defaults = HostConfig::default();

        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if other.logging.filter.is_some() {
            self.logging.filter = other.logging.filter;
        }
        if other.lifecycle != defaults.lifecycle {
            self.lifecycle = other.lifecycle;
        }
        if other.hot_reload != defaults.hot_reload {
            self.hot_reload = other.hot_reload;
        }
        if other.events != defaults.events {
            self.events = other.events;
        }
        self.modules.extend(other.modules);
        if other.config_path.is_some() {
            self.config_path = other.config_path;
        }
    }
}

fn is_json_path(path: &std::path::Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
        }
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 设置生命周期调用超时
    pub fn operation_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lifecycle.operation_timeout_ms = ms;
        self
    }

    /// 启用或禁用热重载
    pub fn hot_reload(mut self, enabled: bool) -> Self {
        self.config.hot_reload.enabled = enabled;
        self
    }

    /// 设置重载缓冲队列大小
    pub fn reload_queue_size(mut self, size: usize) -> Self {
        self.config.hot_reload.queue_size = size;
        self
    }

    /// 设置重载缓冲超时
    pub fn reload_queue_timeout_ms(mut self, ms: u64) -> Self {
        self.config.hot_reload.queue_timeout_ms = ms;
        self
    }

    /// 设置重载观察窗口
    pub fn grace_period_ms(mut self, ms: u64) -> Self {
        self.config.hot_reload.grace_period_ms = ms;
        self
    }

    /// 设置事件处理超时
    pub fn handler_timeout_ms(mut self, ms: u64) -> Self {
        self.config.events.handler_timeout_ms = ms;
        self
    }

    /// 设置订阅者队列容量
    pub fn subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.events.subscriber_queue_capacity = capacity;
        self
    }

    /// 设置模块配置
    pub fn module_config(mut self, name: impl Into<String>, value: Value) -> Self {
        self.config.modules.insert(name.into(), value);
        self
    }

    pub fn build(self) -> HostConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.lifecycle.operation_timeout_ms, 30_000);
        assert!(config.hot_reload.enabled);
        assert_eq!(config.hot_reload.queue_size, 1024);
        assert_eq!(config.hot_reload.queue_timeout_ms, 10_000);
        assert_eq!(config.hot_reload.grace_period_ms, 500);
        assert_eq!(config.events.handler_timeout_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
lifecycle:
  operation_timeout_ms: 2000
modules:
  auth:
    secret: abc
"#;
        let config = HostConfig::from_str_with_ext(yaml, false).unwrap();
        assert_eq!(config.lifecycle.operation_timeout_ms, 2000);
        assert_eq!(config.hot_reload.queue_size, 1024);
        assert_eq!(config.module_config("auth")["secret"], "abc");
        assert_eq!(config.module_config("missing"), json!({}));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = HostConfig::builder().reload_queue_size(0).build();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidConfigValue { ref key, .. } if key == "hot_reload.queue_size"
        ));
    }

    #[test]
    fn test_validate_rejects_scalar_module_config() {
        let config = HostConfig::builder().module_config("auth", json!(42)).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_merge() {
        let mut base = HostConfig::builder()
            .module_config("a", json!({"x": 1}))
            .build();
        let overlay = HostConfig::builder()
            .log_level("debug")
            .grace_period_ms(50)
            .module_config("b", json!({"y": 2}))
            .build();

        base.merge(overlay);

        assert_eq!(base.logging.level, "debug");
        assert_eq!(base.hot_reload.grace_period_ms, 50);
        assert!(base.modules.contains_key("a"));
        assert!(base.modules.contains_key("b"));
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = HostConfig::builder()
            .operation_timeout_ms(1234)
            .subscriber_queue_capacity(8)
            .build();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = HostConfig::from_str_with_ext(&yaml, false).unwrap();
        assert_eq!(parsed.lifecycle.operation_timeout_ms, 1234);
        assert_eq!(parsed.events.subscriber_queue_capacity, 8);
    }
}
