//! 日志系统
//!
//! 基于 tracing 生态，支持控制台与滚动文件两路输出、JSON 或可读格式、
//! 以及 `RUST_LOG` / 过滤指令。宿主在启动时调用一次 [`Logger::init`]，
//! 并持有返回的 [`LogGuard`] 直到进程退出。
//!
//! 两个固定的日志目标单独约定：
//!
//! - `security`：权限网关拒绝记录
//! - `reload`：热重载回滚记录
//!
//! ```rust,no_run
//! use chips_plugin_core::utils::logger::{Logger, LoggerConfig, RotationStrategy};
//!
//! let config = LoggerConfig::builder()
//!     .level("debug")
//!     .file_output("./logs")
//!     .rotation(RotationStrategy::Hourly)
//!     .build();
//! let _guard = Logger::init(config).unwrap();
//!
//! tracing::info!(module = "auth", "模块已启动");
//! ```

use crate::core::config::LogConfig;
use crate::utils::{CoreError, Result};
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// 默认日志文件前缀
pub const DEFAULT_FILE_PREFIX: &str = "chips-plugin";

/// 权限拒绝日志目标
pub const SECURITY_TARGET: &str = "security";

/// 热重载回滚日志目标
pub const RELOAD_TARGET: &str = "reload";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// 日志轮转策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// 不轮转
    Never,
    /// 每分钟（测试用）
    Minutely,
    /// 每小时
    Hourly,
    /// 每天
    #[default]
    Daily,
}

impl RotationStrategy {
    fn to_rotation(self) -> Rotation {
        match self {
            RotationStrategy::Never => Rotation::NEVER,
            RotationStrategy::Minutely => Rotation::MINUTELY,
            RotationStrategy::Hourly => Rotation::HOURLY,
            RotationStrategy::Daily => Rotation::DAILY,
        }
    }

    /// 解析配置中的字符串，无法识别时回退到每天
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "never" | "none" => RotationStrategy::Never,
            "minutely" | "minute" => RotationStrategy::Minutely,
            "hourly" | "hour" => RotationStrategy::Hourly,
            _ => RotationStrategy::Daily,
        }
    }
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RotationStrategy::Never => "never",
            RotationStrategy::Minutely => "minutely",
            RotationStrategy::Hourly => "hourly",
            RotationStrategy::Daily => "daily",
        };
        f.write_str(s)
    }
}

/// 日志系统配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 默认级别
    pub level: String,
    /// JSON 格式输出
    pub json_format: bool,
    /// 输出到控制台
    pub console_output: bool,
    /// 文件输出目录，None 表示不写文件
    pub file_output: Option<PathBuf>,
    /// 日志文件名前缀
    pub file_prefix: String,
    /// 轮转策略
    pub rotation: RotationStrategy,
    /// 保留的日志文件数
    pub max_files: usize,
    /// 额外的过滤指令，例如 `chips_plugin_core::reload=debug,security=warn`
    pub filter_directives: Option<String>,
    /// 显示文件名和行号
    pub show_file_line: bool,
    /// 控制台 ANSI 颜色
    pub ansi_colors: bool,
    /// 记录 span 关闭事件（带耗时）
    pub span_close_events: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            console_output: true,
            file_output: None,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            rotation: RotationStrategy::Daily,
            max_files: 7,
            filter_directives: None,
            show_file_line: false,
            ansi_colors: true,
            span_close_events: false,
        }
    }
}

impl LoggerConfig {
    /// 创建构建器
    pub fn builder() -> LoggerConfigBuilder {
        LoggerConfigBuilder::default()
    }

    /// 从宿主配置的 `logging` 段创建
    pub fn from_log_config(log_config: &LogConfig) -> Self {
        Self {
            level: log_config.level.clone(),
            json_format: log_config.json_format,
            file_output: if log_config.file_output {
                log_config.log_dir.clone()
            } else {
                None
            },
            rotation: RotationStrategy::parse(&log_config.rotation),
            max_files: log_config.max_files,
            filter_directives: log_config.filter.clone(),
            ..Default::default()
        }
    }
}

/// 日志配置构建器
#[derive(Debug, Default)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.config.level = level.into();
        self
    }

    pub fn json_format(mut self, enable: bool) -> Self {
        self.config.json_format = enable;
        self
    }

    pub fn console_output(mut self, enable: bool) -> Self {
        self.config.console_output = enable;
        self
    }

    pub fn file_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.file_output = Some(dir.into());
        self
    }

    pub fn file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    pub fn rotation(mut self, strategy: RotationStrategy) -> Self {
        self.config.rotation = strategy;
        self
    }

    pub fn max_files(mut self, count: usize) -> Self {
        self.config.max_files = count;
        self
    }

    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    pub fn show_file_line(mut self, enable: bool) -> Self {
        self.config.show_file_line = enable;
        self
    }

    pub fn ansi_colors(mut self, enable: bool) -> Self {
        self.config.ansi_colors = enable;
        self
    }

    pub fn span_close_events(mut self, enable: bool) -> Self {
        self.config.span_close_events = enable;
        self
    }

    pub fn build(self) -> LoggerConfig {
        self.config
    }
}

/// 日志守卫
///
/// 持有非阻塞写入器的 `WorkerGuard`，丢弃时刷新所有挂起的日志。
pub struct LogGuard {
    guards: Vec<WorkerGuard>,
}

impl LogGuard {
    fn empty() -> Self {
        Self { guards: Vec::new() }
    }

    /// 是否持有写入器（重复初始化时为空）
    pub fn is_active(&self) -> bool {
        !self.guards.is_empty()
    }
}

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// 日志系统入口
pub struct Logger;

impl Logger {
    /// 初始化全局订阅者
    ///
    /// # Errors
    ///
    /// 重复初始化或注册订阅者失败时返回 `CoreError::InitFailed`
    pub fn init(config: LoggerConfig) -> Result<LogGuard> {
        if LOGGER_INITIALIZED.get().is_some() {
            return Err(CoreError::InitFailed(
                "日志系统已初始化，不能重复初始化".to_string(),
            ));
        }

        let env_filter = Self::create_env_filter(&config);
        let mut guard = LogGuard::empty();
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if config.console_output {
            let (writer, worker) = tracing_appender::non_blocking(io::stdout());
            guard.guards.push(worker);
            layers.push(Self::build_layer(&config, writer, config.ansi_colors));
        }

        if let Some(ref dir) = config.file_output {
            let appender = RollingFileAppender::builder()
                .rotation(config.rotation.to_rotation())
                .filename_prefix(config.file_prefix.as_str())
                .filename_suffix("log")
                .max_log_files(config.max_files.max(1))
                .build(dir)
                .map_err(|e| CoreError::InitFailed(format!("无法创建日志文件: {}", e)))?;
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard.guards.push(worker);
            layers.push(Self::build_layer(&config, writer, false));
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(env_filter)
            .try_init()
            .map_err(|e| CoreError::InitFailed(format!("日志系统初始化失败: {}", e)))?;

        let _ = LOGGER_INITIALIZED.set(());
        Ok(guard)
    }

    /// 初始化，已初始化时返回空守卫
    pub fn try_init(config: LoggerConfig) -> LogGuard {
        Self::init(config).unwrap_or_else(|_| LogGuard::empty())
    }

    fn build_layer(
        config: &LoggerConfig,
        writer: tracing_appender::non_blocking::NonBlocking,
        ansi: bool,
    ) -> BoxedLayer {
        let span_events = if config.span_close_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_file(config.show_file_line)
            .with_line_number(config.show_file_line)
            .with_span_events(span_events);

        if config.json_format {
            layer.json().with_ansi(false).boxed()
        } else {
            layer.with_ansi(ansi).boxed()
        }
    }

    /// `RUST_LOG` 优先，其次配置级别，再叠加过滤指令，无法解析的指令被忽略
    fn create_env_filter(config: &LoggerConfig) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

        match config.filter_directives {
            Some(ref directives) => directives
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .filter_map(|d| d.parse().ok())
                .fold(filter, |f, directive| f.add_directive(directive)),
            None => filter,
        }
    }
}

/// 标准字段名
///
/// 生命周期事件载荷和 CLI 的结构化输出使用这些键，与日志里的同名字段一致，
/// 便于按同一个键检索日志与事件。
pub mod fields {
    /// 模块名
    pub const MODULE: &str = "module";
    /// 模块列表
    pub const MODULES: &str = "modules";
    /// 版本
    pub const VERSION: &str = "version";
    /// 实例代次
    pub const GENERATION: &str = "generation";
    /// 错误码
    pub const ERROR_CODE: &str = "error_code";
    /// 错误分类
    pub const ERROR_KIND: &str = "error_kind";
    /// 状态码
    pub const STATUS: &str = "status";
    /// 错误消息
    pub const MESSAGE: &str = "message";
}
