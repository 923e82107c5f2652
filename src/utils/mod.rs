//! 工具模块
//!
//! 错误类型、ID 生成、日志系统与耗时统计。

pub mod error;
pub mod id;
pub mod logger;
pub mod metrics;

pub use error::{error_code, status_code, CoreError, ErrorKind, Result};
pub use id::{generate_id, generate_uuid, prefixed_id};
pub use logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
pub use metrics::{LatencyRecorder, LatencySnapshot};
