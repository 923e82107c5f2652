//! 核心模块
//!
//! 宿主配置。

pub mod config;

pub use config::{
    EventConfig, HostConfig, HostConfigBuilder, HotReloadConfig, LifecycleConfig, LogConfig,
};
