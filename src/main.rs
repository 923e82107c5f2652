//! Chips Plugin 命令行入口
//!
//! 插件宿主的运维工具，用于离线检查配置与模块清单。
//!
//! # 命令概览
//!
//! - `version` - 显示版本信息
//! - `check-config` - 验证宿主配置文件
//! - `check-manifest` - 验证模块清单
//! - `resolve` - 解析目录下全部清单的加载顺序
//!
//! # 使用示例
//!
//! ```bash
//! # 检查配置文件
//! chips-plugin check-config -c host.yaml
//!
//! # 检查清单
//! chips-plugin check-manifest modules/auth.yaml modules/cache.json
//!
//! # 输出加载顺序与依赖邻接表
//! chips-plugin resolve ./modules
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::debug;

use chips_plugin_core::{
    fields, CoreError, DependencyResolver, HostConfig, Logger, LoggerConfig, ManifestParser,
};

/// Chips Plugin - 插件编排内核工具
#[derive(Parser)]
#[command(name = "chips-plugin")]
#[command(version, about = "插件编排内核的运维工具", long_about = None)]
#[command(author = "Chips Team")]
#[command(propagate_version = true)]
struct Cli {
    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// 子命令
    #[command(subcommand)]
    command: Commands,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 查看版本信息
    Version,

    /// 验证配置文件
    ///
    /// 检查配置文件是否有效，并显示解析后的配置内容。
    CheckConfig {
        /// 配置文件路径
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,
    },

    /// 验证模块清单
    ///
    /// 解析每个清单文件并列出全部问题。
    CheckManifest {
        /// 清单文件（.yaml/.yml/.json）
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// 解析依赖
    ///
    /// 读取目录下全部清单，以 JSON 输出加载顺序和依赖邻接表，
    /// 失败时输出结构化错误。
    Resolve {
        /// 清单目录
        dir: PathBuf,
    },
}

/// 错误的结构化输出
fn error_json(e: &CoreError) -> serde_json::Value {
    let mut detail = serde_json::Map::new();
    detail.insert(fields::ERROR_CODE.to_string(), json!(e.error_code()));
    detail.insert(fields::ERROR_KIND.to_string(), json!(format!("{:?}", e.kind())));
    detail.insert(fields::STATUS.to_string(), json!(e.status_code()));
    detail.insert(fields::MESSAGE.to_string(), json!(e.to_string()));
    json!({ "error": detail })
}

/// 打印版本信息
fn print_version() {
    println!();
    println!("Chips Plugin Core - 插件编排内核");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", chips_plugin_core::VERSION);
    println!();
    println!("构建信息:");
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

/// 检查配置文件
async fn check_config(path: &Path) -> bool {
    println!("检查配置文件: {}", path.display());
    println!();

    let config = match HostConfig::from_file(path).await {
        Ok(config) => config,
        Err(e) => {
            println!("❌ 配置文件无效: {}", e);
            return false;
        }
    };

    println!("✅ 配置文件有效！");
    println!();
    println!("配置内容:");
    println!("────────────────────────────────────────");
    println!("  [生命周期]");
    println!("    操作超时:       {} ms", config.lifecycle.operation_timeout_ms);
    println!();
    println!("  [热重载]");
    println!("    启用:           {}", if config.hot_reload.enabled { "是" } else { "否" });
    println!("    缓冲容量:       {}", config.hot_reload.queue_size);
    println!("    等待超时:       {} ms", config.hot_reload.queue_timeout_ms);
    println!("    宽限窗口:       {} ms", config.hot_reload.grace_period_ms);
    println!();
    println!("  [事件]");
    println!("    处理超时:       {} ms", config.events.handler_timeout_ms);
    println!("    订阅队列容量:   {}", config.events.subscriber_queue_capacity);
    println!();
    println!("  [日志配置]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("    JSON 格式:      {}", if config.logging.json_format { "是" } else { "否" });
    println!();
    let mut modules: Vec<&String> = config.modules.keys().collect();
    modules.sort();
    println!("  [模块配置]");
    println!("    {:?}", modules);
    println!("────────────────────────────────────────");
    true
}

/// 检查清单文件
async fn check_manifests(files: &[PathBuf]) -> bool {
    let mut all_ok = true;
    for file in files {
        match ManifestParser::parse_file(file).await {
            Ok(desc) => {
                println!(
                    "✅ {} - {} v{} ({} 个依赖, {} 个权限)",
                    file.display(),
                    desc.name,
                    desc.version,
                    desc.dependencies.len(),
                    desc.permissions.len()
                );
            }
            Err(e) => {
                all_ok = false;
                println!("❌ {} - [{}] {}", file.display(), e.error_code(), e);
            }
        }
    }
    all_ok
}

/// 解析目录下的全部清单
async fn resolve_dir(dir: &Path) -> bool {
    let outcome = async {
        let descriptors = ManifestParser::parse_dir(dir).await?;
        debug!(count = descriptors.len(), "已读取清单");
        DependencyResolver::resolve(&descriptors)
    }
    .await;

    let (output, ok) = match outcome {
        Ok(plan) => (
            json!({
                "order": plan.order,
                "graph": plan.graph.adjacency(),
                "omitted_optional": plan.omitted_optional,
            }),
            true,
        ),
        Err(e) => (error_json(&e), false),
    };

    match serde_json::to_string_pretty(&output) {
        Ok(text) => println!("{}", text),
        Err(e) => {
            eprintln!("输出序列化失败: {}", e);
            return false;
        }
    }
    ok
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // 版本命令不需要日志，resolve 的标准输出只留 JSON
    let _guard = if matches!(cli.command, Commands::Version) {
        None
    } else {
        Some(Logger::try_init(
            LoggerConfig::builder()
                .level(cli.log_level.as_str())
                .console_output(!matches!(cli.command, Commands::Resolve { .. }))
                .build(),
        ))
    };

    let ok = match cli.command {
        Commands::Version => {
            print_version();
            true
        }
        Commands::CheckConfig { config } => check_config(&config).await,
        Commands::CheckManifest { files } => check_manifests(&files).await,
        Commands::Resolve { dir } => resolve_dir(&dir).await,
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
