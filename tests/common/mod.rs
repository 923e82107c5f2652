//! 集成测试共用的测试模块
//!
//! `TestModule` 在每个生命周期阶段往共享日志里写一行 `name@version:phase`，
//! 并可按 [`Fault`] 在指定阶段失败、挂起、panic 或启动后上报故障。

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use serde_json::json;

use chips_plugin_core::module::DependencySpec;
use chips_plugin_core::{
    handler, HookContext, HookType, HostConfig, Module, ModuleArtifact, ModuleContext,
    ModuleDescriptor,
};

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// 注入的故障
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Fault {
    #[default]
    None,
    /// 在该阶段返回错误
    Fail(&'static str),
    /// 在该阶段挂起
    Hang(&'static str),
    /// 在该阶段 panic
    Panic(&'static str),
    /// 启动成功后很快上报故障
    CrashAfterStart,
}

pub struct TestModule {
    name: String,
    version: Version,
    log: Log,
    fault: Fault,
    start_delay: Duration,
}

impl TestModule {
    fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    async fn step(&self, phase: &'static str) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("{}:{}", self.label(), phase));
        match self.fault {
            Fault::Fail(p) if p == phase => anyhow::bail!("{} failed", phase),
            Fault::Hang(p) if p == phase => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            Fault::Panic(p) if p == phase => panic!("{} panicked", phase),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Module for TestModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> Version {
        self.version.clone()
    }

    async fn initialize(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        // 流水线钩子把自己的标签追加到 `visited`
        let label = self.label();
        ctx.register_hook(
            HookType::PreDispatch,
            0,
            Arc::new(move |hook: &mut HookContext| {
                let mut visited = hook.get("visited").cloned().unwrap_or_else(|| json!([]));
                if let Some(list) = visited.as_array_mut() {
                    list.push(json!(label));
                }
                hook.set("visited", visited);
                Ok(())
            }),
        )
        .await?;

        let log = self.log.clone();
        let label = self.label();
        ctx.subscribe(
            "test.*",
            handler(move |event| {
                let log = log.clone();
                let label = label.clone();
                async move {
                    log.lock().unwrap().push(format!("{}:event:{}", label, event.name));
                    Ok(())
                }
            }),
        )
        .await?;

        ctx.export("version", Arc::new(self.version.to_string())).await?;
        self.step("initialize").await
    }

    async fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let boots: u64 = ctx.storage().get_as("boots").await?.unwrap_or(0);
        ctx.storage().set("boots", boots + 1).await?;

        self.step("start").await?;

        if self.fault == Fault::CrashAfterStart {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ctx.report_failure("worker crashed").await;
            });
        }
        Ok(())
    }

    async fn stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        self.step("stop").await
    }

    async fn cleanup(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        self.step("cleanup").await
    }
}

/// 测试制品构建器
pub struct TestArtifact {
    descriptor: ModuleDescriptor,
    log: Log,
    fault: Fault,
    start_delay: Duration,
}

pub fn module(name: &str, version: &str, log: &Log) -> TestArtifact {
    TestArtifact {
        descriptor: ModuleDescriptor::parse(name, version).unwrap(),
        log: log.clone(),
        fault: Fault::None,
        start_delay: Duration::ZERO,
    }
}

impl TestArtifact {
    pub fn requires(mut self, name: &str, constraint: &str) -> Self {
        self.descriptor = self
            .descriptor
            .with_dependency(DependencySpec::required(name, constraint));
        self
    }

    pub fn optional(mut self, name: &str, constraint: &str) -> Self {
        self.descriptor = self
            .descriptor
            .with_dependency(DependencySpec::optional(name, constraint));
        self
    }

    pub fn permission(mut self, capability: &str) -> Self {
        self.descriptor = self.descriptor.with_permission(capability);
        self
    }

    pub fn fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    pub fn start_delay_ms(mut self, ms: u64) -> Self {
        self.start_delay = Duration::from_millis(ms);
        self
    }

    pub fn build(self) -> ModuleArtifact {
        let name = self.descriptor.name.clone();
        let version = self.descriptor.version.clone();
        let log = self.log;
        let fault = self.fault;
        let start_delay = self.start_delay;
        ModuleArtifact::new(self.descriptor, move || {
            Ok(Arc::new(TestModule {
                name: name.clone(),
                version: version.clone(),
                log: log.clone(),
                fault,
                start_delay,
            }))
        })
    }
}

/// 测试用的短超时配置
pub fn test_config() -> HostConfig {
    HostConfig::builder()
        .operation_timeout_ms(500)
        .reload_queue_size(16)
        .reload_queue_timeout_ms(5_000)
        .grace_period_ms(50)
        .handler_timeout_ms(200)
        .build()
}

/// 轮询直到条件成立
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// 某次分发中被调用的 PreDispatch 钩子标签
pub fn visited(ctx: &HookContext) -> Vec<String> {
    ctx.get("visited")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
