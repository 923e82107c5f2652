//! # 钩子与事件集成测试
//!
//! - 钩子按优先级分发，失败与 panic 互不影响
//! - 进程启动、关闭钩子各分发一次
//! - 模块之间通过事件总线与服务目录通信
//! - 已卸载实例的上下文不能再注册

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use chips_plugin_core::{
    fields, handler, CoreError, Event, HookContext, HookResult, HookType, PluginHost,
};
use common::{entries, module, new_log, test_config, visited, wait_until};

fn host() -> PluginHost {
    PluginHost::new(test_config()).unwrap()
}

#[tokio::test]
async fn test_hooks_run_by_priority_and_isolate_failures() {
    let host = host();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (owner, priority) in [("low", 1), ("high", 10), ("mid", 5)] {
        let order = order.clone();
        host.hooks()
            .register(
                HookType::PostDispatch,
                priority,
                owner,
                Arc::new(move |_: &mut HookContext| {
                    order.lock().unwrap().push(owner);
                    Ok(())
                }),
            )
            .await;
    }
    host.hooks()
        .register(
            HookType::PostDispatch,
            7,
            "broken",
            Arc::new(|_: &mut HookContext| -> anyhow::Result<()> { anyhow::bail!("boom") }),
        )
        .await;
    host.hooks()
        .register(
            HookType::PostDispatch,
            3,
            "panicky",
            Arc::new(|_: &mut HookContext| -> anyhow::Result<()> { panic!("hook panic") }),
        )
        .await;

    let mut ctx = HookContext::new(HookType::PostDispatch);
    let outcomes = host.dispatch(HookType::PostDispatch, &mut ctx).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    let owners: Vec<&str> = outcomes.iter().map(|o| o.owner.as_str()).collect();
    assert_eq!(owners, vec!["high", "broken", "mid", "panicky", "low"]);
    assert!(matches!(outcomes[1].result, HookResult::Failed(_)));
    assert!(matches!(outcomes[3].result, HookResult::Panicked(ref m) if m.contains("hook panic")));

    let broken = host.health().counters("broken").await;
    assert_eq!(broken.error_count, 1);
    assert_eq!(broken.hooks["post_dispatch"].failures, 1);
}

#[tokio::test]
async fn test_pipeline_hook_can_skip_the_rest() {
    let host = host();
    let calls = Arc::new(AtomicUsize::new(0));

    host.hooks()
        .register(
            HookType::PreDispatch,
            10,
            "gate",
            Arc::new(|ctx: &mut HookContext| {
                ctx.set("blocked", json!(true));
                ctx.skip_remaining();
                Ok(())
            }),
        )
        .await;
    {
        let calls = calls.clone();
        host.hooks()
            .register(
                HookType::PreDispatch,
                0,
                "audit",
                Arc::new(move |_: &mut HookContext| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;
    }

    let mut ctx = HookContext::new(HookType::PreDispatch);
    let outcomes = host.dispatch(HookType::PreDispatch, &mut ctx).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(ctx.get("blocked"), Some(&json!(true)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_process_hooks_fire_once() {
    let log = new_log();
    let host = host();
    let starts = Arc::new(AtomicUsize::new(0));
    let shutdowns = Arc::new(AtomicUsize::new(0));

    {
        let starts = starts.clone();
        host.hooks()
            .register(
                HookType::ProcessStart,
                0,
                "ops",
                Arc::new(move |ctx: &mut HookContext| {
                    assert!(ctx.get("modules").is_some());
                    starts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;
        let shutdowns = shutdowns.clone();
        host.hooks()
            .register(
                HookType::ProcessShutdown,
                0,
                "ops",
                Arc::new(move |_: &mut HookContext| {
                    shutdowns.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;
    }

    host.load_all(vec![
        module("a", "1.0.0", &log).build(),
        module("b", "1.0.0", &log).build(),
    ])
    .await
    .unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    host.shutdown().await.unwrap();
    host.shutdown().await.unwrap();
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_module_hooks_see_dispatch_target() {
    let log = new_log();
    let host = host();
    host.load_all(vec![
        module("auth", "1.0.0", &log).build(),
        module("audit", "2.0.0", &log).build(),
    ])
    .await
    .unwrap();

    let mut ctx = HookContext::new(HookType::PreDispatch).with_target("auth");
    host.dispatch(HookType::PreDispatch, &mut ctx).await.unwrap();

    let mut seen = visited(&ctx);
    seen.sort();
    assert_eq!(seen, vec!["audit@2.0.0".to_string(), "auth@1.0.0".to_string()]);
}

#[tokio::test]
async fn test_events_reach_module_subscribers() {
    let log = new_log();
    let host = host();
    host.load_all(vec![
        module("a", "1.0.0", &log).build(),
        module("b", "1.0.0", &log).build(),
    ])
    .await
    .unwrap();

    let delivered = host.publish_named("test.ping", json!({ "n": 1 })).await;
    assert_eq!(delivered, 2);
    // 不匹配的事件不投递
    assert_eq!(host.publish_named("other.ping", json!({})).await, 0);

    wait_until(|| async {
        let log = entries(&log);
        log.contains(&"a@1.0.0:event:test.ping".to_string())
            && log.contains(&"b@1.0.0:event:test.ping".to_string())
    })
    .await;
    assert!(host.events().has_subscribers("test.anything").await);
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let log = new_log();
    let host = host();
    let names = Arc::new(Mutex::new(Vec::new()));
    {
        let names = names.clone();
        host.events()
            .subscribe(
                "ops",
                "module.*",
                handler(move |event: Event| {
                    let names = names.clone();
                    async move {
                        assert!(event.payload[fields::GENERATION].is_u64());
                        names
                            .lock()
                            .unwrap()
                            .push(format!("{}:{}", event.name, event.payload[fields::MODULE]));
                        Ok(())
                    }
                }),
            )
            .await;
    }

    host.load_module(module("auth", "1.0.0", &log).build()).await.unwrap();
    host.unload_module("auth").await.unwrap();

    wait_until(|| async { names.lock().unwrap().len() == 2 }).await;
    assert_eq!(
        *names.lock().unwrap(),
        vec![
            "module.started:\"auth\"".to_string(),
            "module.stopped:\"auth\"".to_string()
        ]
    );
}

#[tokio::test]
async fn test_failing_subscriber_does_not_affect_others() {
    let host = host();
    let received = Arc::new(AtomicUsize::new(0));

    host.events()
        .subscribe(
            "broken",
            "job.done",
            handler(|_event| async { Err::<(), _>(anyhow::anyhow!("cannot handle")) }),
        )
        .await;
    {
        let received = received.clone();
        host.events()
            .subscribe(
                "worker",
                "job.done",
                handler(move |_event| {
                    let received = received.clone();
                    async move {
                        received.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await;
    }

    for _ in 0..3 {
        host.publish_named("job.done", json!({})).await;
    }

    wait_until(|| async { received.load(Ordering::SeqCst) == 3 && host.bus_stats().failed == 3 }).await;
    assert_eq!(host.health().counters("broken").await.event_failures, 3);
    assert_eq!(host.health().counters("worker").await.error_count, 0);
}

#[tokio::test]
async fn test_services_are_shared_between_modules() {
    let log = new_log();
    let host = host();
    host.load_all(vec![
        module("store", "1.3.0", &log).build(),
        module("api", "1.0.0", &log).requires("store", "^1").build(),
    ])
    .await
    .unwrap();

    let api = host.lifecycle().instance("api").await.unwrap();
    let version = api.context.lookup_as::<String>("store", "version").await.unwrap();
    assert_eq!(version.as_str(), "1.3.0");

    let err = api.context.lookup("store", "missing").await.unwrap_err();
    assert!(matches!(err, CoreError::ServiceNotFound { .. }));

    let err = api.context.lookup_as::<u64>("store", "version").await.unwrap_err();
    assert!(matches!(err, CoreError::ServiceTypeMismatch { .. }));
}

#[tokio::test]
async fn test_stale_context_cannot_register() {
    let log = new_log();
    let host = host();
    host.load_module(module("auth", "1.0.0", &log).build()).await.unwrap();
    let ctx = host.lifecycle().instance("auth").await.unwrap().context;

    host.unload_module("auth").await.unwrap();

    let err = ctx
        .register_hook(HookType::PreDispatch, 0, Arc::new(|_: &mut HookContext| Ok(())))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
    assert!(ctx.subscribe("x.*", handler(|_| async { Ok::<(), anyhow::Error>(()) })).await.is_err());
    assert!(ctx.export("late", Arc::new(1u32)).await.is_err());

    assert_eq!(host.hooks().count_for("auth").await, 0);
    assert_eq!(host.services().count_for("auth").await, 0);

    // 存储句柄已释放
    assert!(ctx.storage().is_released());
    assert!(ctx.storage().get("boots").await.is_err());
}
