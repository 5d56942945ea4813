//! End-to-end behavior through a wired `Core`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use weft_core::config::{BusConfig, RegistryConfig, TaskStoreConfig};
use weft_core::ports::FixedClock;
use weft_core::{AgentDescriptor, Core, CoreBuilder, CoreConfig, Priority, TaskStatus};

fn core(config: CoreConfig) -> Core {
    CoreBuilder::new(config).build().expect("valid config")
}

#[tokio::test]
async fn higher_priority_task_is_assigned_first() {
    let core = core(CoreConfig::default());
    let normal = core.store().create_task("t", json!(1), None).await;
    let critical = core
        .store()
        .create_task("t", json!(2), Some(Priority::Critical))
        .await;
    let agent = core.registry().register(AgentDescriptor::new()).await;

    let made = core.coordinator().tick().await;
    assert_eq!(made[0].task_id, critical.id);
    assert_eq!(made[1].task_id, normal.id);
    assert!(made.iter().all(|a| a.agent_id == agent.id));
}

#[tokio::test]
async fn retry_count_tracks_failures_until_dead_letter() {
    let mut config = CoreConfig::default();
    config.tasks.max_retries = 2;
    let core = core(config);
    let agent = core.registry().register(AgentDescriptor::new()).await;
    let task = core.store().create_task("flaky", json!({}), None).await;

    let mut counts = Vec::new();
    for _ in 0..2 {
        core.coordinator().tick().await;
        let after = core.store().fail(task.id, "boom").await.unwrap();
        counts.push((after.retry_count, after.status));
    }
    assert_eq!(
        counts,
        vec![(1, TaskStatus::Pending), (2, TaskStatus::Failed)]
    );

    // failed タスクは二度と割り当てられない
    assert!(core.coordinator().tick().await.is_empty());
    assert!(core.store().assign(task.id, agent.id).await.is_err());
    assert_eq!(core.store().list_dead_letters().await.len(), 1);
}

#[tokio::test]
async fn dead_letters_expire_and_are_capped() {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
    let config = CoreConfig {
        tasks: TaskStoreConfig {
            max_retries: 0,
            max_dead_letters: 3,
            dead_letter_ttl: Duration::from_secs(600),
            ..TaskStoreConfig::default()
        },
        ..CoreConfig::default()
    };
    let core = CoreBuilder::new(config)
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap();
    let agent = core.registry().register(AgentDescriptor::new()).await;

    for i in 0..5 {
        let task = core.store().create_task("t", json!(i), None).await;
        core.store().assign(task.id, agent.id).await.unwrap();
        core.store().fail(task.id, "fatal").await.unwrap();
        clock.advance(Duration::from_secs(100));
    }
    // 最初の 1 件は failed_at + 600s を過ぎている
    clock.advance(Duration::from_secs(150));
    assert_eq!(core.store().list_dead_letters().await.len(), 4);

    let report = core.store().run_maintenance().await;
    assert_eq!(report.expired_dead_letters, 1);
    assert_eq!(report.trimmed_dead_letters, 1);
    assert_eq!(core.store().stats().await.dead_letters, 3);
}

#[tokio::test(start_paused = true)]
async fn silent_agent_drops_out_until_heartbeat() {
    let config = CoreConfig {
        agents: RegistryConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            ..RegistryConfig::default()
        },
        ..CoreConfig::default()
    };
    let core = core(config);
    let agent = core.registry().register(AgentDescriptor::new()).await;

    tokio::time::sleep(Duration::from_millis(15_100)).await;
    assert!(core.registry().list_available(&[]).await.is_empty());

    core.registry().heartbeat(agent.id).await.unwrap();
    let available = core.registry().list_available(&[]).await;
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].id, agent.id);
}

#[tokio::test(start_paused = true)]
async fn offline_agent_is_not_selected() {
    let config = CoreConfig {
        agents: RegistryConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(2),
            ..RegistryConfig::default()
        },
        ..CoreConfig::default()
    };
    let core = core(config);
    let silent = core.registry().register(AgentDescriptor::named("silent")).await;
    let alive = core.registry().register(AgentDescriptor::named("alive")).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    core.registry().heartbeat(alive.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    for i in 0..3 {
        core.store().create_task("t", json!(i), None).await;
    }
    let made = core.coordinator().tick().await;
    assert_eq!(made.len(), 3);
    assert!(made.iter().all(|a| a.agent_id == alive.id && a.agent_id != silent.id));
}

#[tokio::test(start_paused = true)]
async fn blocking_dequeue_wakes_on_enqueue() {
    let core = core(CoreConfig::default());
    let bus = core.bus().clone();
    let consumer = tokio::spawn(async move { bus.dequeue("work", Duration::ZERO).await });

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!consumer.is_finished());

    core.bus().enqueue("work", json!({"job": 1}));
    assert_eq!(consumer.await.unwrap(), Some(json!({"job": 1})));
}

#[tokio::test(start_paused = true)]
async fn dequeue_with_timeout_returns_none() {
    let core = core(CoreConfig::default());
    let started = tokio::time::Instant::now();
    assert_eq!(core.bus().dequeue("idle", Duration::from_secs(3)).await, None);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn round_robin_wraps_after_last_agent() {
    let core = core(CoreConfig::default());
    let mut agents = Vec::new();
    for name in ["A", "B", "C"] {
        agents.push(core.registry().register(AgentDescriptor::named(name)).await.id);
    }

    let mut order = Vec::new();
    for i in 0..4 {
        core.store().create_task("t", json!(i), None).await;
        order.extend(core.coordinator().tick().await.into_iter().map(|a| a.agent_id));
    }
    assert_eq!(order, vec![agents[0], agents[1], agents[2], agents[0]]);
}

#[tokio::test(start_paused = true)]
async fn kv_ttl_expires_and_reset_keeps_entry() {
    let core = core(CoreConfig::default());
    let bus = core.bus();

    bus.set("short", json!("v"), Some(Duration::from_secs(1)));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(bus.get("short"), None);

    bus.set("renewed", json!(1), Some(Duration::from_secs(1)));
    tokio::time::sleep(Duration::from_millis(700)).await;
    bus.set("renewed", json!(2), Some(Duration::from_secs(1)));
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(bus.get("renewed"), Some(json!(2)));
}

#[tokio::test]
async fn full_queue_keeps_newest_messages() {
    let config = CoreConfig {
        bus: BusConfig {
            max_queue_size: 2,
            ..BusConfig::default()
        },
        ..CoreConfig::default()
    };
    let core = core(config);
    for m in ["m1", "m2", "m3"] {
        core.bus().enqueue("q", json!(m));
    }
    assert_eq!(core.bus().queue_snapshot("q"), vec![json!("m2"), json!("m3")]);
}

#[tokio::test]
async fn lifecycle_events_are_published_on_the_bus() {
    let core = core(CoreConfig::default());
    let completed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = Arc::clone(&completed);
    core.bus()
        .subscribe("task:completed", move |message| seen.lock().push(message.clone()))
        .unwrap();

    core.registry().register(AgentDescriptor::new()).await;
    let task = core.store().create_task("t", json!({}), None).await;
    core.coordinator().tick().await;
    core.store().complete(task.id, json!("done")).await.unwrap();

    let completed = completed.lock();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["event"], "task_completed");
}
