//! Cron-driven update checks against a real coordinator.

use crate::helpers::{eventually, harness};
use auto_update::arbiter::UpdateSource;
use auto_update::config::ConfigValue;
use auto_update::coordinator::CyclePhase;
use auto_update::scheduler::Scheduler;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn every_second_schedule_triggers_checks() {
    let h = harness();
    let scheduler = Scheduler::new(Arc::new(h.coordinator.clone()));
    assert!(scheduler.bind("* * * * * *").await);

    assert!(eventually(|| async { h.service.start_checks() >= 1 }).await);
    assert!(eventually(|| async { h.loader.calls() >= 1 }).await);
    scheduler.unbind().await;
}

#[tokio::test]
async fn invalid_expression_leaves_scheduler_unbound() {
    let h = harness();
    let scheduler = Scheduler::new(Arc::new(h.coordinator.clone()));
    assert!(scheduler.bind("0 4 * * *").await);

    assert!(!scheduler.bind("61 * * * *").await);
    assert!(!scheduler.is_bound().await);
    assert_eq!(scheduler.expression().await, None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.service.start_checks(), 0);
}

#[tokio::test]
async fn stopped_schedule_no_longer_fires() {
    let h = harness();
    let scheduler = Scheduler::new(Arc::new(h.coordinator.clone()));
    assert!(scheduler.bind("* * * * * *").await);
    assert!(eventually(|| async { h.service.start_checks() >= 1 }).await);

    assert!(!scheduler.bind("garbage").await);
    let fired = h.service.start_checks();
    // Close the open cycle so a stray trigger would show up as a new check.
    h.service.emit(serde_json::json!({"state": "UP_TO_DATE"}));
    assert!(
        eventually(|| async {
            h.coordinator.phase(UpdateSource::Platform).await == CyclePhase::Idle
        })
        .await
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.service.start_checks(), fired);
}

#[tokio::test]
async fn config_change_rebinds_schedule() {
    let h = harness();
    let scheduler = Arc::new(Scheduler::new(Arc::new(h.coordinator.clone())));
    let watcher = scheduler.watch_config(h.config.clone()).await;
    assert_eq!(scheduler.expression().await.as_deref(), Some("0 4 * * *"));

    h.config
        .set(ConfigValue::Cron("30 2 * * *".to_owned()))
        .unwrap();
    assert!(
        eventually(|| async {
            scheduler.expression().await.as_deref() == Some("30 2 * * *")
        })
        .await
    );

    h.config.set(ConfigValue::Cron(String::new())).unwrap();
    assert!(eventually(|| async { !scheduler.is_bound().await }).await);

    watcher.abort();
}
