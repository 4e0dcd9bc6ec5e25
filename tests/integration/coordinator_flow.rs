//! Platform-source state machine driven end to end over fakes.

use crate::helpers::{eventually, harness, harness_with, package_manager_config, settle};
use auto_update::arbiter::{UpdateSource, UpdateStatus};
use auto_update::config::{ConfigValue, OsUpdateHandler, UpdateConfig};
use auto_update::coordinator::{CyclePhase, TriggerOutcome};
use auto_update::package_manager::UpdateResult;
use auto_update::readiness::Readiness;
use serde_json::json;
use std::time::Duration;

const PLATFORM: UpdateSource = UpdateSource::Platform;

fn available_os() -> serde_json::Value {
    json!({
        "state": "AVAILABLE",
        "supportsOsUpdates": true,
        "updateCheckResults": [{"available": true, "type": "OS"}]
    })
}

fn system_restart_pending() -> serde_json::Value {
    json!({
        "state": "SYSTEM_RESTART_PENDING",
        "supportsOsUpdates": true,
        "updateApplyResults": [{"requiresSystemRestart": true}]
    })
}

#[tokio::test]
async fn available_os_update_is_applied_with_os_selector() {
    let h = harness();
    assert_eq!(h.coordinator.trigger(PLATFORM).await, TriggerOutcome::Started);
    assert_eq!(h.service.start_checks(), 1);
    assert_eq!(
        h.arbiter.status(PLATFORM).await,
        UpdateStatus::InProgress
    );

    h.service.emit(json!({"state": "CHECKING"}));
    h.service.emit(available_os());

    assert!(eventually(|| async { h.service.selectors() == vec!["CAI=".to_owned()] }).await);
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Applying);
}

#[tokio::test]
async fn os_items_win_over_client_items() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(json!({
        "state": "AVAILABLE",
        "supportsOsUpdates": true,
        "updateCheckResults": [
            {"available": true, "type": "CLIENT"},
            {"available": true, "type": "OS"},
            {"available": true, "type": "BIOS"}
        ]
    }));
    assert!(eventually(|| async { h.service.selectors() == vec!["CAIIAw==".to_owned()] }).await);
}

#[tokio::test]
async fn low_battery_blocks_check() {
    let h = harness();
    h.power.set(15, false);

    let outcome = h.coordinator.trigger(PLATFORM).await;
    assert_eq!(
        outcome,
        TriggerOutcome::NotReady(Readiness::BatteryLow {
            level: 15,
            minimum: 20
        })
    );
    assert_eq!(h.service.start_checks(), 0);
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Idle);
}

#[tokio::test]
async fn foreground_session_blocks_check() {
    let h = harness();
    h.session.set_active(true);
    assert_eq!(
        h.coordinator.trigger(PLATFORM).await,
        TriggerOutcome::NotReady(Readiness::ForegroundSession)
    );
    assert_eq!(h.service.start_checks(), 0);
}

#[tokio::test]
async fn second_trigger_is_coalesced() {
    let h = harness();
    assert_eq!(h.coordinator.trigger(PLATFORM).await, TriggerOutcome::Started);
    assert_eq!(
        h.coordinator.trigger(PLATFORM).await,
        TriggerOutcome::AlreadyRunning
    );
    assert_eq!(h.service.start_checks(), 1);
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Checking);
    assert_eq!(h.service.subscribers(), 1);
}

#[tokio::test]
async fn system_restart_pending_restarts_os_once() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(system_restart_pending());

    assert!(eventually(|| async { h.restarts.system() == 1 }).await);
    settle().await;
    assert_eq!(h.restarts.system(), 1);
    assert_eq!(h.restarts.application(), 0);
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Idle);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);
}

#[tokio::test]
async fn client_restart_pending_restarts_client() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(json!({
        "state": "CLIENT_RESTART_PENDING",
        "updateApplyResults": [{"requiresClientRestart": true}]
    }));
    assert!(eventually(|| async { h.restarts.application() == 1 }).await);
    assert_eq!(h.restarts.system(), 0);
}

#[tokio::test]
async fn pending_restart_waits_for_readiness() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.session.set_active(true);
    h.service.emit(system_restart_pending());

    assert!(
        eventually(|| async {
            h.arbiter.status(PLATFORM).await == UpdateStatus::OsRestartRequired
        })
        .await
    );
    assert_eq!(h.restarts.system(), 0);
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Idle);

    h.session.set_active(false);
    assert!(h.coordinator.reevaluate().await.performed());
    assert_eq!(h.restarts.system(), 1);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);
}

#[tokio::test]
async fn restart_flags_mismatch_resets() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(json!({
        "state": "SYSTEM_RESTART_PENDING",
        "supportsOsUpdates": false,
        "updateApplyResults": [{"requiresSystemRestart": true}]
    }));
    assert!(eventually(|| async { h.coordinator.phase(PLATFORM).await == CyclePhase::Idle }).await);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);
    assert_eq!(h.restarts.system(), 0);
}

#[tokio::test]
async fn up_to_date_closes_cycle_and_unsubscribes() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(json!({"state": "UP_TO_DATE"}));

    assert!(eventually(|| async { h.coordinator.phase(PLATFORM).await == CyclePhase::Idle }).await);
    assert!(eventually(|| async { h.service.subscribers() == 0 }).await);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);

    assert_eq!(h.coordinator.trigger(PLATFORM).await, TriggerOutcome::Started);
    assert_eq!(h.service.start_checks(), 2);
}

#[tokio::test]
async fn malformed_event_tears_down() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(json!("garbage"));

    assert!(eventually(|| async { h.coordinator.phase(PLATFORM).await == CyclePhase::Idle }).await);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);
    assert!(h.service.selectors().is_empty());
}

#[tokio::test]
async fn rejected_check_resets_status() {
    let h = harness();
    h.service.fail_start(true);

    assert_eq!(
        h.coordinator.trigger(PLATFORM).await,
        TriggerOutcome::CheckFailed
    );
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Idle);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);

    h.service.fail_start(false);
    assert_eq!(h.coordinator.trigger(PLATFORM).await, TriggerOutcome::Started);
}

#[tokio::test]
async fn rejected_apply_resets_status() {
    let h = harness();
    h.service.fail_apply(true);
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(available_os());

    assert!(eventually(|| async { h.coordinator.phase(PLATFORM).await == CyclePhase::Idle }).await);
    assert_eq!(h.service.selectors().len(), 1);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);
}

#[tokio::test]
async fn readiness_lost_before_apply_abandons_cycle() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.power.set(5, false);
    h.service.emit(available_os());

    assert!(eventually(|| async { h.coordinator.phase(PLATFORM).await == CyclePhase::Idle }).await);
    assert!(h.service.selectors().is_empty());
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);
}

#[tokio::test]
async fn stalled_cycle_is_torn_down_once_by_watchdog() {
    let h = harness_with(UpdateConfig {
        watchdog_timeout_secs: 1,
        ..UpdateConfig::default()
    });
    h.coordinator.trigger(PLATFORM).await;
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Checking);

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Idle);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);
    assert!(eventually(|| async { h.service.subscribers() == 0 }).await);

    // A fresh cycle is not closed by anything left over from the first one.
    assert_eq!(h.coordinator.trigger(PLATFORM).await, TriggerOutcome::Started);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Checking);
}

#[tokio::test]
async fn progress_events_keep_cycle_open() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(json!({"state": "CHECKING"}));
    h.service.emit(json!({"state": 5}));
    settle().await;
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Checking);
    assert_eq!(h.service.subscribers(), 1);
}

#[tokio::test]
async fn package_manager_update_requests_os_restart() {
    let h = harness_with(package_manager_config());
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(available_os());

    assert!(eventually(|| async { h.restarts.system() == 1 }).await);
    assert_eq!(h.package_manager.runs(), 1);
    assert!(h.service.selectors().is_empty());
    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Idle);
}

#[tokio::test]
async fn package_manager_without_changes_is_no_update() {
    let h = harness_with(package_manager_config());
    h.package_manager.set_result(UpdateResult::NotUpdated);
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(available_os());

    assert!(eventually(|| async { h.coordinator.phase(PLATFORM).await == CyclePhase::Idle }).await);
    assert_eq!(h.arbiter.status(PLATFORM).await, UpdateStatus::UpToDate);
    assert_eq!(h.restarts.system(), 0);
}

#[tokio::test]
async fn package_manager_ignores_client_updates() {
    let h = harness_with(package_manager_config());
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(json!({
        "state": "AVAILABLE",
        "updateCheckResults": [{"available": true, "type": "CLIENT"}]
    }));

    assert!(eventually(|| async { h.service.selectors() == vec!["CAE=".to_owned()] }).await);
    assert_eq!(h.package_manager.runs(), 0);
}

#[tokio::test]
async fn handler_switch_takes_effect_on_next_apply() {
    let h = harness();
    h.config
        .set(ConfigValue::OsUpdateHandler(OsUpdateHandler::PackageManager))
        .unwrap();
    h.coordinator.trigger(PLATFORM).await;
    h.service.emit(available_os());
    assert!(eventually(|| async { h.package_manager.runs() == 1 }).await);
}

#[tokio::test]
async fn shutdown_closes_cycles_and_refuses_triggers() {
    let h = harness();
    h.coordinator.trigger(PLATFORM).await;
    h.coordinator.shutdown().await;

    assert_eq!(h.coordinator.phase(PLATFORM).await, CyclePhase::Idle);
    assert!(eventually(|| async { h.service.subscribers() == 0 }).await);
    assert_eq!(h.coordinator.trigger(PLATFORM).await, TriggerOutcome::ShutDown);
}
