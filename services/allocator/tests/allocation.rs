//! End-to-end allocation against the in-memory farm.

use std::sync::Arc;
use std::time::Duration;

use devlease_allocator::{
    cancellation, AllocError, AllocationRequest, AllocatorConfig, Cancellation, DeviceFilter,
    Orchestrator, Phase, ProxyError, TeardownOutcome, Workspace,
};
use devlease_farm_api::{DeviceRunStatus, ProxyKind};
use devlease_testing::{FakeFarm, FlashPlan, ProxyPlan, SessionPlan};

const BUILD_URL: &str = "http://img/a.zip";
const IDENTITY: &str = "5_http://img/a.zip";

fn request() -> AllocationRequest {
    AllocationRequest::new(BUILD_URL, "5")
}

fn orchestrator(farm: &Arc<FakeFarm>, max_retries: u32) -> Orchestrator {
    let config = AllocatorConfig {
        max_retries,
        ..AllocatorConfig::default()
    };
    Orchestrator::new(
        farm.clone(),
        Arc::new(farm.connector()),
        config,
        "cloud.example.com",
    )
}

/// A pool with one flashable device and the flash project.
fn farm_with_flame() -> (Arc<FakeFarm>, i64) {
    let farm = FakeFarm::new();
    farm.add_project("flash-fxos");
    let device = farm.add_device("flame-1", true, false);
    farm.tag(device, "Device Type", "flame");
    (farm, device)
}

#[tokio::test(start_paused = true)]
async fn test_device_with_build_is_leased_without_flashing() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    let orchestrator = orchestrator(&farm, 3);

    let mut lease = orchestrator
        .allocate(&request(), &Cancellation::never())
        .await
        .unwrap();

    let descriptor = &lease.descriptor;
    assert_eq!(descriptor.device_id, device);
    assert_eq!(descriptor.adb_port, 15037);
    assert_eq!(descriptor.marionette_port, 2828);
    assert_eq!(descriptor.adb_host, "cloud.example.com");
    assert_eq!(descriptor.marionette_host, "cloud.example.com");
    assert_eq!(descriptor.android_serial, format!("serial-{}", device));
    assert_eq!(farm.device_queries(), 1);
    assert!(farm.started_runs().is_empty());

    assert_eq!(lease.teardown.release().await, TeardownOutcome::Released);
    assert!(!farm.device(device).unwrap().locked);
}

#[tokio::test(start_paused = true)]
async fn test_missing_build_is_flashed_then_leased() {
    let (farm, device) = farm_with_flame();
    farm.on_flash_tag("Build Identifier", IDENTITY);
    farm.set_flash_plan(FlashPlan::Finishes {
        polls: 3,
        status: DeviceRunStatus::Passed,
    });
    let orchestrator = orchestrator(&farm, 3);

    let request = request().with_filter(DeviceFilter::new("Device Type", "flame"));
    let mut lease = orchestrator
        .allocate(&request, &Cancellation::never())
        .await
        .unwrap();

    assert_eq!(lease.descriptor.device_id, device);
    let started = farm.started_runs();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].1, vec![device]);

    let mut params = farm.run_params(started[0].0);
    params.sort();
    assert_eq!(
        params,
        vec![
            ("FLAME_ZIP_URL".to_string(), BUILD_URL.to_string()),
            ("MEM_TOTAL".to_string(), "5".to_string()),
        ]
    );
    assert_eq!(farm.sessions_created().len(), 1);

    lease.teardown.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_padded_build_url_flashes_what_it_searches_for() {
    let (farm, device) = farm_with_flame();
    farm.on_flash_tag("Build Identifier", IDENTITY);
    let orchestrator = orchestrator(&farm, 1);

    let request = AllocationRequest::new(format!("  {}\n", BUILD_URL), " 5 ");
    let mut lease = orchestrator
        .allocate(&request, &Cancellation::never())
        .await
        .unwrap();

    assert_eq!(lease.descriptor.device_id, device);
    let started = farm.started_runs();
    assert_eq!(started.len(), 1);
    let params = farm.run_params(started[0].0);
    assert!(params.contains(&("FLAME_ZIP_URL".to_string(), BUILD_URL.to_string())));
    lease.teardown.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_contention_exhausts_budget_with_session_null() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    for _ in 0..3 {
        farm.push_session_plan(SessionPlan::Conflict);
    }
    let orchestrator = orchestrator(&farm, 2);

    let err = orchestrator
        .allocate(&request(), &Cancellation::never())
        .await
        .unwrap_err();

    assert!(matches!(err, AllocError::SessionUnavailable { attempts: 3 }));
    assert!(err.to_string().contains("session is null"));
    assert_eq!(farm.device_queries(), 3);
    assert!(farm.sessions_created().is_empty());
    assert!(farm.started_runs().is_empty());
    assert_eq!(orchestrator.phase(), Phase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_flashing_that_never_tags_fails_after_budget() {
    let (farm, _) = farm_with_flame();
    let orchestrator = orchestrator(&farm, 2);

    let err = orchestrator
        .allocate(&request(), &Cancellation::never())
        .await
        .unwrap_err();

    assert!(matches!(err, AllocError::FlashingFailed { attempts: 3 }));
    // The final attempt does not flash.
    assert_eq!(farm.started_runs().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stolen_device_is_retried_under_same_budget() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    farm.push_session_plan(SessionPlan::Conflict);
    farm.push_session_plan(SessionPlan::Running { waiting_polls: 2 });
    let orchestrator = orchestrator(&farm, 1);

    let mut lease = orchestrator
        .allocate(&request(), &Cancellation::never())
        .await
        .unwrap();

    assert_eq!(farm.device_queries(), 2);
    assert_eq!(farm.sessions_created(), vec![lease.descriptor.session_id]);
    lease.teardown.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_proxy_timeout_releases_session_once() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    farm.set_proxy_plan(ProxyKind::Marionette, ProxyPlan::Never);
    let orchestrator = orchestrator(&farm, 3);

    let err = orchestrator
        .allocate(&request(), &Cancellation::never())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AllocError::ProxyDiscovery(ProxyError::Timeout {
            kind: ProxyKind::Marionette,
            ..
        })
    ));
    let created = farm.sessions_created();
    assert_eq!(created.len(), 1);
    assert_eq!(farm.release_attempts(), created);
    assert!(!farm.device(device).unwrap().locked);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_proxy_discovery_releases_session_once() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    farm.set_proxy_plan(ProxyKind::Adb, ProxyPlan::Never);
    let orchestrator = Arc::new(orchestrator(&farm, 3));
    let (handle, cancel) = cancellation();

    let task = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move { orchestrator.allocate(&request(), &cancel).await }
    });
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(orchestrator.phase(), Phase::ResolvingProxies);
    handle.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    let created = farm.sessions_created();
    assert_eq!(created.len(), 1);
    assert_eq!(farm.release_attempts(), created);
    assert_eq!(orchestrator.phase(), Phase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_last_proxy_query_is_not_lost() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    let (handle, cancel) = cancellation();
    farm.on_proxy_query(ProxyKind::Marionette, move || handle.cancel());
    let orchestrator = orchestrator(&farm, 3);

    let err = orchestrator.allocate(&request(), &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    let created = farm.sessions_created();
    assert_eq!(created.len(), 1);
    assert_eq!(farm.released(), created);
    assert!(!farm.device(device).unwrap().locked);
    assert_eq!(orchestrator.phase(), Phase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_reconnects_once_and_is_idempotent() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    let orchestrator = orchestrator(&farm, 3);

    let mut lease = orchestrator
        .allocate(&request(), &Cancellation::never())
        .await
        .unwrap();
    let session_id = lease.descriptor.session_id;
    farm.fail_releases(1);

    assert_eq!(lease.teardown.release().await, TeardownOutcome::Released);
    assert_eq!(lease.teardown.release().await, TeardownOutcome::Skipped);

    assert_eq!(farm.release_attempts(), vec![session_id, session_id]);
    assert_eq!(farm.released(), vec![session_id]);
    assert_eq!(farm.connects(), 1);
    assert_eq!(orchestrator.phase(), Phase::Released);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_never_fails_the_build() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    let orchestrator = orchestrator(&farm, 3);

    let mut lease = orchestrator
        .allocate(&request(), &Cancellation::never())
        .await
        .unwrap();
    farm.fail_releases(2);

    assert_eq!(lease.teardown.release().await, TeardownOutcome::ReleaseFailed);
    assert_eq!(lease.teardown.release().await, TeardownOutcome::Skipped);
    assert_eq!(farm.release_attempts().len(), 2);
    assert_eq!(orchestrator.phase(), Phase::Released);
}

#[tokio::test(start_paused = true)]
async fn test_device_data_written_to_workspace() {
    let (farm, device) = farm_with_flame();
    farm.tag(device, "Build Identifier", IDENTITY);
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(&farm, 3).with_workspace(Workspace::new(dir.path()));

    let mut lease = orchestrator
        .allocate(&request(), &Cancellation::never())
        .await
        .unwrap();

    assert_eq!(lease.descriptor.device_data.as_deref(), Some("device.json"));
    let content = std::fs::read_to_string(dir.path().join("device.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(value["device_type"], "flame");
    assert_eq!(value["build_identifier"], IDENTITY);

    let vars = devlease_allocator::env_map(&lease.descriptor);
    assert_eq!(vars["DEVICE_DATA"], "device.json");
    lease.teardown.release().await;
}
