//! Re-provisioning ("flashing") a device with a build image.
//!
//! Flashing is a regular run of a dedicated project. The run's parameters
//! carry the build URL and memory total; everything else about the job is
//! owned by the farm.
//!
//! # Invariants
//!
//! - a run's parameters are reset before each attempt, so it carries exactly
//!   the build URL and memory total of the current call
//! - a run still queued when the timeout expires is aborted; a run already
//!   executing is left to finish on its own
//! - cancellation aborts the run before it is reported

use std::sync::Arc;
use std::time::Duration;

use devlease_farm_api::{DeviceRunStatus, FarmApi, Project, RunState, TestRun};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cancel::Cancellation;
use crate::config::AllocatorConfig;
use crate::error::AllocError;
use crate::filter::DeviceFilter;
use crate::locator::DeviceLocator;
use crate::redact::remove_bewit;
use crate::snapshot::Workspace;

/// Result of one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The run finished and the device run did not fail.
    Flashed { run_id: i64, device_id: i64 },
    /// The run was aborted or the device run failed.
    Failed { run_id: i64 },
    /// The run did not finish in time.
    TimedOut { run_id: i64 },
    /// The provisioning project does not exist.
    JobNotFound,
}

/// Runs the flash project against a device matching the filters.
#[derive(Clone)]
pub struct Provisioner {
    api: Arc<dyn FarmApi>,
    locator: DeviceLocator,
    workspace: Option<Workspace>,
    project_name: String,
    build_url_param: String,
    mem_total_param: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl Provisioner {
    pub fn new(api: Arc<dyn FarmApi>, config: &AllocatorConfig) -> Self {
        Self {
            locator: DeviceLocator::new(Arc::clone(&api)),
            api,
            workspace: None,
            project_name: config.flash_project.clone(),
            build_url_param: config.build_url_param.clone(),
            mem_total_param: config.mem_total_param.clone(),
            timeout: config.flash_timeout,
            poll_interval: config.flash_poll_interval,
        }
    }

    /// Persist failed flash logs into `workspace`.
    pub fn with_workspace(mut self, workspace: Workspace) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Flash a device matching `filters` with `build_url`.
    ///
    /// Configuration problems are reported as [`ProvisionOutcome::JobNotFound`]
    /// or [`AllocError::NoMatchingDevice`]; API failures propagate.
    pub async fn provision(
        &self,
        filters: &[DeviceFilter],
        build_url: &str,
        mem_total: u64,
        cancel: &Cancellation,
    ) -> Result<ProvisionOutcome, AllocError> {
        info!(
            build_url = %remove_bewit(build_url),
            mem_total,
            "Flashing device"
        );

        let Some(project) = self.find_project().await? else {
            error!(project = %self.project_name, "Unable to find flash project");
            return Ok(ProvisionOutcome::JobNotFound);
        };

        let run = self.api.create_run(project.id).await?;
        info!(project_id = project.id, run_id = run.id, "Flash run created");

        self.reset_parameters(project.id, run.id, build_url, mem_total)
            .await?;

        let device = self
            .locator
            .locate(filters, true)
            .await?
            .ok_or_else(|| AllocError::NoMatchingDevice {
                filters: describe(filters),
            })?;

        let run = self.api.start_run(run.id, &[device.id]).await?;
        let run_id = run.id;
        info!(run_id, device_id = device.id, "Flash run started");

        let Some(run) = self.wait_for_run(project.id, run, cancel).await? else {
            return Ok(ProvisionOutcome::TimedOut { run_id });
        };
        if run.state == RunState::Aborted {
            warn!(run_id = run.id, "Flash run was aborted");
            return Ok(ProvisionOutcome::Failed { run_id: run.id });
        }

        self.check_device_run(project.id, run.id, device.id).await
    }

    /// Prefer an exact name match among search results.
    async fn find_project(&self) -> Result<Option<Project>, AllocError> {
        let projects = self.api.projects(&self.project_name).await?;
        let exact = projects.iter().position(|p| p.name == self.project_name);
        Ok(match exact {
            Some(i) => projects.into_iter().nth(i),
            None => projects.into_iter().next(),
        })
    }

    async fn reset_parameters(
        &self,
        project_id: i64,
        run_id: i64,
        build_url: &str,
        mem_total: u64,
    ) -> Result<(), AllocError> {
        let existing = self.api.run_parameters(project_id, run_id).await?;
        for param in &existing {
            self.api
                .delete_run_parameter(project_id, run_id, param.id)
                .await?;
        }

        self.api
            .create_run_parameter(project_id, run_id, &self.build_url_param, build_url)
            .await?;
        self.api
            .create_run_parameter(
                project_id,
                run_id,
                &self.mem_total_param,
                &mem_total.to_string(),
            )
            .await?;
        info!(run_id, removed = existing.len(), "Flash parameters set");
        Ok(())
    }

    /// Poll until the run finishes or is aborted. `None` on timeout.
    async fn wait_for_run(
        &self,
        project_id: i64,
        mut run: TestRun,
        cancel: &Cancellation,
    ) -> Result<Option<TestRun>, AllocError> {
        let deadline = Instant::now() + self.timeout;

        while !matches!(run.state, RunState::Finished | RunState::Aborted) {
            if let Err(cancelled) = cancel.sleep(self.poll_interval).await {
                warn!(run_id = run.id, "Cancelled while flashing, aborting run");
                if let Err(e) = self.api.abort_run(project_id, run.id).await {
                    warn!(run_id = run.id, error = %e, "Failed to abort flash run");
                }
                return Err(cancelled.into());
            }

            run = self.api.run(project_id, run.id).await?;

            if Instant::now() >= deadline
                && !matches!(run.state, RunState::Finished | RunState::Aborted)
            {
                if run.state == RunState::Waiting {
                    info!(run_id = run.id, "Flash run still queued, aborting");
                    self.api.abort_run(project_id, run.id).await?;
                }
                error!(
                    run_id = run.id,
                    state = ?run.state,
                    timeout = ?self.timeout,
                    "Flash run did not finish in time"
                );
                return Ok(None);
            }
        }

        Ok(Some(run))
    }

    async fn check_device_run(
        &self,
        project_id: i64,
        run_id: i64,
        device_id: i64,
    ) -> Result<ProvisionOutcome, AllocError> {
        let device_runs = self.api.device_runs(project_id, run_id).await?;
        let failed = device_runs
            .iter()
            .find(|r| r.device_id == device_id && r.run_status == DeviceRunStatus::Failed);

        let Some(device_run) = failed else {
            info!(run_id, device_id, "Flash run finished");
            return Ok(ProvisionOutcome::Flashed { run_id, device_id });
        };

        error!(run_id, device_id, device_run_id = device_run.id, "Flashing failed");
        self.save_log(project_id, run_id, device_run.id).await;
        Ok(ProvisionOutcome::Failed { run_id })
    }

    async fn save_log(&self, project_id: i64, run_id: i64, device_run_id: i64) {
        let Some(workspace) = &self.workspace else {
            return;
        };

        let log = match self
            .api
            .device_run_log(project_id, run_id, device_run_id)
            .await
        {
            Ok(log) => log,
            Err(e) => {
                warn!(run_id, device_run_id, error = %e, "Failed to fetch flash log");
                return;
            }
        };

        let file = format!("flash-{}-{}.log", run_id, device_run_id);
        match workspace.write(&file, &log).await {
            Ok(path) => info!(path = %path.display(), "Flash log saved"),
            Err(e) => warn!(file = %file, error = %e, "Failed to save flash log"),
        }
    }
}

fn describe(filters: &[DeviceFilter]) -> String {
    if filters.is_empty() {
        return "<none>".to_string();
    }
    filters
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation;
    use devlease_testing::{FakeFarm, FlashPlan};

    struct Fixture {
        farm: Arc<FakeFarm>,
        device: i64,
        filters: Vec<DeviceFilter>,
    }

    fn fixture() -> Fixture {
        let farm = FakeFarm::new();
        let project = farm.add_project("flash-fxos");
        farm.set_project_params(project, &[("STALE", "1"), ("FLAME_ZIP_URL", "old")]);
        let device = farm.add_device("flame-1", true, false);
        farm.tag(device, "Device Type", "flame");
        Fixture {
            farm,
            device,
            filters: vec![DeviceFilter::new("Device Type", "flame")],
        }
    }

    fn config() -> AllocatorConfig {
        AllocatorConfig {
            flash_timeout: Duration::from_secs(60),
            flash_poll_interval: Duration::from_secs(10),
            ..AllocatorConfig::default()
        }
    }

    fn provisioner(farm: &Arc<FakeFarm>) -> Provisioner {
        Provisioner::new(farm.clone(), &config())
    }

    #[tokio::test(start_paused = true)]
    async fn test_flashes_matching_device() {
        let f = fixture();
        f.farm.set_flash_plan(FlashPlan::Finishes {
            polls: 2,
            status: DeviceRunStatus::Passed,
        });

        let outcome = provisioner(&f.farm)
            .provision(&f.filters, "http://img/a.zip", 0, &Cancellation::never())
            .await
            .unwrap();

        let ProvisionOutcome::Flashed { run_id, device_id } = outcome else {
            panic!("expected flashed, got {:?}", outcome);
        };
        assert_eq!(device_id, f.device);
        assert_eq!(f.farm.started_runs(), vec![(run_id, vec![f.device])]);
        assert_eq!(f.farm.run_state(run_id), Some(RunState::Finished));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parameters_reset_between_runs() {
        let f = fixture();
        let provisioner = provisioner(&f.farm);

        provisioner
            .provision(&f.filters, "http://img/first.zip", 0, &Cancellation::never())
            .await
            .unwrap();
        let outcome = provisioner
            .provision(&f.filters, "http://img/second.zip", 512, &Cancellation::never())
            .await
            .unwrap();

        let ProvisionOutcome::Flashed { run_id, .. } = outcome else {
            panic!("expected flashed, got {:?}", outcome);
        };
        let mut params = f.farm.run_params(run_id);
        params.sort();
        assert_eq!(
            params,
            vec![
                ("FLAME_ZIP_URL".to_string(), "http://img/second.zip".to_string()),
                ("MEM_TOTAL".to_string(), "512".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_locked_device_is_still_a_target() {
        let farm = FakeFarm::new();
        farm.add_project("flash-fxos");
        let device = farm.add_device("busy", true, true);

        let outcome = provisioner(&farm)
            .provision(&[], "http://img/a.zip", 0, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProvisionOutcome::Flashed {
                run_id: farm.started_runs()[0].0,
                device_id: device
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_project() {
        let farm = FakeFarm::new();
        farm.add_device("flame-1", true, false);

        let outcome = provisioner(&farm)
            .provision(&[], "http://img/a.zip", 0, &Cancellation::never())
            .await
            .unwrap();

        assert_eq!(outcome, ProvisionOutcome::JobNotFound);
        assert!(farm.started_runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_target_device() {
        let f = fixture();

        let err = provisioner(&f.farm)
            .provision(
                &[DeviceFilter::new("Device Type", "keon")],
                "http://img/a.zip",
                0,
                &Cancellation::never(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AllocError::NoMatchingDevice { .. }));
        assert!(f.farm.started_runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_run_is_aborted_on_timeout() {
        let f = fixture();
        f.farm.set_flash_plan(FlashPlan::StuckWaiting);

        let start = Instant::now();
        let outcome = provisioner(&f.farm)
            .provision(&f.filters, "http://img/a.zip", 0, &Cancellation::never())
            .await
            .unwrap();

        let ProvisionOutcome::TimedOut { run_id } = outcome else {
            panic!("expected timeout, got {:?}", outcome);
        };
        assert_eq!(start.elapsed(), Duration::from_secs(60));
        assert_eq!(f.farm.aborted_runs(), vec![run_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_run_is_left_alone_on_timeout() {
        let f = fixture();
        f.farm.set_flash_plan(FlashPlan::StuckRunning);

        let outcome = provisioner(&f.farm)
            .provision(&f.filters, "http://img/a.zip", 0, &Cancellation::never())
            .await
            .unwrap();

        let ProvisionOutcome::TimedOut { run_id } = outcome else {
            panic!("expected timeout, got {:?}", outcome);
        };
        assert!(f.farm.aborted_runs().is_empty());
        assert_eq!(f.farm.run_state(run_id), Some(RunState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_device_run_saves_log() {
        let f = fixture();
        f.farm.set_flash_plan(FlashPlan::Finishes {
            polls: 0,
            status: DeviceRunStatus::Failed,
        });
        f.farm.set_flash_log("fastboot: image corrupt");
        let dir = tempfile::tempdir().unwrap();

        let outcome = provisioner(&f.farm)
            .with_workspace(Workspace::new(dir.path()))
            .provision(&f.filters, "http://img/a.zip", 0, &Cancellation::never())
            .await
            .unwrap();

        assert!(matches!(outcome, ProvisionOutcome::Failed { .. }));
        let logs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].starts_with("flash-") && logs[0].ends_with(".log"));
        let content = std::fs::read_to_string(dir.path().join(&logs[0])).unwrap();
        assert_eq!(content, "fastboot: image corrupt");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_run() {
        let f = fixture();
        f.farm.set_flash_plan(FlashPlan::StuckRunning);
        let (handle, cancel) = cancellation();

        let task = tokio::spawn({
            let provisioner = provisioner(&f.farm);
            let filters = f.filters.clone();
            async move {
                provisioner
                    .provision(&filters, "http://img/a.zip", 0, &cancel)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, AllocError::Cancelled));
        let started = f.farm.started_runs();
        assert_eq!(f.farm.aborted_runs(), vec![started[0].0]);
    }
}
