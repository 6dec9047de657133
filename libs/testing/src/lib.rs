//! In-memory device farm.
//!
//! [`FakeFarm`] implements [`FarmApi`] over plain collections so allocator
//! tests can script contention, slow sessions, failed flashes and late
//! proxies without a network. Every call is recorded for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use devlease_farm_api::{
    ApiError, Connect, Device, DeviceProperty, DeviceQuery, DeviceRun, DeviceRunStatus,
    DeviceSession, FarmApi, Label, LabelGroup, Project, ProxyEntry, ProxyKind, RunParameter,
    RunState, SessionState, TestRun, User,
};

/// Status the fake answers with when a device is already locked.
pub const CONFLICT_STATUS: u16 = 400;

/// How the next created session behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPlan {
    /// Rejected with [`CONFLICT_STATUS`].
    Conflict,
    /// Created `WAITING`, reported `WAITING` for this many refreshes, then `RUNNING`.
    Running { waiting_polls: u32 },
    /// Never leaves `WAITING`.
    StuckWaiting,
    /// Created `WAITING`, then ends in the given state on first refresh.
    Ends(SessionState),
}

/// How proxy discovery behaves for one proxy kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyPlan {
    /// Empty for `empty_polls` queries, then one entry.
    After { empty_polls: u32, port: u16 },
    /// Always empty.
    Never,
    /// Query fails with a server error.
    Error,
}

/// How provisioning runs behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashPlan {
    /// `RUNNING` for `polls` refreshes, then `FINISHED` with `status`.
    Finishes { polls: u32, status: DeviceRunStatus },
    /// Queued forever.
    StuckWaiting,
    /// Running forever.
    StuckRunning,
}

#[derive(Debug)]
struct FakeDevice {
    device: Device,
    labels: Vec<i64>,
}

#[derive(Debug)]
struct FakeRun {
    run: TestRun,
    params: Vec<RunParameter>,
    devices: Vec<i64>,
    polls_left: u32,
}

#[derive(Debug)]
struct FakeSession {
    session: DeviceSession,
    plan: SessionPlan,
    waiting_left: u32,
}

#[derive(Debug, Default)]
struct FarmState {
    next_id: i64,
    groups: Vec<LabelGroup>,
    labels: Vec<(i64, Label)>,
    devices: Vec<FakeDevice>,
    projects: Vec<Project>,
    project_params: HashMap<i64, Vec<RunParameter>>,
    runs: HashMap<i64, FakeRun>,
    sessions: HashMap<i64, FakeSession>,
    session_plans: VecDeque<SessionPlan>,
    proxy_plans: HashMap<ProxyKind, ProxyPlan>,
    proxy_polls: HashMap<ProxyKind, u32>,
    flash_plan: Option<FlashPlan>,
    flash_tag: Option<(String, String)>,
    flash_log: String,
    release_failures: u32,

    device_queries: u32,
    sessions_created: Vec<i64>,
    released: Vec<i64>,
    release_attempts: Vec<i64>,
    started_runs: Vec<(i64, Vec<i64>)>,
    aborted_runs: Vec<i64>,
}

impl FarmState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn group_id(&mut self, group: &str) -> i64 {
        if let Some(existing) = self.groups.iter().find(|g| g.display_name == group) {
            return existing.id;
        }
        let id = self.next_id();
        self.groups.push(LabelGroup {
            id,
            display_name: group.to_string(),
        });
        id
    }

    fn label_id(&mut self, group: &str, label: &str) -> i64 {
        let group_id = self.group_id(group);
        if let Some((_, existing)) = self
            .labels
            .iter()
            .find(|(g, l)| *g == group_id && l.display_name == label)
        {
            return existing.id;
        }
        let id = self.next_id();
        self.labels.push((
            group_id,
            Label {
                id,
                display_name: label.to_string(),
            },
        ));
        id
    }

    fn tag(&mut self, device_id: i64, group: &str, label: &str) {
        let label_id = self.label_id(group, label);
        if let Some(device) = self.devices.iter_mut().find(|d| d.device.id == device_id) {
            if !device.labels.contains(&label_id) {
                device.labels.push(label_id);
            }
        }
    }

    fn set_locked(&mut self, device_id: Option<i64>, locked: bool) {
        if let Some(device) = self
            .devices
            .iter_mut()
            .find(|d| Some(d.device.id) == device_id)
        {
            device.device.locked = locked;
        }
    }

    fn finish_run(&mut self, run_id: i64) {
        let status = match self.flash_plan {
            Some(FlashPlan::Finishes { status, .. }) => status,
            _ => DeviceRunStatus::Passed,
        };
        let Some(run) = self.runs.get_mut(&run_id) else {
            return;
        };
        run.run.state = RunState::Finished;
        let devices = run.devices.clone();

        if status == DeviceRunStatus::Passed {
            if let Some((group, label)) = self.flash_tag.clone() {
                for device_id in devices {
                    self.tag(device_id, &group, &label);
                }
            }
        }
    }
}

/// Callback run while a proxy query is in flight.
pub type ProxyHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ProxyHooks(Mutex<HashMap<ProxyKind, ProxyHook>>);

impl std::fmt::Debug for ProxyHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProxyHooks")
    }
}

/// In-memory device farm.
#[derive(Debug, Default)]
pub struct FakeFarm {
    state: Mutex<FarmState>,
    connects: AtomicU32,
    proxy_hooks: ProxyHooks,
}

impl FakeFarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, FarmState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- setup ---

    /// Add a device to the pool and return its id.
    pub fn add_device(&self, name: &str, online: bool, locked: bool) -> i64 {
        let mut state = self.state();
        let id = state.next_id();
        state.devices.push(FakeDevice {
            device: Device {
                id,
                display_name: name.to_string(),
                online,
                locked,
            },
            labels: Vec::new(),
        });
        id
    }

    /// Define a label (and its group) without attaching it to a device.
    pub fn add_label(&self, group: &str, label: &str) -> i64 {
        self.state().label_id(group, label)
    }

    /// Attach a label to a device, creating the label if needed.
    pub fn tag(&self, device_id: i64, group: &str, label: &str) {
        self.state().tag(device_id, group, label);
    }

    /// Add a project; returns its id.
    pub fn add_project(&self, name: &str) -> i64 {
        let mut state = self.state();
        let id = state.next_id();
        state.projects.push(Project {
            id,
            name: name.to_string(),
        });
        id
    }

    /// Parameters every new run of the project starts with.
    pub fn set_project_params(&self, project_id: i64, params: &[(&str, &str)]) {
        let mut state = self.state();
        let params = params
            .iter()
            .map(|(k, v)| RunParameter {
                id: state.next_id(),
                key: k.to_string(),
                value: v.to_string(),
            })
            .collect();
        state.project_params.insert(project_id, params);
    }

    pub fn set_flash_plan(&self, plan: FlashPlan) {
        self.state().flash_plan = Some(plan);
    }

    /// Label attached to the flashed device when a run passes.
    pub fn on_flash_tag(&self, group: &str, label: &str) {
        self.state().flash_tag = Some((group.to_string(), label.to_string()));
    }

    pub fn set_flash_log(&self, log: &str) {
        self.state().flash_log = log.to_string();
    }

    /// Queue behaviour for the next created sessions, in order. Once the
    /// queue is empty sessions start running on the first refresh.
    pub fn push_session_plan(&self, plan: SessionPlan) {
        self.state().session_plans.push_back(plan);
    }

    pub fn set_proxy_plan(&self, kind: ProxyKind, plan: ProxyPlan) {
        self.state().proxy_plans.insert(kind, plan);
    }

    /// Run `hook` during every `kind` proxy query, before it answers.
    pub fn on_proxy_query(&self, kind: ProxyKind, hook: impl Fn() + Send + Sync + 'static) {
        self.proxy_hooks
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(kind, Box::new(hook));
    }

    /// Fail the next `times` release calls as if the token had expired.
    pub fn fail_releases(&self, times: u32) {
        self.state().release_failures = times;
    }

    // --- inspection ---

    pub fn device(&self, device_id: i64) -> Option<Device> {
        self.state()
            .devices
            .iter()
            .find(|d| d.device.id == device_id)
            .map(|d| d.device.clone())
    }

    pub fn device_queries(&self) -> u32 {
        self.state().device_queries
    }

    pub fn sessions_created(&self) -> Vec<i64> {
        self.state().sessions_created.clone()
    }

    /// Successfully released session ids, in call order.
    pub fn released(&self) -> Vec<i64> {
        self.state().released.clone()
    }

    /// Every release call, including failed ones.
    pub fn release_attempts(&self) -> Vec<i64> {
        self.state().release_attempts.clone()
    }

    /// `(run id, device ids)` for every started run.
    pub fn started_runs(&self) -> Vec<(i64, Vec<i64>)> {
        self.state().started_runs.clone()
    }

    pub fn aborted_runs(&self) -> Vec<i64> {
        self.state().aborted_runs.clone()
    }

    pub fn run_state(&self, run_id: i64) -> Option<RunState> {
        self.state().runs.get(&run_id).map(|r| r.run.state)
    }

    /// Final `(key, value)` parameters of a run.
    pub fn run_params(&self, run_id: i64) -> Vec<(String, String)> {
        self.state()
            .runs
            .get(&run_id)
            .map(|r| {
                r.params
                    .iter()
                    .map(|p| (p.key.clone(), p.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn proxy_polls(&self, kind: ProxyKind) -> u32 {
        self.state().proxy_polls.get(&kind).copied().unwrap_or(0)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Connector handing out this farm, counting reconnects.
    pub fn connector(self: &Arc<Self>) -> FakeConnector {
        FakeConnector {
            farm: Arc::clone(self),
        }
    }
}

fn not_found(what: &str, id: i64) -> ApiError {
    ApiError::status(404, format!("{} {} not found", what, id))
}

#[async_trait]
impl FarmApi for FakeFarm {
    async fn me(&self) -> Result<User, ApiError> {
        Ok(User {
            id: 1,
            email: Some("ci@example.com".to_string()),
        })
    }

    async fn label_groups(&self, search: &str) -> Result<Vec<LabelGroup>, ApiError> {
        Ok(self
            .state()
            .groups
            .iter()
            .filter(|g| g.display_name.contains(search))
            .cloned()
            .collect())
    }

    async fn labels(&self, group_id: i64, search: &str) -> Result<Vec<Label>, ApiError> {
        Ok(self
            .state()
            .labels
            .iter()
            .filter(|(g, l)| *g == group_id && l.display_name.contains(search))
            .map(|(_, l)| l.clone())
            .collect())
    }

    async fn devices(&self, query: &DeviceQuery) -> Result<Vec<Device>, ApiError> {
        let mut state = self.state();
        state.device_queries += 1;
        let mut devices: Vec<Device> = state
            .devices
            .iter()
            .filter(|d| query.label_ids.iter().all(|id| d.labels.contains(id)))
            .map(|d| d.device.clone())
            .collect();
        if query.limit > 0 {
            devices.truncate(query.limit as usize);
        }
        Ok(devices)
    }

    async fn device_properties(&self, device_id: i64) -> Result<Vec<DeviceProperty>, ApiError> {
        let state = self.state();
        let device = state
            .devices
            .iter()
            .find(|d| d.device.id == device_id)
            .ok_or_else(|| not_found("device", device_id))?;

        Ok(device
            .labels
            .iter()
            .filter_map(|label_id| {
                let (group_id, label) = state.labels.iter().find(|(_, l)| l.id == *label_id)?;
                let group = state.groups.iter().find(|g| g.id == *group_id)?;
                Some(DeviceProperty {
                    id: label.id,
                    display_name: label.display_name.clone(),
                    property_group_name: group.display_name.clone(),
                })
            })
            .collect())
    }

    async fn projects(&self, search: &str) -> Result<Vec<Project>, ApiError> {
        Ok(self
            .state()
            .projects
            .iter()
            .filter(|p| p.name.contains(search))
            .cloned()
            .collect())
    }

    async fn create_run(&self, project_id: i64) -> Result<TestRun, ApiError> {
        let mut state = self.state();
        if !state.projects.iter().any(|p| p.id == project_id) {
            return Err(not_found("project", project_id));
        }
        let id = state.next_id();
        let run = TestRun {
            id,
            project_id,
            state: RunState::Created,
        };
        let params = state
            .project_params
            .get(&project_id)
            .cloned()
            .unwrap_or_default();
        state.runs.insert(
            id,
            FakeRun {
                run: run.clone(),
                params,
                devices: Vec::new(),
                polls_left: 0,
            },
        );
        Ok(run)
    }

    async fn run(&self, _project_id: i64, run_id: i64) -> Result<TestRun, ApiError> {
        let mut state = self.state();
        let plan = state.flash_plan;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found("run", run_id))?;

        if run.run.state == RunState::Running {
            match plan {
                Some(FlashPlan::StuckRunning) => {}
                _ if run.polls_left > 0 => run.polls_left -= 1,
                _ => state.finish_run(run_id),
            }
        }

        Ok(state.runs[&run_id].run.clone())
    }

    async fn run_parameters(
        &self,
        _project_id: i64,
        run_id: i64,
    ) -> Result<Vec<RunParameter>, ApiError> {
        self.state()
            .runs
            .get(&run_id)
            .map(|r| r.params.clone())
            .ok_or_else(|| not_found("run", run_id))
    }

    async fn delete_run_parameter(
        &self,
        _project_id: i64,
        run_id: i64,
        parameter_id: i64,
    ) -> Result<(), ApiError> {
        let mut state = self.state();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found("run", run_id))?;
        run.params.retain(|p| p.id != parameter_id);
        Ok(())
    }

    async fn create_run_parameter(
        &self,
        project_id: i64,
        run_id: i64,
        key: &str,
        value: &str,
    ) -> Result<RunParameter, ApiError> {
        let mut state = self.state();
        let param = RunParameter {
            id: state.next_id(),
            key: key.to_string(),
            value: value.to_string(),
        };
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found("run", run_id))?;
        run.params.push(param.clone());
        let params = run.params.clone();
        // Config is shared with the project, so the next run inherits it.
        state.project_params.insert(project_id, params);
        Ok(param)
    }

    async fn start_run(&self, run_id: i64, device_ids: &[i64]) -> Result<TestRun, ApiError> {
        let mut state = self.state();
        let plan = state.flash_plan;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found("run", run_id))?;

        run.devices = device_ids.to_vec();
        match plan {
            Some(FlashPlan::StuckWaiting) => run.run.state = RunState::Waiting,
            Some(FlashPlan::Finishes { polls, .. }) => {
                run.run.state = RunState::Running;
                run.polls_left = polls;
            }
            _ => run.run.state = RunState::Running,
        }
        let started = run.run.clone();
        state.started_runs.push((run_id, device_ids.to_vec()));
        Ok(started)
    }

    async fn abort_run(&self, _project_id: i64, run_id: i64) -> Result<(), ApiError> {
        let mut state = self.state();
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| not_found("run", run_id))?;
        run.run.state = RunState::Aborted;
        state.aborted_runs.push(run_id);
        Ok(())
    }

    async fn device_runs(&self, _project_id: i64, run_id: i64) -> Result<Vec<DeviceRun>, ApiError> {
        let mut state = self.state();
        let status = match state.flash_plan {
            Some(FlashPlan::Finishes { status, .. }) => status,
            _ => DeviceRunStatus::Passed,
        };
        let devices = state
            .runs
            .get(&run_id)
            .map(|r| r.devices.clone())
            .ok_or_else(|| not_found("run", run_id))?;

        Ok(devices
            .into_iter()
            .map(|device_id| DeviceRun {
                id: state.next_id(),
                device_id,
                run_status: status,
            })
            .collect())
    }

    async fn device_run_log(
        &self,
        _project_id: i64,
        _run_id: i64,
        _device_run_id: i64,
    ) -> Result<String, ApiError> {
        Ok(self.state().flash_log.clone())
    }

    async fn create_session(&self, device_id: i64) -> Result<DeviceSession, ApiError> {
        let mut state = self.state();
        let locked = state
            .devices
            .iter()
            .find(|d| d.device.id == device_id)
            .map(|d| d.device.locked)
            .ok_or_else(|| not_found("device", device_id))?;

        let plan = state
            .session_plans
            .pop_front()
            .unwrap_or(SessionPlan::Running { waiting_polls: 0 });

        if locked || plan == SessionPlan::Conflict {
            return Err(ApiError::status(CONFLICT_STATUS, "Device is already in use"));
        }

        let id = state.next_id();
        let session = DeviceSession {
            id,
            device_id: Some(device_id),
            state: SessionState::Waiting,
        };
        let waiting_left = match plan {
            SessionPlan::Running { waiting_polls } => waiting_polls,
            _ => 0,
        };
        state.sessions.insert(
            id,
            FakeSession {
                session: session.clone(),
                plan,
                waiting_left,
            },
        );
        state.sessions_created.push(id);
        state.set_locked(Some(device_id), true);
        Ok(session)
    }

    async fn session(&self, session_id: i64) -> Result<DeviceSession, ApiError> {
        let mut state = self.state();
        let fake = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found("session", session_id))?;

        if fake.session.state == SessionState::Waiting {
            match fake.plan {
                SessionPlan::Running { .. } if fake.waiting_left > 0 => fake.waiting_left -= 1,
                SessionPlan::Running { .. } => fake.session.state = SessionState::Running,
                SessionPlan::Ends(end) => fake.session.state = end,
                SessionPlan::StuckWaiting | SessionPlan::Conflict => {}
            }
        }
        Ok(fake.session.clone())
    }

    async fn release_session(&self, session_id: i64) -> Result<(), ApiError> {
        let mut state = self.state();
        state.release_attempts.push(session_id);

        if state.release_failures > 0 {
            state.release_failures -= 1;
            return Err(ApiError::NotAuthenticated("token expired".to_string()));
        }

        let fake = state
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found("session", session_id))?;
        fake.session.state = SessionState::Finished;
        let device_id = fake.session.device_id;
        state.set_locked(device_id, false);
        state.released.push(session_id);
        Ok(())
    }

    async fn proxies(&self, kind: ProxyKind, session_id: i64) -> Result<Vec<ProxyEntry>, ApiError> {
        if let Some(hook) = self
            .proxy_hooks
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
        {
            hook();
        }

        let mut state = self.state();
        let polls = {
            let counter = state.proxy_polls.entry(kind).or_insert(0);
            *counter += 1;
            *counter
        };
        let default_port = match kind {
            ProxyKind::Adb => 15037,
            ProxyKind::Marionette => 2828,
        };
        let plan = state
            .proxy_plans
            .get(&kind)
            .cloned()
            .unwrap_or(ProxyPlan::After {
                empty_polls: 0,
                port: default_port,
            });

        let port = match plan {
            ProxyPlan::Error => return Err(ApiError::status(500, "proxy plugin unavailable")),
            ProxyPlan::Never => return Ok(Vec::new()),
            ProxyPlan::After { empty_polls, .. } if polls <= empty_polls => {
                return Ok(Vec::new())
            }
            ProxyPlan::After { port, .. } => port,
        };

        let serial = state
            .sessions
            .get(&session_id)
            .and_then(|s| s.session.device_id)
            .map(|id| format!("serial-{}", id));

        Ok(vec![ProxyEntry {
            kind: Some(kind),
            port,
            serial_id: serial,
            session_id: Some(session_id),
        }])
    }
}

/// [`Connect`] implementation returning the same [`FakeFarm`].
#[derive(Debug, Clone)]
pub struct FakeConnector {
    farm: Arc<FakeFarm>,
}

#[async_trait]
impl Connect for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn FarmApi>, ApiError> {
        self.farm.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::clone(&self.farm) as Arc<dyn FarmApi>)
    }
}
