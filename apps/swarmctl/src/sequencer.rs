//! Per-device bootstrap runs.
//!
//! Each reachable device gets its own worker that walks the plan in order.
//! Every step opens a fresh session (key first, then password), evaluates
//! the step's remote check, and only runs the step's actions when the check
//! fails. A failing step ends that device's run; other devices carry on.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::DeviceAuth;
use crate::credentials::Credentials;
use crate::device::Device;
use crate::error::{BootstrapError, BootstrapResult};
use crate::report::{DeviceReport, DeviceStatus, StepLog, StepStatus};
use crate::steps::{BootstrapStep, RemoteAction, RemoteCheck, StepContext};
use crate::transport::{run_remote, RemoteSession, SshTarget, Transport};
use crate::util::{output_tail, trim_logs};

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct SequencerSettings {
    pub concurrency: usize,
    pub ssh_port: u16,
    pub connect_timeout: Duration,
    pub step_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Completed,
    Skipped,
}

#[derive(Clone)]
pub struct Sequencer {
    transport: Arc<dyn Transport>,
    credentials: Arc<Credentials>,
    context: Arc<StepContext>,
    plan: Arc<Vec<BootstrapStep>>,
    settings: SequencerSettings,
}

impl Sequencer {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<Credentials>,
        context: Arc<StepContext>,
        plan: Vec<BootstrapStep>,
        settings: SequencerSettings,
    ) -> Self {
        Self {
            transport,
            credentials,
            context,
            plan: Arc::new(plan),
            settings,
        }
    }

    pub fn plan(&self) -> &[BootstrapStep] {
        &self.plan
    }

    /// Bootstraps `devices` concurrently. Reports come back in input order.
    ///
    /// When the swarm token still has to be read from a manager that is
    /// itself in the fleet, that device runs first so Docker is installed on
    /// it before anyone asks it for a token.
    pub async fn run(&self, devices: Vec<Device>, cancel: CancellationToken) -> Vec<DeviceReport> {
        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let lead = self.swarm_lead(&devices);
        let mut reports: Vec<Option<DeviceReport>> = vec![None; devices.len()];

        if let Some(index) = lead {
            let device = devices[index].clone();
            tracing::info!(device = %device.address, "bootstrapping swarm manager first");
            let handle = self.spawn_device(device.clone(), semaphore.clone(), cancel.clone());
            reports[index] = Some(collect_report(&device, handle).await);
        }

        let handles: Vec<_> = devices
            .iter()
            .enumerate()
            .filter(|(index, _)| Some(*index) != lead)
            .map(|(index, device)| {
                let handle = self.spawn_device(device.clone(), semaphore.clone(), cancel.clone());
                (index, device, handle)
            })
            .collect();
        for (index, device, handle) in handles {
            reports[index] = Some(collect_report(device, handle).await);
        }
        reports.into_iter().flatten().collect()
    }

    fn swarm_lead(&self, devices: &[Device]) -> Option<usize> {
        if !self.plan.contains(&BootstrapStep::JoinSwarm) {
            return None;
        }
        let manager = self.context.swarm.pending_manager()?;
        devices
            .iter()
            .position(|device| device.address.eq_ignore_ascii_case(manager))
    }

    fn spawn_device(
        &self,
        device: Device,
        semaphore: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> JoinHandle<DeviceReport> {
        let worker = self.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                return DeviceReport::cancelled(&device);
            };
            if cancel.is_cancelled() {
                return DeviceReport::cancelled(&device);
            }
            let blocking_device = device.clone();
            let task = tokio::task::spawn_blocking(move || {
                worker.bootstrap_device(blocking_device, &cancel)
            });
            match task.await {
                Ok(report) => report,
                Err(err) => failed_report(&device, format!("bootstrap worker failed: {err}")),
            }
        })
    }

    fn bootstrap_device(&self, device: Device, cancel: &CancellationToken) -> DeviceReport {
        let mut report = DeviceReport::new(&device);
        let mut auth = DeviceAuth::new();
        let target = SshTarget {
            host: device.address.clone(),
            port: self.settings.ssh_port,
            username: self.credentials.username.clone(),
        };
        tracing::info!(device = %device.address, steps = self.plan.len(), "bootstrap started");

        for step in self.plan.iter().copied() {
            if cancel.is_cancelled() {
                tracing::warn!(device = %device.address, step = %step, "cancelled before step");
                report.status = DeviceStatus::Cancelled;
                report.error = Some(format!("cancelled before {step}"));
                break;
            }
            let started_at = Utc::now();
            let mut logs = Vec::new();
            let result = self.run_step(step, &mut auth, &target, &mut logs);
            trim_logs(&mut logs);
            let status = match result {
                Ok(StepOutcome::Skipped) => {
                    tracing::info!(
                        device = %device.address,
                        step = %step,
                        "already done; skipping"
                    );
                    report.skipped_steps.push(step);
                    StepStatus::Skipped
                }
                Ok(StepOutcome::Completed) => {
                    tracing::info!(device = %device.address, step = %step, "step completed");
                    report.completed_steps.push(step);
                    StepStatus::Completed
                }
                Err(err) => {
                    let err = BootstrapError::step(&device.address, step, err);
                    tracing::warn!(
                        device = %device.address,
                        step = %step,
                        error = %err,
                        "step failed"
                    );
                    logs.push(err.to_string());
                    report.status = DeviceStatus::Failed;
                    report.failed_step = Some(step);
                    report.error = Some(err.to_string());
                    StepStatus::Failed
                }
            };
            report.steps.push(StepLog {
                step,
                status,
                started_at,
                finished_at: Utc::now(),
                logs,
            });
            if status == StepStatus::Failed {
                break;
            }
        }

        report.auth_state = auth.state();
        report.auth_attempts = auth.into_attempts();
        tracing::info!(
            device = %device.address,
            status = report.status.as_str(),
            completed = report.completed_steps.len(),
            skipped = report.skipped_steps.len(),
            "bootstrap finished"
        );
        report
    }

    fn run_step(
        &self,
        step: BootstrapStep,
        auth: &mut DeviceAuth,
        target: &SshTarget,
        logs: &mut Vec<String>,
    ) -> BootstrapResult<StepOutcome> {
        let check = self.context.check(step)?;
        let mut session = auth.connect(
            self.transport.as_ref(),
            target,
            &self.credentials,
            self.settings.connect_timeout,
        )?;
        logs.push(format!(
            "Connected to {} as {} ({}).",
            target.host,
            target.username,
            auth.state()
        ));

        if self.check_satisfied(session.as_mut(), &check)? {
            logs.push("Already satisfied; nothing to do.".to_string());
            return Ok(StepOutcome::Skipped);
        }

        let actions = self.context.actions(step)?;
        // Reading the token from a manager that is this device initializes
        // the swarm here, which leaves nothing to join.
        if step == BootstrapStep::JoinSwarm
            && self
                .context
                .swarm
                .manager()
                .is_some_and(|manager| manager.eq_ignore_ascii_case(&target.host))
            && self.check_satisfied(session.as_mut(), &check)?
        {
            logs.push("Swarm initialized on this manager.".to_string());
            return Ok(StepOutcome::Completed);
        }

        match self.run_actions(session.as_mut(), &actions.primary, logs) {
            Ok(()) => Ok(StepOutcome::Completed),
            Err(err) => {
                let Some(fallback) = &actions.fallback else {
                    return Err(err);
                };
                tracing::warn!(device = %target.host, step = %step, error = %err, "falling back");
                logs.push(format!("Primary action failed ({err}); using fallback."));
                self.run_actions(session.as_mut(), fallback, logs)?;
                Ok(StepOutcome::Completed)
            }
        }
    }

    fn check_satisfied(
        &self,
        session: &mut dyn RemoteSession,
        check: &RemoteCheck,
    ) -> BootstrapResult<bool> {
        let output = run_remote(
            session,
            &check.command,
            check.privilege,
            self.credentials.password(),
            CHECK_TIMEOUT,
        )?;
        Ok(output.success())
    }

    fn run_actions(
        &self,
        session: &mut dyn RemoteSession,
        actions: &[RemoteAction],
        logs: &mut Vec<String>,
    ) -> BootstrapResult<()> {
        let sudo_password = self.credentials.password();
        for action in actions {
            logs.push(format!("$ {}", action.describe()));
            match action {
                RemoteAction::Exec {
                    command,
                    privilege,
                    tool,
                    ..
                } => {
                    let output = run_remote(
                        session,
                        command,
                        *privilege,
                        sudo_password,
                        self.settings.step_timeout,
                    )?;
                    logs.extend(
                        output
                            .combined()
                            .lines()
                            .map(str::trim_end)
                            .filter(|line| !line.is_empty())
                            .map(str::to_string),
                    );
                    trim_logs(logs);
                    if !output.success() {
                        return Err(BootstrapError::RemoteTool {
                            tool: (*tool).to_string(),
                            exit_code: output.exit_code,
                            output: output_tail(&output.combined(), ERROR_TAIL_LINES),
                        });
                    }
                }
                RemoteAction::Upload {
                    remote_path,
                    contents,
                    mode,
                } => {
                    session.upload(remote_path, contents, *mode)?;
                }
            }
        }
        Ok(())
    }
}

async fn collect_report(device: &Device, handle: JoinHandle<DeviceReport>) -> DeviceReport {
    match handle.await {
        Ok(report) => report,
        Err(err) => failed_report(device, format!("bootstrap task failed: {err}")),
    }
}

fn failed_report(device: &Device, message: String) -> DeviceReport {
    DeviceReport {
        status: DeviceStatus::Failed,
        error: Some(message),
        ..DeviceReport::new(device)
    }
}
