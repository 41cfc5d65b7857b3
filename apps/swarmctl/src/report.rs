use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

use crate::auth::AuthAttempt;
use crate::device::{AuthState, Device};
use crate::steps::BootstrapStep;

pub const EXIT_OK: u8 = 0;
pub const EXIT_PARTIAL: u8 = 1;
pub const EXIT_FATAL: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepLog {
    pub step: BootstrapStep,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Succeeded,
    Failed,
    Unreachable,
    Cancelled,
}

impl DeviceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "ok",
            Self::Failed => "failed",
            Self::Unreachable => "unreachable",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub status: DeviceStatus,
    pub auth_state: AuthState,
    pub completed_steps: Vec<BootstrapStep>,
    pub skipped_steps: Vec<BootstrapStep>,
    pub failed_step: Option<BootstrapStep>,
    pub error: Option<String>,
    pub auth_attempts: Vec<AuthAttempt>,
    pub steps: Vec<StepLog>,
}

impl DeviceReport {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.address.clone(),
            hostname: device.hostname.clone(),
            status: DeviceStatus::Succeeded,
            auth_state: device.auth_state,
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            failed_step: None,
            error: None,
            auth_attempts: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn unreachable(device: &Device, message: impl Into<String>) -> Self {
        Self {
            status: DeviceStatus::Unreachable,
            error: Some(message.into()),
            ..Self::new(device)
        }
    }

    pub fn cancelled(device: &Device) -> Self {
        Self {
            status: DeviceStatus::Cancelled,
            error: Some("cancelled before start".to_string()),
            ..Self::new(device)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub plan: Vec<BootstrapStep>,
    pub devices: Vec<DeviceReport>,
}

impl FleetReport {
    pub fn count(&self, status: DeviceStatus) -> usize {
        self.devices.iter().filter(|d| d.status == status).count()
    }

    /// 0 when every device succeeded, 2 when none was reachable, else 1.
    pub fn exit_code(&self) -> u8 {
        let reachable = self
            .devices
            .iter()
            .filter(|d| d.status != DeviceStatus::Unreachable)
            .count();
        if reachable == 0 {
            return EXIT_FATAL;
        }
        if self.count(DeviceStatus::Succeeded) == self.devices.len() {
            EXIT_OK
        } else {
            EXIT_PARTIAL
        }
    }

    pub fn render_table(&self) -> String {
        let rows: Vec<[String; 6]> = self
            .devices
            .iter()
            .map(|d| {
                [
                    d.device.clone(),
                    d.status.as_str().to_string(),
                    d.auth_state.to_string(),
                    join_steps(&d.completed_steps),
                    join_steps(&d.skipped_steps),
                    d.failed_step.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                ]
            })
            .collect();
        let mut out = render_columns(
            &["DEVICE", "STATUS", "AUTH", "COMPLETED", "SKIPPED", "FAILED"],
            &rows,
        );
        for device in &self.devices {
            if let Some(error) = &device.error {
                let _ = writeln!(out, "{}: {error}", device.device);
            }
        }
        let _ = writeln!(
            out,
            "{} ok, {} failed, {} unreachable, {} cancelled",
            self.count(DeviceStatus::Succeeded),
            self.count(DeviceStatus::Failed),
            self.count(DeviceStatus::Unreachable),
            self.count(DeviceStatus::Cancelled),
        );
        out
    }
}

pub fn render_probe_table(devices: &[Device]) -> String {
    let rows: Vec<[String; 4]> = devices
        .iter()
        .map(|d| {
            [
                d.address.clone(),
                d.hostname.clone().unwrap_or_else(|| "-".to_string()),
                yes_no(d.reachable),
                yes_no(d.ssh_port_open),
            ]
        })
        .collect();
    render_columns(&["DEVICE", "HOSTNAME", "REACHABLE", "SSH"], &rows)
}

/// Exit code for a probe-only run.
pub fn probe_exit_code(devices: &[Device]) -> u8 {
    let reachable = devices.iter().filter(|d| d.reachable).count();
    if reachable == 0 {
        EXIT_FATAL
    } else if reachable == devices.len() {
        EXIT_OK
    } else {
        EXIT_PARTIAL
    }
}

fn yes_no(value: bool) -> String {
    let label = if value { "yes" } else { "no" };
    label.to_string()
}

fn join_steps(steps: &[BootstrapStep]) -> String {
    if steps.is_empty() {
        return "-".to_string();
    }
    steps
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

fn render_columns<const N: usize>(headers: &[&str; N], rows: &[[String; N]]) -> String {
    let mut widths: [usize; N] = headers.map(str::len);
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }
    let mut out = String::new();
    let mut push_row = |cells: Vec<&str>| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths.iter())
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect();
        let _ = writeln!(out, "{}", line.join("  ").trim_end());
    };
    push_row(headers.to_vec());
    for row in rows {
        push_row(row.iter().map(String::as_str).collect());
    }
    out
}
