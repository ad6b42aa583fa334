//! Pre-flight environment checks: virtualization and secondary displays.
//!
//! The validator only reads. Each heuristic that cannot run (registry key
//! missing, access denied, unsupported platform) contributes no evidence and the
//! validator carries on; it never fails. Whether a verdict aborts the session is
//! decided by [`EnvironmentVerdict::abort_reason`] against the policy.

mod fingerprints;

pub use fingerprints::{match_disk_signature, match_mac_prefix, match_vendor, match_vm_process};

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::audit::{AuditKind, Auditor};
use crate::platform::{Platform, PlatformError};
use crate::policy::LockdownPolicy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentVerdict {
    pub is_virtual_machine: bool,
    pub has_multiple_monitors: bool,
    /// Displays counted, when enumeration worked.
    pub display_count: Option<usize>,
    /// One line per positive finding.
    pub evidence: Vec<String>,
}

/// Why a session must not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    VirtualMachine,
    MultipleMonitors,
    VirtualMachineAndMultipleMonitors,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VirtualMachine => {
                "the exam cannot run inside a virtual machine; please use a physical computer"
            }
            Self::MultipleMonitors => {
                "more than one display is connected; disconnect extra monitors and try again"
            }
            Self::VirtualMachineAndMultipleMonitors => {
                "the exam cannot run inside a virtual machine or with more than one display connected"
            }
        })
    }
}

impl EnvironmentVerdict {
    /// With `block_virtual_machines` off nothing aborts; with it on, either a
    /// virtual machine or extra displays abort.
    pub fn abort_reason(&self, policy: &LockdownPolicy) -> Option<AbortReason> {
        if !policy.block_virtual_machines {
            return None;
        }
        match (self.is_virtual_machine, self.has_multiple_monitors) {
            (true, true) => Some(AbortReason::VirtualMachineAndMultipleMonitors),
            (true, false) => Some(AbortReason::VirtualMachine),
            (false, true) => Some(AbortReason::MultipleMonitors),
            (false, false) => None,
        }
    }

    pub fn summary(&self) -> String {
        let displays = match self.display_count {
            Some(n) => n.to_string(),
            None => "unknown".to_string(),
        };
        let mut summary = format!(
            "virtual machine: {}, displays: {}",
            if self.is_virtual_machine { "yes" } else { "no" },
            displays
        );
        if !self.evidence.is_empty() {
            summary.push_str(&format!(" ({})", self.evidence.join("; ")));
        }
        summary
    }
}

pub struct EnvironmentValidator {
    platform: Platform,
    auditor: Auditor,
}

impl EnvironmentValidator {
    pub fn new(platform: Platform, auditor: Auditor) -> Self {
        Self { platform, auditor }
    }

    /// Run every check. Virtualization heuristics stop at the first positive.
    pub fn validate(&self) -> EnvironmentVerdict {
        let mut verdict = EnvironmentVerdict::default();

        let heuristics: [(&str, fn(&Self) -> Result<Option<String>, PlatformError>); 4] = [
            ("system identity", Self::check_system_identity),
            ("disk enumeration", Self::check_disk),
            ("hypervisor processes", Self::check_processes),
            ("network adapters", Self::check_mac_addresses),
        ];
        for (name, heuristic) in heuristics {
            match heuristic(self) {
                Ok(Some(evidence)) => {
                    verdict.is_virtual_machine = true;
                    verdict.evidence.push(evidence);
                    break;
                }
                Ok(None) => debug!("VM heuristic '{}': no evidence", name),
                Err(e) => debug!("VM heuristic '{}' unavailable: {}", name, e),
            }
        }

        match self.platform.displays.display_count() {
            Ok(count) => {
                verdict.display_count = Some(count);
                if count > 1 {
                    verdict.has_multiple_monitors = true;
                    verdict.evidence.push(format!("{} displays connected", count));
                }
            }
            Err(e) => debug!("Display enumeration unavailable: {}", e),
        }

        if verdict.is_virtual_machine || verdict.has_multiple_monitors {
            self.auditor
                .warning(AuditKind::EnvironmentVerdict, verdict.summary());
        } else {
            self.auditor
                .info(AuditKind::EnvironmentVerdict, verdict.summary());
        }
        verdict
    }

    fn check_system_identity(&self) -> Result<Option<String>, PlatformError> {
        let (manufacturer, model) = self.platform.probe.system_identity()?;
        debug!("Manufacturer: {}, Model: {}", manufacturer, model);
        Ok(match_vendor(&manufacturer, &model).map(|vendor| {
            format!(
                "hypervisor vendor '{}' in system identity ({} / {})",
                vendor, manufacturer, model
            )
        }))
    }

    fn check_disk(&self) -> Result<Option<String>, PlatformError> {
        let Some(signature) = self.platform.probe.disk_signature()? else {
            return Ok(None);
        };
        Ok(match_disk_signature(&signature)
            .map(|hit| format!("virtual disk signature '{}' ({})", hit, signature)))
    }

    fn check_processes(&self) -> Result<Option<String>, PlatformError> {
        let processes = self.platform.processes.snapshot()?;
        Ok(processes
            .iter()
            .find_map(|p| match_vm_process(&p.name))
            .map(|name| format!("hypervisor tooling process '{}' running", name)))
    }

    fn check_mac_addresses(&self) -> Result<Option<String>, PlatformError> {
        let macs = self.platform.probe.mac_addresses()?;
        Ok(macs.iter().find_map(|mac| {
            match_mac_prefix(mac)
                .map(|vendor| format!("{} network adapter MAC address {}", vendor, mac))
        }))
    }
}
