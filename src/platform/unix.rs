//! Unix backend: `/proc` process table, sysfs probes, signal-based termination.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use super::unsupported;
use super::{Platform, PlatformError, PlatformResult, ProcessInfo, ProcessTable, SystemProbe};

pub fn platform() -> Platform {
    let fallback = unsupported::shared();
    Platform {
        processes: Arc::new(ProcFs::default()),
        probe: Arc::new(SysFs::default()),
        displays: fallback.clone(),
        hooks: fallback.clone(),
        touchpad: fallback.clone(),
        windows: fallback.clone(),
        power: fallback,
    }
}

pub fn ancestor_pids() -> Vec<u32> {
    let table = ProcFs::default();
    super::ancestor_chain(std::os::unix::process::parent_id(), |pid| table.parent_of(pid))
}

/// Process table read from `/proc`.
pub struct ProcFs {
    root: PathBuf,
    uid: u32,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
            // SAFETY: getuid has no preconditions and cannot fail.
            uid: unsafe { libc::getuid() },
        }
    }
}

impl ProcFs {
    fn read_entry(&self, pid: u32) -> Option<ProcessInfo> {
        let dir = self.root.join(pid.to_string());
        let path = fs::read_link(dir.join("exe")).ok();
        let name = match path.as_deref().and_then(Path::file_name) {
            Some(file) => file.to_string_lossy().into_owned(),
            None => fs::read_to_string(dir.join("comm")).ok()?.trim().to_string(),
        };
        Some(ProcessInfo { pid, name, path })
    }

    /// Fourth field of `/proc/<pid>/stat`; the command name before it may contain spaces.
    fn parent_of(&self, pid: u32) -> Option<u32> {
        let stat = fs::read_to_string(self.root.join(pid.to_string()).join("stat")).ok()?;
        let (_, rest) = stat.rsplit_once(')')?;
        rest.split_whitespace().nth(1)?.parse().ok()
    }

    fn owner_uid(&self, pid: u32) -> Option<u32> {
        let status = fs::read_to_string(self.root.join(pid.to_string()).join("status")).ok()?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("Uid:"))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|uid| uid.parse().ok())
    }
}

impl ProcessTable for ProcFs {
    fn snapshot(&self) -> PlatformResult<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Exited between readdir and read: skip.
            if let Some(info) = self.read_entry(pid) {
                processes.push(info);
            }
        }
        Ok(processes)
    }

    fn terminate(&self, pid: u32) -> PlatformResult<()> {
        let raw = i32::try_from(pid).map_err(|_| PlatformError::ProcessNotFound { pid })?;
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(PlatformError::ProcessNotFound { pid }),
            Err(Errno::EPERM) => Err(PlatformError::AccessDenied(format!(
                "not permitted to signal process {}",
                pid
            ))),
            Err(e) => Err(PlatformError::os("kill", e.desc())),
        }
    }

    fn is_system_process(&self, process: &ProcessInfo) -> bool {
        // Kernel threads have no executable; init must never be touched.
        if process.pid <= 1 || process.path.is_none() {
            return true;
        }
        match self.owner_uid(process.pid) {
            Some(uid) => uid != self.uid,
            None => true,
        }
    }
}

/// DMI and network facts read from sysfs.
pub struct SysFs {
    root: PathBuf,
}

impl Default for SysFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys"),
        }
    }
}

impl SysFs {
    fn read_trimmed(&self, relative: &str) -> PlatformResult<String> {
        Ok(fs::read_to_string(self.root.join(relative))?.trim().to_string())
    }
}

impl SystemProbe for SysFs {
    fn system_identity(&self) -> PlatformResult<(String, String)> {
        let vendor = self.read_trimmed("class/dmi/id/sys_vendor")?;
        let product = self.read_trimmed("class/dmi/id/product_name")?;
        Ok((vendor, product))
    }

    fn disk_signature(&self) -> PlatformResult<Option<String>> {
        let mut descriptors = Vec::new();
        for entry in fs::read_dir(self.root.join("block"))? {
            let Ok(entry) = entry else { continue };
            let device = entry.path().join("device");
            let vendor = fs::read_to_string(device.join("vendor")).unwrap_or_default();
            let model = fs::read_to_string(device.join("model")).unwrap_or_default();
            let descriptor = format!("{} {}", vendor.trim(), model.trim());
            if !descriptor.trim().is_empty() {
                descriptors.push(descriptor.trim().to_string());
            }
        }
        if descriptors.is_empty() {
            Ok(None)
        } else {
            Ok(Some(descriptors.join("; ")))
        }
    }

    fn mac_addresses(&self) -> PlatformResult<Vec<String>> {
        let mut macs = Vec::new();
        for entry in fs::read_dir(self.root.join("class/net"))? {
            let Ok(entry) = entry else { continue };
            if entry.file_name() == "lo" {
                continue;
            }
            if let Ok(address) = fs::read_to_string(entry.path().join("address")) {
                macs.push(address.trim().to_string());
            }
        }
        Ok(macs)
    }
}
