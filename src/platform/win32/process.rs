//! Toolhelp snapshots and `TerminateProcess`.

use std::collections::HashMap;
use std::path::PathBuf;

use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER, HANDLE, WIN32_ERROR,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, PROCESSENTRY32W, Process32FirstW, Process32NextW, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::RemoteDesktop::ProcessIdToSessionId;
use windows::Win32::System::Threading::{
    OpenProcess, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE,
    QueryFullProcessImageNameW, TerminateProcess,
};
use windows::core::PWSTR;

use crate::platform::{PlatformError, PlatformResult, ProcessInfo, ProcessTable};

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned open by the OS and is closed once.
        let _ = unsafe { CloseHandle(self.0) };
    }
}

fn win32_code(err: &windows::core::Error) -> WIN32_ERROR {
    WIN32_ERROR::from_error(err).unwrap_or_default()
}

fn image_path(pid: u32) -> Option<PathBuf> {
    // SAFETY: plain query; failure is returned, not raised.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) }.ok()?;
    let handle = OwnedHandle(handle);
    let mut buffer = vec![0u16; 1024];
    loop {
        let mut size = buffer.len() as u32;
        // SAFETY: `size` is the buffer's capacity in characters.
        let result = unsafe {
            QueryFullProcessImageNameW(
                handle.0,
                PROCESS_NAME_WIN32,
                PWSTR(buffer.as_mut_ptr()),
                &mut size,
            )
        };
        match result {
            Ok(()) => {
                return Some(PathBuf::from(String::from_utf16_lossy(
                    &buffer[..size as usize],
                )));
            }
            Err(_) if buffer.len() < 32 * 1024 => buffer.resize(buffer.len() * 2, 0),
            Err(_) => return None,
        }
    }
}

fn entry_name(entry: &PROCESSENTRY32W) -> String {
    let len = entry
        .szExeFile
        .iter()
        .position(|c| *c == 0)
        .unwrap_or(entry.szExeFile.len());
    String::from_utf16_lossy(&entry.szExeFile[..len])
}

/// Visit every Toolhelp process entry.
fn for_each_entry(mut visit: impl FnMut(&PROCESSENTRY32W)) -> PlatformResult<()> {
    // SAFETY: no preconditions; the handle is owned below.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map_err(|e| PlatformError::os("CreateToolhelp32Snapshot", e.message()))?;
    let snapshot = OwnedHandle(snapshot);

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    // SAFETY: `entry.dwSize` is initialized as the API requires.
    let mut more = unsafe { Process32FirstW(snapshot.0, &mut entry) }.is_ok();
    while more {
        visit(&entry);
        // SAFETY: same entry, same snapshot.
        more = unsafe { Process32NextW(snapshot.0, &mut entry) }.is_ok();
    }
    Ok(())
}

/// Parent chain from `th32ParentProcessID`, stopping below the System process.
pub fn ancestor_pids() -> Vec<u32> {
    let mut parents = HashMap::new();
    if for_each_entry(|entry| {
        parents.insert(entry.th32ProcessID, entry.th32ParentProcessID);
    })
    .is_err()
    {
        return Vec::new();
    }
    let Some(&first) = parents.get(&std::process::id()) else {
        return Vec::new();
    };
    crate::platform::ancestor_chain(first, |pid| {
        parents.get(&pid).copied().filter(|parent| *parent > 4)
    })
}

/// Process table read with `CreateToolhelp32Snapshot`.
pub struct Toolhelp;

impl ProcessTable for Toolhelp {
    fn snapshot(&self) -> PlatformResult<Vec<ProcessInfo>> {
        let mut processes = Vec::new();
        for_each_entry(|entry| {
            let pid = entry.th32ProcessID;
            processes.push(ProcessInfo {
                pid,
                name: entry_name(entry),
                path: image_path(pid),
            });
        })?;
        Ok(processes)
    }

    fn terminate(&self, pid: u32) -> PlatformResult<()> {
        // SAFETY: failure is returned as an error value.
        let handle = match unsafe { OpenProcess(PROCESS_TERMINATE, false, pid) } {
            Ok(handle) => OwnedHandle(handle),
            Err(e) if win32_code(&e) == ERROR_INVALID_PARAMETER => {
                return Err(PlatformError::ProcessNotFound { pid });
            }
            Err(e) if win32_code(&e) == ERROR_ACCESS_DENIED => {
                return Err(PlatformError::AccessDenied(format!(
                    "cannot open process {} for termination",
                    pid
                )));
            }
            Err(e) => return Err(PlatformError::os("OpenProcess", e.message())),
        };
        // SAFETY: the handle carries PROCESS_TERMINATE.
        unsafe { TerminateProcess(handle.0, 1) }.map_err(|e| {
            if win32_code(&e) == ERROR_ACCESS_DENIED {
                PlatformError::AccessDenied(format!("cannot terminate process {}", pid))
            } else {
                PlatformError::os("TerminateProcess", e.message())
            }
        })
    }

    /// Session 0 hosts services and the kernel; processes whose image cannot be
    /// queried belong to another security context.
    fn is_system_process(&self, process: &ProcessInfo) -> bool {
        if process.pid <= 4 || process.path.is_none() {
            return true;
        }
        let mut session = 0u32;
        // SAFETY: writes one u32.
        match unsafe { ProcessIdToSessionId(process.pid, &mut session) } {
            Ok(()) => session == 0,
            Err(_) => true,
        }
    }
}
