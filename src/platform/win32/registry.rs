//! Thin wrappers over the key-path registry calls.

use std::ffi::c_void;

use windows::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND, ERROR_SUCCESS, WIN32_ERROR,
};
use windows::Win32::System::Registry::{
    HKEY, REG_DWORD, REG_SZ, REG_VALUE_TYPE, RRF_RT_REG_DWORD, RRF_RT_REG_SZ, RegDeleteKeyValueW,
    RegGetValueW, RegSetKeyValueW,
};
use windows::core::PCWSTR;

use super::to_wide;
use crate::platform::{PlatformError, PlatformResult};

fn is_missing(status: WIN32_ERROR) -> bool {
    status == ERROR_FILE_NOT_FOUND || status == ERROR_PATH_NOT_FOUND
}

fn map_status(call: &'static str, status: WIN32_ERROR, path: &str, name: &str) -> PlatformError {
    if status == ERROR_ACCESS_DENIED {
        return PlatformError::AccessDenied(format!("{}\\{}", path, name));
    }
    PlatformError::os(call, format!("{}\\{}: status={}", path, name, status.0))
}

/// Read a `REG_SZ` value. `None` when the key or value does not exist.
pub fn get_string(root: HKEY, path: &str, name: &str) -> PlatformResult<Option<String>> {
    let wide_path = to_wide(path);
    let wide_name = to_wide(name);
    let mut value_type = REG_VALUE_TYPE(0);
    let mut size_bytes: u32 = 0;
    // SAFETY: both strings outlive the call; a null buffer only queries the size.
    let status = unsafe {
        RegGetValueW(
            root,
            PCWSTR(wide_path.as_ptr()),
            PCWSTR(wide_name.as_ptr()),
            RRF_RT_REG_SZ,
            Some(&mut value_type),
            None,
            Some(&mut size_bytes),
        )
    };
    if is_missing(status) {
        return Ok(None);
    }
    if status != ERROR_SUCCESS {
        return Err(map_status("RegGetValueW", status, path, name));
    }

    let mut buffer: Vec<u16> = vec![0u16; (size_bytes as usize / 2).max(1)];
    // SAFETY: buffer holds `size_bytes` bytes.
    let status = unsafe {
        RegGetValueW(
            root,
            PCWSTR(wide_path.as_ptr()),
            PCWSTR(wide_name.as_ptr()),
            RRF_RT_REG_SZ,
            Some(&mut value_type),
            Some(buffer.as_mut_ptr() as *mut c_void),
            Some(&mut size_bytes),
        )
    };
    if is_missing(status) {
        return Ok(None);
    }
    if status != ERROR_SUCCESS {
        return Err(map_status("RegGetValueW", status, path, name));
    }
    // Size includes the terminating null.
    buffer.truncate((size_bytes as usize / 2).saturating_sub(1));
    Ok(Some(String::from_utf16_lossy(&buffer)))
}

pub fn get_dword(root: HKEY, path: &str, name: &str) -> PlatformResult<Option<u32>> {
    let wide_path = to_wide(path);
    let wide_name = to_wide(name);
    let mut value: u32 = 0;
    let mut size_bytes = std::mem::size_of::<u32>() as u32;
    // SAFETY: `value` is a u32 and `size_bytes` says so.
    let status = unsafe {
        RegGetValueW(
            root,
            PCWSTR(wide_path.as_ptr()),
            PCWSTR(wide_name.as_ptr()),
            RRF_RT_REG_DWORD,
            None,
            Some(&mut value as *mut u32 as *mut c_void),
            Some(&mut size_bytes),
        )
    };
    if is_missing(status) {
        return Ok(None);
    }
    if status != ERROR_SUCCESS {
        return Err(map_status("RegGetValueW", status, path, name));
    }
    Ok(Some(value))
}

/// Write a `REG_SZ` value, creating the key if needed.
pub fn set_string(root: HKEY, path: &str, name: &str, value: &str) -> PlatformResult<()> {
    let wide_path = to_wide(path);
    let wide_name = to_wide(name);
    let data = to_wide(value);
    // SAFETY: `data` is `data.len() * 2` bytes of UTF-16 including the null.
    let status = unsafe {
        RegSetKeyValueW(
            root,
            PCWSTR(wide_path.as_ptr()),
            PCWSTR(wide_name.as_ptr()),
            REG_SZ.0,
            Some(data.as_ptr() as *const c_void),
            (data.len() * 2) as u32,
        )
    };
    if status != ERROR_SUCCESS {
        return Err(map_status("RegSetKeyValueW", status, path, name));
    }
    Ok(())
}

pub fn set_dword(root: HKEY, path: &str, name: &str, value: u32) -> PlatformResult<()> {
    let wide_path = to_wide(path);
    let wide_name = to_wide(name);
    // SAFETY: four bytes from a live u32.
    let status = unsafe {
        RegSetKeyValueW(
            root,
            PCWSTR(wide_path.as_ptr()),
            PCWSTR(wide_name.as_ptr()),
            REG_DWORD.0,
            Some(&value as *const u32 as *const c_void),
            std::mem::size_of::<u32>() as u32,
        )
    };
    if status != ERROR_SUCCESS {
        return Err(map_status("RegSetKeyValueW", status, path, name));
    }
    Ok(())
}

/// Remove a value. Missing values are not an error.
pub fn delete_value(root: HKEY, path: &str, name: &str) -> PlatformResult<()> {
    let wide_path = to_wide(path);
    let wide_name = to_wide(name);
    // SAFETY: both strings outlive the call.
    let status = unsafe {
        RegDeleteKeyValueW(
            root,
            PCWSTR(wide_path.as_ptr()),
            PCWSTR(wide_name.as_ptr()),
        )
    };
    if status == ERROR_SUCCESS || is_missing(status) {
        return Ok(());
    }
    Err(map_status("RegDeleteKeyValueW", status, path, name))
}
