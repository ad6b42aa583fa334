use windows::Win32::Foundation::{ERROR_BUFFER_OVERFLOW, ERROR_SUCCESS};
use windows::Win32::NetworkManagement::IpHelper::{
    GAA_FLAG_SKIP_ANYCAST, GAA_FLAG_SKIP_DNS_SERVER, GAA_FLAG_SKIP_MULTICAST, GetAdaptersAddresses,
    IP_ADAPTER_ADDRESSES_LH,
};
use windows::Win32::Networking::WinSock::AF_UNSPEC;
use windows::Win32::System::Registry::HKEY_LOCAL_MACHINE;
use windows::Win32::UI::WindowsAndMessaging::{GetSystemMetrics, SM_CMONITORS};

use super::registry;
use crate::platform::{DisplayProbe, PlatformError, PlatformResult, SystemProbe};

const BIOS_KEY: &str = r"HARDWARE\DESCRIPTION\System\BIOS";
const DISK_ENUM_KEY: &str = r"SYSTEM\CurrentControlSet\Services\Disk\Enum";

/// Firmware identity from the registry, adapters from IP Helper.
pub struct Win32Probe;

impl SystemProbe for Win32Probe {
    fn system_identity(&self) -> PlatformResult<(String, String)> {
        let manufacturer =
            registry::get_string(HKEY_LOCAL_MACHINE, BIOS_KEY, "SystemManufacturer")?
                .unwrap_or_default();
        let model = registry::get_string(HKEY_LOCAL_MACHINE, BIOS_KEY, "SystemProductName")?
            .unwrap_or_default();
        Ok((manufacturer, model))
    }

    fn disk_signature(&self) -> PlatformResult<Option<String>> {
        registry::get_string(HKEY_LOCAL_MACHINE, DISK_ENUM_KEY, "0")
    }

    fn mac_addresses(&self) -> PlatformResult<Vec<String>> {
        let flags = GAA_FLAG_SKIP_ANYCAST | GAA_FLAG_SKIP_MULTICAST | GAA_FLAG_SKIP_DNS_SERVER;
        let mut size: u32 = 16 * 1024;
        let mut buffer: Vec<u64>;
        loop {
            // u64 elements keep the adapter structs aligned.
            buffer = vec![0u64; (size as usize).div_ceil(8)];
            // SAFETY: `size` is the byte length of `buffer`.
            let status = unsafe {
                GetAdaptersAddresses(
                    AF_UNSPEC.0 as u32,
                    flags,
                    None,
                    Some(buffer.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH),
                    &mut size,
                )
            };
            if status == ERROR_BUFFER_OVERFLOW.0 {
                continue;
            }
            if status != ERROR_SUCCESS.0 {
                return Err(PlatformError::os(
                    "GetAdaptersAddresses",
                    format!("status={}", status),
                ));
            }
            break;
        }

        let mut macs = Vec::new();
        let mut cursor = buffer.as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;
        while !cursor.is_null() {
            // SAFETY: the list lives inside `buffer` and is null-terminated.
            let adapter = unsafe { &*cursor };
            let len = (adapter.PhysicalAddressLength as usize).min(adapter.PhysicalAddress.len());
            if len > 0 {
                let mac = adapter.PhysicalAddress[..len]
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect::<Vec<_>>()
                    .join("-");
                macs.push(mac);
            }
            cursor = adapter.Next;
        }
        Ok(macs)
    }
}

impl DisplayProbe for Win32Probe {
    fn display_count(&self) -> PlatformResult<usize> {
        // SAFETY: no preconditions.
        let count = unsafe { GetSystemMetrics(SM_CMONITORS) };
        usize::try_from(count)
            .map_err(|_| PlatformError::os("GetSystemMetrics", format!("returned {}", count)))
    }
}
