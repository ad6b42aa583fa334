//! Known hypervisor fingerprints.

use crate::policy::normalize_process_name;

/// Manufacturer/model substrings reported by hypervisor firmware.
const VM_VENDORS: &[&str] = &[
    "vmware",
    "virtualbox",
    "innotek",
    "kvm",
    "xen",
    "qemu",
    "parallels",
    "bochs",
];

/// Disk enumeration substrings of virtual disk controllers.
const VM_DISK_SIGNATURES: &[&str] = &["vmware", "vbox", "virtual", "qemu"];

/// Guest-tools daemons.
const VM_PROCESSES: &[&str] = &[
    "vmtoolsd",
    "vmwaretray",
    "vmwareuser",
    "vboxservice",
    "vboxtray",
    "qemu-ga",
    "prl_tools",
    "xenservice",
    "vmsrvc",
    "vmusrvc",
];

/// OUI blocks assigned to virtual NICs, as six hex digits.
const VM_MAC_PREFIXES: &[(&str, &str)] = &[
    ("000C29", "VMware"),
    ("005056", "VMware"),
    ("001C14", "VMware"),
    ("000569", "VMware"),
    ("080027", "VirtualBox"),
    ("525400", "QEMU/KVM"),
    ("00163E", "Xen"),
    ("001C42", "Parallels"),
];

/// Matching vendor token for a manufacturer/model pair.
///
/// Hyper-V guests report "Microsoft Corporation" / "Virtual Machine"; the vendor
/// alone also covers Surface hardware, so it only counts together with the model.
pub fn match_vendor(manufacturer: &str, model: &str) -> Option<&'static str> {
    let manufacturer = manufacturer.to_lowercase();
    let model = model.to_lowercase();
    if let Some(vendor) = VM_VENDORS
        .iter()
        .find(|v| manufacturer.contains(**v) || model.contains(**v))
    {
        return Some(*vendor);
    }
    if manufacturer.contains("microsoft corporation") && model.contains("virtual") {
        return Some("hyper-v");
    }
    None
}

pub fn match_disk_signature(signature: &str) -> Option<&'static str> {
    let signature = signature.to_lowercase();
    VM_DISK_SIGNATURES
        .iter()
        .find(|s| signature.contains(**s))
        .copied()
}

pub fn match_vm_process(name: &str) -> Option<&'static str> {
    let name = normalize_process_name(name);
    VM_PROCESSES.iter().find(|p| **p == name).copied()
}

/// Hypervisor owning the MAC's OUI. Separators and case are ignored.
pub fn match_mac_prefix(mac: &str) -> Option<&'static str> {
    let digits: String = mac
        .chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if digits.len() < 6 {
        return None;
    }
    VM_MAC_PREFIXES
        .iter()
        .find(|(oui, _)| digits.starts_with(oui))
        .map(|(_, vendor)| *vendor)
}
