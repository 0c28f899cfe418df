// src/utils/system.rs: System functions

use anyhow::{anyhow, Result};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const GIB: u64 = 1_073_741_824;

/// Finds the amount of total and available RAM, keyed to OS
///
/// # Returns
///
/// Result<(u64, u64)> total ram, available ram in bytes
pub fn detect_ram() -> Result<(u64, u64)> {
    let (total_ram, available_ram) = if cfg!(target_os = "macos") {
        let refresh_kind = RefreshKind::nothing().with_memory(MemoryRefreshKind::everything());
        let mut system = System::new_with_specifics(refresh_kind);
        system.refresh_memory_specifics(MemoryRefreshKind::everything());
        let total = system.total_memory();
        let used = system.used_memory();
        (total, total.saturating_sub(used))
    } else {
        let mut system = System::new_with_specifics(RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()));
        system.refresh_memory();
        (system.total_memory(), system.available_memory())
    };

    if total_ram == 0 || available_ram == 0 {
        return Err(anyhow!("Failed to detect valid RAM values"));
    }

    Ok((total_ram, available_ram))
}

/// Host limits used as default caps on per-task reservations.
///
/// # Returns
///
/// (logical cpus, total memory in GB)
pub fn detect_host_resources() -> Result<(usize, u64)> {
    let cpus = num_cpus::get().max(1);
    let (total_ram, _) = detect_ram()?;
    Ok((cpus, (total_ram / GIB).max(1)))
}
