// Memory usage snapshot for training and inference reports

use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::System;

const BYTES_PER_GB: f64 = 1_073_741_824.0;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn gb(bytes: u64) -> f64 {
    round2(bytes as f64 / BYTES_PER_GB)
}

/// Memory figures in GB, rounded to two decimals
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Resident memory of this process (model weights, activations)
    pub allocated_gb: f64,
    /// Memory in use system-wide
    pub used_gb: f64,
    pub total_gb: f64,
    pub free_gb: f64,
}

impl MemoryUsage {
    pub fn current() -> Self {
        let mut system = System::new_all();
        system.refresh_all();

        let process = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| system.process(pid))
            .map(|p| p.memory())
            .unwrap_or(0);

        Self::from_bytes(
            process,
            system.used_memory(),
            system.total_memory(),
            system.available_memory(),
        )
    }

    pub fn from_bytes(process: u64, used: u64, total: u64, available: u64) -> Self {
        Self {
            allocated_gb: gb(process),
            used_gb: gb(used),
            total_gb: gb(total),
            free_gb: gb(available),
        }
    }

    /// Whether this process uses more than `limit_gb`
    pub fn exceeds(&self, limit_gb: f64) -> bool {
        self.allocated_gb > limit_gb
    }
}

impl fmt::Display for MemoryUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory:")?;
        writeln!(f, "  Allocated: {:.2} GB", self.allocated_gb)?;
        writeln!(f, "  Used: {:.2} GB", self.used_gb)?;
        writeln!(f, "  Total: {:.2} GB", self.total_gb)?;
        write!(f, "  Free: {:.2} GB", self.free_gb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_rounds_to_two_decimals() {
        let usage = MemoryUsage::from_bytes(1_610_612_736, 4_294_967_296, 17_179_869_184, 1_000_000_000);
        assert_eq!(usage.allocated_gb, 1.5);
        assert_eq!(usage.used_gb, 4.0);
        assert_eq!(usage.total_gb, 16.0);
        assert_eq!(usage.free_gb, 0.93);
        assert!(usage.exceeds(1.0));
        assert!(!usage.exceeds(7.5));
    }

    #[test]
    fn test_current_reports_total_memory() {
        let usage = MemoryUsage::current();
        assert!(usage.total_gb > 0.0);
    }
}
