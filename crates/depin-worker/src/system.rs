//! Host metrics reported in health probe responses.

use std::sync::{Mutex, PoisonError};

use depin_protocol::payload::{CpuMetrics, MemoryMetrics, SystemMetrics};
use sysinfo::System;

pub struct SystemProbe {
    system: Mutex<System>,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    /// CPU usage is measured since the previous snapshot.
    pub fn snapshot(&self) -> SystemMetrics {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_cpu();
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();
        SystemMetrics {
            uptime: System::uptime(),
            cpu: CpuMetrics {
                usage: f64::from(system.global_cpu_info().cpu_usage()),
                cores: system.cpus().len(),
            },
            memory: MemoryMetrics {
                used,
                total,
                percentage: if total == 0 {
                    0.0
                } else {
                    used as f64 / total as f64 * 100.0
                },
            },
        }
    }
}
