//! Host counter access.
//!
//! The aggregator never talks to the OS directly; it goes through
//! [`HostProbe`] so the syscall surface stays swappable in tests and on
//! hosts where individual counters are unavailable.

use sysinfo::{Pid, System};

/// Static identity of a process, looked up best-effort once per row.
#[derive(Debug, Clone)]
pub struct ProcessIdentity {
    pub name: String,
    pub cmdline: Option<String>,
}

/// Read access to host and per-process OS counters.
///
/// Every method is fallible by returning `None`; the aggregator degrades
/// to a zeroed metric plus an unavailability flag instead of failing the
/// tick.
pub trait HostProbe: Send {
    /// Whole-host CPU utilization in percent across all cores, [0, 100].
    fn cpu_total_pct(&mut self) -> Option<f64>;

    /// Whole-host physical memory utilization in percent, [0, 100].
    fn ram_used_pct(&mut self) -> Option<f64>;

    /// A process's working set as a share of physical memory, [0, 100].
    fn working_set_pct(&mut self, pid: u32) -> Option<f64>;

    /// Best-effort process name and command line.
    fn identity(&mut self, pid: u32) -> Option<ProcessIdentity>;

    /// Number of logical cores.
    fn num_cores(&self) -> usize;
}

/// [`HostProbe`] backed by `sysinfo`.
pub struct SystemProbe {
    sys: System,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        Self { sys }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe for SystemProbe {
    fn cpu_total_pct(&mut self) -> Option<f64> {
        self.sys.refresh_cpu();
        let pct = f64::from(self.sys.global_cpu_info().cpu_usage());
        pct.is_finite().then(|| pct.clamp(0.0, 100.0))
    }

    fn ram_used_pct(&mut self) -> Option<f64> {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        if total == 0 {
            return None;
        }
        Some((self.sys.used_memory() as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }

    fn working_set_pct(&mut self, pid: u32) -> Option<f64> {
        let total = self.sys.total_memory();
        if total == 0 {
            return None;
        }

        let pid = Pid::from_u32(pid);
        if !self.sys.refresh_process(pid) {
            return None;
        }
        let process = self.sys.process(pid)?;
        Some((process.memory() as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }

    fn identity(&mut self, pid: u32) -> Option<ProcessIdentity> {
        let pid = Pid::from_u32(pid);
        self.sys.refresh_process(pid);
        let process = self.sys.process(pid)?;

        let cmdline = if process.cmd().is_empty() {
            None
        } else {
            Some(process.cmd().join(" "))
        };

        Some(ProcessIdentity {
            name: process.name().to_string(),
            cmdline,
        })
    }

    fn num_cores(&self) -> usize {
        self.sys.cpus().len().max(1)
    }
}

/// Scripted probe for tests: plays back fixed host series and per-pid
/// working sets.
#[cfg(test)]
pub struct ScriptedProbe {
    pub cpu: std::collections::VecDeque<f64>,
    pub ram: std::collections::VecDeque<f64>,
    pub working_sets: std::collections::HashMap<u32, f64>,
    pub cores: usize,
    pub ram_available: bool,
}

#[cfg(test)]
impl ScriptedProbe {
    pub fn flat(cpu: f64, ram: f64, cores: usize) -> Self {
        Self {
            cpu: std::iter::repeat(cpu).take(4096).collect(),
            ram: std::iter::repeat(ram).take(4096).collect(),
            working_sets: std::collections::HashMap::new(),
            cores,
            ram_available: true,
        }
    }
}

#[cfg(test)]
impl HostProbe for ScriptedProbe {
    fn cpu_total_pct(&mut self) -> Option<f64> {
        self.cpu.pop_front()
    }

    fn ram_used_pct(&mut self) -> Option<f64> {
        self.ram.pop_front()
    }

    fn working_set_pct(&mut self, pid: u32) -> Option<f64> {
        if !self.ram_available {
            return None;
        }
        self.working_sets.get(&pid).copied()
    }

    fn identity(&mut self, pid: u32) -> Option<ProcessIdentity> {
        Some(ProcessIdentity {
            name: format!("proc-{pid}"),
            cmdline: Some(format!("proc-{pid} --run")),
        })
    }

    fn num_cores(&self) -> usize {
        self.cores
    }
}
