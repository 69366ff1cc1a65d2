use serde::{Deserialize, Serialize};

/// `ADDR_NO_RANDOMIZE`
pub const PERSONALITY_ADDR_NO_RANDOMIZE: u64 = 0x0040000;

/// KB added on top of the memory limit for the address-space rlimit
pub const DEFAULT_ADDRESS_GRACE: u64 = 65536;

/// Resource limits applied to one traced process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchLimits {
    /// CPU seconds; the rlimit is rounded up and given one second of slack
    pub time: f64,
    /// Wall-clock seconds before the watchdog kills the process group
    pub wall_time: f64,
    /// Memory limit in KB, `None` for no address-space limit
    pub memory: Option<u64>,
    pub address_grace: u64,
    /// Largest file the process may write, in bytes
    pub fsize: Option<u64>,
    pub nproc: Option<u64>,
    pub personality: u64,
    pub cpu_affinity: Option<Vec<usize>>,
    pub stdout_limit: usize,
    pub stderr_limit: usize,
    pub kill_on_output_limit: bool,
}

impl Default for LaunchLimits {
    fn default() -> Self {
        Self {
            time: 1.0,
            wall_time: 3.0,
            memory: None,
            address_grace: DEFAULT_ADDRESS_GRACE,
            fsize: None,
            nproc: None,
            personality: PERSONALITY_ADDR_NO_RANDOMIZE,
            cpu_affinity: None,
            stdout_limit: 64 * 1024 * 1024,
            stderr_limit: 64 * 1024,
            kill_on_output_limit: false,
        }
    }
}

impl LaunchLimits {
    pub fn with_time(mut self, time: f64, wall_time: f64) -> Self {
        self.time = time;
        self.wall_time = wall_time;
        self
    }

    pub fn with_memory(mut self, memory_kb: u64) -> Self {
        self.memory = Some(memory_kb);
        self
    }

    pub fn with_output_limits(mut self, stdout: usize, stderr: usize) -> Self {
        self.stdout_limit = stdout;
        self.stderr_limit = stderr;
        self
    }

    /// (soft, hard) RLIMIT_CPU in whole seconds
    pub fn cpu_rlimit(&self) -> (u64, u64) {
        let soft = self.time.max(0.0).ceil().max(1.0) as u64;
        (soft, soft + 1)
    }

    /// RLIMIT_AS in bytes
    pub fn address_space_rlimit(&self) -> Option<u64> {
        self.memory
            .map(|memory| memory.saturating_add(self.address_grace).saturating_mul(1024))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_rlimit_rounds_up_with_slack() {
        let limits = LaunchLimits::default().with_time(2.2, 6.6);
        assert_eq!(limits.cpu_rlimit(), (3, 4));
        let limits = LaunchLimits::default().with_time(0.1, 1.0);
        assert_eq!(limits.cpu_rlimit(), (1, 2));
    }

    #[test]
    fn test_address_space_includes_grace() {
        let limits = LaunchLimits::default().with_memory(65536);
        assert_eq!(limits.address_space_rlimit(), Some((65536 + 65536) * 1024));
        assert_eq!(LaunchLimits::default().address_space_rlimit(), None);
    }
}
