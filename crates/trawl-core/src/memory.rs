//! Process memory sampling used for backpressure and adaptive scheduling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Reports how much memory the current process is using.
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> u64;
}

/// Resident memory of the current process, read through `sysinfo`.
pub struct ProcessMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| tracing::warn!(error = %e, "Cannot determine current pid"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Memory limit above which producers pause instead of fetching more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureConfig {
    /// `None` disables backpressure.
    pub memory_threshold_bytes: Option<u64>,
    /// How often a suspended producer re-samples memory.
    pub poll_interval: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            memory_threshold_bytes: None,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl BackpressureConfig {
    pub fn with_threshold(mut self, bytes: u64) -> Self {
        self.memory_threshold_bytes = Some(bytes);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_over(&self, probe: &dyn MemoryProbe) -> bool {
        match self.memory_threshold_bytes {
            Some(limit) => probe.used_bytes() > limit,
            None => false,
        }
    }

    /// Suspend until sampled memory is back under the threshold.
    /// Returns how many times the caller had to wait.
    pub async fn wait_for_headroom(&self, probe: &Arc<dyn MemoryProbe>) -> u32 {
        let mut waits = 0;
        while self.is_over(probe.as_ref()) {
            if waits == 0 {
                tracing::debug!(
                    threshold = ?self.memory_threshold_bytes,
                    "Memory above threshold, applying backpressure"
                );
            }
            waits += 1;
            tokio::time::sleep(self.poll_interval).await;
        }
        waits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedMemoryProbe;

    #[test]
    fn process_probe_reports_nonzero_usage() {
        let probe = ProcessMemoryProbe::new();
        assert!(probe.used_bytes() > 0);
    }

    #[test]
    fn disabled_backpressure_is_never_over() {
        let probe = ScriptedMemoryProbe::constant(u64::MAX);
        assert!(!BackpressureConfig::default().is_over(&probe));
    }

    #[tokio::test]
    async fn waits_until_memory_drops() {
        let probe: Arc<dyn MemoryProbe> =
            Arc::new(ScriptedMemoryProbe::new(vec![500, 400, 300, 50], 50));
        let config = BackpressureConfig::default()
            .with_threshold(100)
            .with_poll_interval(Duration::from_millis(1));

        assert_eq!(config.wait_for_headroom(&probe).await, 3);
    }
}
