//! Master performance monitoring.
//!
//! Every protocol instance orders the same traffic, so the ordering
//! throughput of the backups is a baseline for what the master
//! should achieve. A master falling well below that baseline is
//! degraded: its primary may be slow, overloaded, or silently
//! censoring requests, and the node votes for a view change.

use crate::bft::registry::InstanceId;

/// Observes the ordering throughput of every protocol instance.
pub struct Monitor {
    // requests ordered per instance since the last reset
    ordered: Vec<u64>,
    batches: Vec<u64>,
    warmup_batches: u64,
    threshold: f64,
}

impl Monitor {
    /// Creates a monitor over `instances` protocol instances.
    pub fn new(instances: usize, warmup_batches: u64, threshold: f64) -> Self {
        Self {
            ordered: vec![0; instances],
            batches: vec![0; instances],
            warmup_batches,
            threshold,
        }
    }

    /// Grows or shrinks the set of observed instances, resetting the
    /// measurement window.
    pub fn resize(&mut self, instances: usize) {
        self.ordered = vec![0; instances];
        self.batches = vec![0; instances];
    }

    /// Records a batch of `requests` ordered on `instance`.
    pub fn batch_ordered(&mut self, instance: InstanceId, requests: u64) {
        let idx = usize::from(instance);
        if let Some(count) = self.ordered.get_mut(idx) {
            *count += requests;
            self.batches[idx] += 1;
        }
    }

    /// Whether the master instance has fallen behind the backups.
    ///
    /// The verdict is withheld until the backups have ordered enough
    /// batches for their average to mean something.
    pub fn is_master_degraded(&self) -> bool {
        if self.ordered.len() < 2 {
            return false;
        }
        let backup_batches: u64 = self.batches[1..].iter().sum();
        if backup_batches < self.warmup_batches {
            return false;
        }
        let master = self.ordered[0] as f64;
        let backups = self.ordered[1..].iter().sum::<u64>() as f64
            / (self.ordered.len() - 1) as f64;
        master < self.threshold * backups
    }

    /// Throughput counter of one instance, for diagnostics.
    pub fn ordered_requests(&self, instance: InstanceId) -> u64 {
        self.ordered.get(usize::from(instance)).copied().unwrap_or(0)
    }

    /// Starts a fresh measurement window, e.g. after a view change.
    pub fn reset(&mut self) {
        for count in &mut self.ordered {
            *count = 0;
        }
        for count in &mut self.batches {
            *count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: InstanceId = InstanceId::MASTER;

    fn backup() -> InstanceId {
        InstanceId::from(1)
    }

    #[test]
    fn no_verdict_during_warmup() {
        let mut monitor = Monitor::new(2, 10, 0.5);
        for _ in 0..5 {
            monitor.batch_ordered(backup(), 10);
        }
        assert!(!monitor.is_master_degraded());
    }

    #[test]
    fn lagging_master_is_degraded() {
        let mut monitor = Monitor::new(2, 10, 0.5);
        for _ in 0..20 {
            monitor.batch_ordered(backup(), 10);
        }
        monitor.batch_ordered(MASTER, 10);
        assert!(monitor.is_master_degraded());

        // catching up clears the verdict
        for _ in 0..20 {
            monitor.batch_ordered(MASTER, 10);
        }
        assert!(!monitor.is_master_degraded());
    }

    #[test]
    fn reset_opens_a_new_window() {
        let mut monitor = Monitor::new(2, 10, 0.5);
        for _ in 0..20 {
            monitor.batch_ordered(backup(), 10);
        }
        monitor.reset();
        assert!(!monitor.is_master_degraded());
        assert_eq!(monitor.ordered_requests(backup()), 0);
    }
}
