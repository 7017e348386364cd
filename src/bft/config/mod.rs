//! Tunable parameters of the ordering pool.
//!
//! All time values are measured in milliseconds on the same clock the
//! embedding process feeds into `Node::prod()`, so a deterministic
//! test harness can drive the pool with a virtual clock.

/// Represents the configuration of a validator node.
///
/// Every timeout of the view change and catch-up sub-protocols is
/// exposed here, so deployments can trade liveness detection speed
/// against tolerance of slow links.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of client requests proposed in one batch.
    pub max_batch_size: usize,
    /// How long the primary waits for a batch to fill up before
    /// proposing a smaller one.
    pub max_batch_wait: u64,
    /// Number of ordered batches between two checkpoints.
    pub chk_freq: u64,
    /// Size of the watermark window; the high watermark is always
    /// `h + log_size`.
    pub log_size: u64,
    /// Maximum drift tolerated between the primary's batch timestamp
    /// and the local clock.
    pub acceptable_deviation: u64,
    /// Number of future checkpoints with a stability quorum that may
    /// pile up before the node concludes it is lagging and starts
    /// catching up.
    pub stashed_checkpoints_before_catchup: usize,
    /// How long a view change may run before the node votes to move
    /// past the proposed view as well.
    pub view_change_timeout: u64,
    /// Grace period after startup before the first view change may be
    /// proposed over a missing primary.
    pub initial_propose_view_change_timeout: u64,
    /// How long a disconnected master primary is tolerated before an
    /// instance change vote is cast.
    pub tolerate_primary_disconnection: u64,
    /// Lower bound on the time between two catch-up rounds performed
    /// while a view change is in progress.
    pub min_catchup_timeout_during_view_change: u64,
    /// Interval of the master performance sweep.
    pub perf_check_interval: u64,
    /// Interval of the out-of-order commit rescan.
    pub out_of_order_scan_interval: u64,
    /// Window of the instance change throttler; votes ratchet apart
    /// until their spacing reaches this peak.
    pub instance_change_window: u64,
    /// Number of transactions requested in one catch-up chunk.
    pub catchup_chunk_size: usize,
    /// Base timeout of one catch-up round; doubles on every barren
    /// round.
    pub catchup_round_timeout: u64,
    /// Master throughput below this fraction of the average backup
    /// throughput marks the master as degraded.
    pub degradation_threshold: f64,
    /// Number of ordered batches the monitor observes before it
    /// starts judging the master.
    pub monitor_warmup_batches: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_wait: 1_000,
            chk_freq: 100,
            log_size: 300,
            acceptable_deviation: 60_000,
            stashed_checkpoints_before_catchup: 4,
            view_change_timeout: 60_000,
            initial_propose_view_change_timeout: 60_000,
            tolerate_primary_disconnection: 2_000,
            min_catchup_timeout_during_view_change: 15_000,
            perf_check_interval: 10_000,
            out_of_order_scan_interval: 1_000,
            instance_change_window: 15_000,
            catchup_chunk_size: 20,
            catchup_round_timeout: 5_000,
            degradation_threshold: 0.4,
            monitor_warmup_batches: 10,
        }
    }
}

impl PoolConfig {
    /// The high watermark matching a low watermark of `h`.
    pub fn high_watermark(&self, h: u64) -> u64 {
        h + self.log_size
    }

    /// End of the checkpoint interval a sequence number falls in.
    ///
    /// Intervals are aligned to multiples of `chk_freq`, so e.g. with
    /// a frequency of 100 the sequence number 101 falls in `(101, 200)`.
    pub fn checkpoint_interval(&self, seq_no: u64) -> (u64, u64) {
        let end = ((seq_no + self.chk_freq - 1) / self.chk_freq) * self.chk_freq;
        (end - self.chk_freq + 1, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_intervals_align_to_chk_freq() {
        let config = PoolConfig {
            chk_freq: 3,
            ..Default::default()
        };
        assert_eq!(config.checkpoint_interval(1), (1, 3));
        assert_eq!(config.checkpoint_interval(3), (1, 3));
        assert_eq!(config.checkpoint_interval(4), (4, 6));
    }
}
