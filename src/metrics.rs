/// Point-in-time snapshot of pool activity.
///
/// Counters are sampled individually with relaxed loads, so a snapshot taken
/// while the pool is busy may be internally inconsistent by a task or two.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    /// Workers currently registered, live or draining.
    pub live_workers: usize,
    /// Workers currently parked waiting for work.
    pub idle_workers: usize,
    /// Tasks queued anywhere (shared queue or worker-local deques), not yet
    /// picked for execution.
    pub queued_tasks: usize,
    /// Tasks accepted by `submit` since the pool was created.
    pub total_submitted: usize,
    /// Tasks that ran to completion.
    pub completed_tasks: usize,
    /// Tasks whose invocation panicked.
    pub failed_tasks: usize,
    /// Tasks dropped unexecuted by a forced shutdown.
    pub discarded_tasks: usize,
}

impl PoolMetrics {
    /// Fraction of workers currently busy, in `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        if self.live_workers == 0 {
            return 0.0;
        }
        (self.live_workers - self.idle_workers.min(self.live_workers)) as f64
            / self.live_workers as f64
    }

    /// Fraction of finished tasks that completed without panicking.
    pub fn success_rate(&self) -> f64 {
        let finished = self.completed_tasks + self.failed_tasks;
        if finished == 0 {
            return 1.0;
        }
        self.completed_tasks as f64 / finished as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_handles_empty_pool() {
        let metrics = PoolMetrics::default();
        assert_eq!(metrics.utilization(), 0.0);
    }

    #[test]
    fn utilization_counts_busy_workers() {
        let metrics = PoolMetrics {
            live_workers: 4,
            idle_workers: 1,
            ..Default::default()
        };
        assert_eq!(metrics.utilization(), 0.75);
    }

    #[test]
    fn success_rate_defaults_to_one() {
        assert_eq!(PoolMetrics::default().success_rate(), 1.0);
    }

    #[test]
    fn success_rate_accounts_for_failures() {
        let metrics = PoolMetrics {
            completed_tasks: 9,
            failed_tasks: 1,
            ..Default::default()
        };
        assert_eq!(metrics.success_rate(), 0.9);
    }
}
