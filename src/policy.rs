use tokio::time::Duration;

/// Policy which is applicable to a connection pool.
#[derive(Clone, Debug)]
pub struct Policy {
    /// The number of connections maintained by this pool.
    pub connections: usize,

    /// Default limit on the total time a checkout may spend queued plus
    /// checked out, used by [crate::pool::Pool::checkout].
    pub checkout_timeout: Duration,

    /// The acceptable head-of-line delay through the wait queue.
    ///
    /// Waiters are only shed once the minimum delay observed over a whole
    /// interval stays above this target.
    pub queue_target: Duration,

    /// The measurement window for the wait-queue delay sampler.
    pub queue_interval: Duration,

    /// How often an idle connection is pinged to keep it warm.
    pub idle_interval: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            connections: 8,
            checkout_timeout: Duration::from_millis(5000),
            queue_target: Duration::from_millis(50),
            queue_interval: Duration::from_millis(1000),
            idle_interval: Duration::from_millis(1000),
        }
    }
}
