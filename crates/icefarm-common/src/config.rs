//! Shared configuration knobs that must agree between control and client, or
//! between worker and client. Kept as plain structs with `Default` impls
//! rather than a config-file loader, since the original Python source has no
//! config file either - all of these are CLI flags in the binaries.

use chrono::Duration;

/// Reservation lease timing (spec.md §4.4 periodic tasks).
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub lease: Duration,
    pub warning_window: Duration,
    pub worker_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        LeaseConfig {
            lease: Duration::seconds(60),
            warning_window: Duration::seconds(20),
            worker_timeout: Duration::seconds(30),
        }
    }
}

/// Batch scheduler tuning (spec.md §4.6).
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_threshold: usize,
    pub target_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig { batch_size: 4, flush_threshold: 4, target_batches: 2 }
    }
}
