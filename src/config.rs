//! # Global runtime configuration.
//!
//! [`Config`] defines the conveyor's behavior: queue capacities, the
//! per-cycle event admission cap, the worker's idle park interval, the
//! shutdown grace period, and the event bus capacity.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use pulsevisor::Config;
//!
//! let mut cfg = Config::default();
//! cfg.admission_cap = 64;
//! cfg.grace = Duration::from_secs(10);
//!
//! assert_eq!(cfg.admission_cap, 64);
//! ```

use std::time::Duration;

/// Global configuration for the conveyor and its slot workers.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of each slot's input queue. When full, `submit` returns
    /// [`SubmitError::Full`](crate::SubmitError::Full).
    pub input_capacity: usize,

    /// Capacity of each slot's adapter response queue.
    pub response_capacity: usize,

    /// Maximum number of input items a worker admits per Working cycle.
    /// The Initializing drain ignores the cap and admits everything.
    pub admission_cap: usize,

    /// Upper bound on how long an idle worker parks on its input queue
    /// before re-checking responses, retirement, and shutdown.
    pub idle_poll: Duration,

    /// Maximum time `shutdown` waits for slot workers before reporting
    /// them stuck.
    pub grace: Duration,

    /// Capacity of the event bus channel.
    pub bus_capacity: usize,
}

impl Config {
    /// Event bus capacity with the lower bound a broadcast channel needs.
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Provides a default configuration:
    /// - `input_capacity = 1024`
    /// - `response_capacity = 1024`
    /// - `admission_cap = 256`
    /// - `idle_poll = 10ms`
    /// - `grace = 30s`
    /// - `bus_capacity = 1024`
    fn default() -> Self {
        Self {
            input_capacity: 1024,
            response_capacity: 1024,
            admission_cap: 256,
            idle_poll: Duration::from_millis(10),
            grace: Duration::from_secs(30),
            bus_capacity: 1024,
        }
    }
}
