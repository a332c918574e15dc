//! Circuit breaker guarding calls to the backing store.
//!
//! The breaker has two states. While **closed**, failures of wrapped calls are
//! counted; more than `fault_threshold` failures inside one fault window open
//! it. While **open**, calls return the caller's default result without
//! running. After `circuit_open_interval` the next call closes the breaker and
//! runs normally; there is no separate half-open state.
//!
//! The open check reads atomics without locking. Only fault counting and
//! state transitions take the lock, so a call racing a transition may be let
//! through or short-circuited once near the boundary.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{duration_to_ticks, Clock, SystemClock, Ticks};

/// Callback run on a state transition.
pub type TransitionHook = Box<dyn Fn() + Send + Sync>;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures tolerated inside one fault window; one more opens the circuit
    pub fault_threshold: u32,
    /// Window in which consecutive failures are counted together
    pub fault_window: Duration,
    /// How long the circuit stays open before the next call is let through
    pub circuit_open_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fault_threshold: 3,
            fault_window: Duration::from_secs(60),
            circuit_open_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct FaultState {
    consecutive_faults: u32,
    fault_window_start: Ticks,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    is_open: AtomicBool,
    circuit_open_time: AtomicI64,
    faults: Mutex<FaultState>,
    on_opened: Option<TransitionHook>,
    on_closed: Option<TransitionHook>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("is_open", &self.is_open())
            .field("consecutive_faults", &self.consecutive_faults())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            is_open: AtomicBool::new(false),
            circuit_open_time: AtomicI64::new(0),
            faults: Mutex::new(FaultState::default()),
            on_opened: None,
            on_closed: None,
        }
    }

    /// Run `hook` whenever the circuit opens.
    pub fn with_on_opened(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_opened = Some(Box::new(hook));
        self
    }

    /// Run `hook` whenever the circuit closes again.
    pub fn with_on_closed(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_closed = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.faults.lock().consecutive_faults
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// Returns `default` without calling `operation` while the circuit is open,
    /// and also when `operation` fails (the failure is counted as a fault).
    pub async fn execute<T, E, F, Fut>(&self, operation: F, default: T) -> T
    where
        E: fmt::Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let now = self.clock.now_ticks();

        if self.is_open() {
            let opened_at = self.circuit_open_time.load(Ordering::Acquire);
            if now - opened_at < duration_to_ticks(self.config.circuit_open_interval) {
                debug!("Circuit open; skipping store call");
                return default;
            }
            self.close();
        }

        match operation().await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Store call failed");
                self.record_fault(self.clock.now_ticks());
                default
            }
        }
    }

    fn close(&self) {
        let mut faults = self.faults.lock();
        if !self.is_open() {
            // Another caller closed it first.
            return;
        }
        faults.consecutive_faults = 0;
        self.is_open.store(false, Ordering::Release);
        drop(faults);

        info!("Circuit closed; resuming store calls");
        if let Some(hook) = &self.on_closed {
            hook();
        }
    }

    fn record_fault(&self, now: Ticks) {
        let mut faults = self.faults.lock();
        if self.is_open() {
            return;
        }

        let window = duration_to_ticks(self.config.fault_window);
        if faults.consecutive_faults > 0 && now - faults.fault_window_start > window {
            // Too long since this run started; count from this fault.
            faults.consecutive_faults = 0;
        }
        if faults.consecutive_faults == 0 {
            faults.fault_window_start = now;
        }
        faults.consecutive_faults += 1;

        if faults.consecutive_faults <= self.config.fault_threshold {
            return;
        }

        self.circuit_open_time.store(now, Ordering::Release);
        self.is_open.store(true, Ordering::Release);
        let count = faults.consecutive_faults;
        drop(faults);

        warn!(
            consecutive_faults = count,
            open_for_secs = self.config.circuit_open_interval.as_secs(),
            "Circuit opened"
        );
        if let Some(hook) = &self.on_opened {
            hook();
        }
    }
}
