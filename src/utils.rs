use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Source of time for every polling and timeout loop in the crate
///
/// Sessions take an `Arc<dyn Clock>` so tests can substitute [`ManualClock`]
/// and run multi-second waits instantly.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time backed by `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only advances when slept on
///
/// `sleep` returns immediately after moving the clock forward, so a loop that
/// waits five seconds completes in microseconds while still observing five
/// seconds of elapsed time.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Total time slept on this clock so far
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Returns true when an optional cancellation flag has been raised
pub fn is_cancelled(flag: Option<&AtomicBool>) -> bool {
    flag.is_some_and(|f| f.load(Ordering::SeqCst))
}

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out
    Timeout,
    /// The cancellation flag was raised between polls
    Cancelled,
    /// Error occurred in the condition/operation function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout => write!(f, "Operation timed out"),
            PollError::Cancelled => write!(f, "Operation cancelled"),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout | PollError::Cancelled => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Poll a condition until it holds, the timeout expires, or `cancel` is raised
///
/// # Arguments
/// * `clock` - Time source used for both the deadline and the sleeps
/// * `cancel` - Optional flag checked before every call to `condition`
/// * `condition` - Returns `Ok(true)` when complete, `Ok(false)` to keep polling
/// * `timeout` - Maximum duration to wait, `None` to wait indefinitely
/// * `poll_interval` - Duration to sleep between condition checks
pub fn poll_until<F, E>(
    clock: &dyn Clock,
    cancel: Option<&AtomicBool>,
    mut condition: F,
    timeout: Option<Duration>,
    poll_interval: Duration,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = clock.now();

    loop {
        if is_cancelled(cancel) {
            return Err(PollError::Cancelled);
        }

        if let Some(timeout) = timeout {
            if clock.now().duration_since(start) >= timeout {
                return Err(PollError::Timeout);
            }
        }

        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => clock.sleep(poll_interval),
            Err(e) => return Err(PollError::ConditionError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.sleep(Duration::from_secs(3));
        assert_eq!(clock.now().duration_since(t0), Duration::from_secs(3));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_poll_until_success() {
        let clock = ManualClock::new();
        let mut count = 0;

        let result = poll_until(
            &clock,
            None,
            || {
                count += 1;
                Ok::<bool, &str>(count >= 3)
            },
            Some(Duration::from_millis(500)),
            Duration::from_millis(10),
        );

        assert!(result.is_ok());
        assert_eq!(count, 3);
        assert_eq!(clock.elapsed(), Duration::from_millis(20));
    }

    #[test]
    fn test_poll_until_timeout() {
        let clock = ManualClock::new();
        let result = poll_until(
            &clock,
            None,
            || Ok::<bool, &str>(false),
            Some(Duration::from_millis(50)),
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::Timeout)));
    }

    #[test]
    fn test_poll_until_error() {
        let clock = ManualClock::new();
        let result = poll_until(
            &clock,
            None,
            || Err::<bool, &str>("test error"),
            None,
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::ConditionError("test error"))));
    }

    #[test]
    fn test_poll_until_cancelled() {
        let clock = ManualClock::new();
        let flag = AtomicBool::new(false);
        let mut count = 0;

        let result = poll_until(
            &clock,
            Some(&flag),
            || {
                count += 1;
                if count == 2 {
                    flag.store(true, Ordering::SeqCst);
                }
                Ok::<bool, &str>(false)
            },
            None,
            Duration::from_millis(10),
        );

        assert!(matches!(result, Err(PollError::Cancelled)));
        assert_eq!(count, 2);
    }
}
