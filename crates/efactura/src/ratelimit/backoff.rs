//! Shared call budget and exponential backoff state

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{CallOutcome, EndpointClass, WaitPolicy};
use crate::error::{AnafError, AnafResult};

/// Maximum calls allowed per rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointBudget {
    pub max_calls: u32,
    pub window_secs: u64,
}

impl EndpointBudget {
    pub const fn per_minute(max_calls: u32) -> Self {
        Self {
            max_calls,
            window_secs: 60,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Budgets per endpoint class and backoff timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub token: EndpointBudget,
    pub list_messages: EndpointBudget,
    pub download: EndpointBudget,
    pub revoke: EndpointBudget,
    /// Delay after the first failure; doubled for each further one
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            token: EndpointBudget::per_minute(20),
            list_messages: EndpointBudget::per_minute(60),
            download: EndpointBudget::per_minute(120),
            revoke: EndpointBudget::per_minute(10),
            base_delay_ms: 1_000,
            max_delay_secs: 300,
        }
    }
}

impl BackoffSettings {
    pub fn budget(&self, class: EndpointClass) -> EndpointBudget {
        match class {
            EndpointClass::Token => self.token,
            EndpointClass::ListMessages => self.list_messages,
            EndpointClass::Download => self.download,
            EndpointClass::Revoke => self.revoke,
        }
    }
}

/// Counters for one endpoint class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EndpointStats {
    pub calls_in_window: u32,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_denied: u64,
    pub backoff_remaining: Option<Duration>,
}

struct EndpointState {
    window_started: Instant,
    calls_in_window: u32,
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
    total_calls: u64,
    total_denied: u64,
}

impl EndpointState {
    fn new(now: Instant) -> Self {
        Self {
            window_started: now,
            calls_in_window: 0,
            consecutive_failures: 0,
            blocked_until: None,
            total_calls: 0,
            total_denied: 0,
        }
    }
}

/// Call permits and backoff windows per endpoint class
///
/// All counters sit behind one mutex, so concurrent callers never over- or
/// under-count a budget.
pub struct BackoffController {
    settings: BackoffSettings,
    state: Mutex<HashMap<EndpointClass, EndpointState>>,
}

impl BackoffController {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &BackoffSettings {
        &self.settings
    }

    /// Take a permit if one is available now, otherwise report how long to wait
    pub fn try_acquire(&self, class: EndpointClass) -> Result<(), Duration> {
        let budget = self.settings.budget(class);
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(class).or_insert_with(|| EndpointState::new(now));

        if let Some(until) = entry.blocked_until {
            if until > now {
                return Err(until - now);
            }
            entry.blocked_until = None;
        }

        if now.duration_since(entry.window_started) >= budget.window() {
            entry.window_started = now;
            entry.calls_in_window = 0;
        }

        if entry.calls_in_window >= budget.max_calls {
            let reopens = entry.window_started + budget.window();
            return Err(reopens.saturating_duration_since(now).max(Duration::from_millis(1)));
        }

        entry.calls_in_window += 1;
        entry.total_calls += 1;
        Ok(())
    }

    /// Take a permit according to `policy`
    pub fn acquire(&self, class: EndpointClass, policy: WaitPolicy) -> AnafResult<()> {
        let deadline = match policy {
            WaitPolicy::FailFast => None,
            WaitPolicy::WaitUpTo(max) => Some(Instant::now() + max),
        };

        loop {
            let wait = match self.try_acquire(class) {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            match deadline {
                Some(deadline) if Instant::now() + wait <= deadline => {
                    debug!("Waiting {:?} for a {} permit", wait, class);
                    std::thread::sleep(wait);
                }
                _ => {
                    self.note_denied(class);
                    return Err(AnafError::RateLimited {
                        endpoint: class,
                        retry_after: wait,
                    });
                }
            }
        }
    }

    /// Record how an upstream call ended
    pub fn record(&self, class: EndpointClass, outcome: CallOutcome) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(class).or_insert_with(|| EndpointState::new(now));

        let retry_after = match outcome {
            CallOutcome::Success => {
                entry.consecutive_failures = 0;
                return;
            }
            CallOutcome::Neutral => return,
            CallOutcome::RateLimited(retry_after) => retry_after,
            CallOutcome::Unavailable => None,
        };

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        let delay = self
            .backoff_delay(entry.consecutive_failures)
            .max(retry_after.unwrap_or_default());
        let until = now + delay;
        entry.blocked_until = Some(entry.blocked_until.map_or(until, |b| b.max(until)));

        warn!(
            "Backing off {} endpoint for {:?} after {} consecutive failure(s)",
            class, delay, entry.consecutive_failures
        );
    }

    /// Acquire a permit, run `call`, and record its outcome
    ///
    /// An upstream 429 comes back as `RateLimited` carrying the backoff the
    /// controller actually applied.
    pub fn call<T>(
        &self,
        class: EndpointClass,
        policy: WaitPolicy,
        call: impl FnOnce() -> AnafResult<T>,
    ) -> AnafResult<T> {
        self.acquire(class, policy)?;
        let result = call();

        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(AnafError::RateLimited { retry_after, .. }) => {
                CallOutcome::RateLimited(Some(*retry_after).filter(|d| !d.is_zero()))
            }
            Err(AnafError::UpstreamUnavailable(_)) => CallOutcome::Unavailable,
            Err(_) => CallOutcome::Neutral,
        };
        self.record(class, outcome);

        match result {
            Err(AnafError::RateLimited { .. }) => Err(AnafError::RateLimited {
                endpoint: class,
                retry_after: self.stats(class).backoff_remaining.unwrap_or_default(),
            }),
            other => other,
        }
    }

    /// Backoff applied after `failures` consecutive failures
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let base = Duration::from_millis(self.settings.base_delay_ms);
        let factor = 1u32 << (failures - 1).min(20);
        base.saturating_mul(factor)
            .min(Duration::from_secs(self.settings.max_delay_secs))
    }

    pub fn stats(&self, class: EndpointClass) -> EndpointStats {
        let now = Instant::now();
        let state = self.state.lock().unwrap();
        state
            .get(&class)
            .map(|entry| EndpointStats {
                calls_in_window: entry.calls_in_window,
                consecutive_failures: entry.consecutive_failures,
                total_calls: entry.total_calls,
                total_denied: entry.total_denied,
                backoff_remaining: entry
                    .blocked_until
                    .filter(|until| *until > now)
                    .map(|until| until - now),
            })
            .unwrap_or_default()
    }

    fn note_denied(&self, class: EndpointClass) {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        state
            .entry(class)
            .or_insert_with(|| EndpointState::new(now))
            .total_denied += 1;
    }
}

impl Default for BackoffController {
    fn default() -> Self {
        Self::new(BackoffSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(max_calls: u32, window_secs: u64) -> BackoffSettings {
        let budget = EndpointBudget {
            max_calls,
            window_secs,
        };
        BackoffSettings {
            token: budget,
            list_messages: budget,
            download: budget,
            revoke: budget,
            base_delay_ms: 100,
            max_delay_secs: 1,
        }
    }

    #[test]
    fn test_budget_exhaustion_fails_fast() {
        let controller = BackoffController::new(settings(2, 60));

        controller.acquire(EndpointClass::Download, WaitPolicy::FailFast).unwrap();
        controller.acquire(EndpointClass::Download, WaitPolicy::FailFast).unwrap();
        let err = controller
            .acquire(EndpointClass::Download, WaitPolicy::FailFast)
            .unwrap_err();
        assert!(matches!(
            err,
            AnafError::RateLimited {
                endpoint: EndpointClass::Download,
                ..
            }
        ));

        // Other classes have their own budget
        controller.acquire(EndpointClass::ListMessages, WaitPolicy::FailFast).unwrap();

        let stats = controller.stats(EndpointClass::Download);
        assert_eq!(stats.calls_in_window, 2);
        assert_eq!(stats.total_denied, 1);
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let controller = BackoffController::new(settings(10, 60));
        assert_eq!(controller.backoff_delay(0), Duration::ZERO);
        assert_eq!(controller.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(controller.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(controller.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(controller.backoff_delay(10), Duration::from_secs(1));
        assert_eq!(controller.backoff_delay(60), Duration::from_secs(1));
    }

    #[test]
    fn test_failures_block_and_success_resets() {
        let controller = BackoffController::new(settings(10, 60));

        controller.record(EndpointClass::ListMessages, CallOutcome::Unavailable);
        controller.record(EndpointClass::ListMessages, CallOutcome::Unavailable);
        let stats = controller.stats(EndpointClass::ListMessages);
        assert_eq!(stats.consecutive_failures, 2);
        assert!(stats.backoff_remaining.is_some());
        assert!(controller.try_acquire(EndpointClass::ListMessages).is_err());

        controller.record(EndpointClass::ListMessages, CallOutcome::Success);
        assert_eq!(controller.stats(EndpointClass::ListMessages).consecutive_failures, 0);
    }

    #[test]
    fn test_retry_after_lengthens_backoff() {
        let mut s = settings(10, 60);
        s.max_delay_secs = 60;
        let controller = BackoffController::new(s);

        controller.record(
            EndpointClass::Download,
            CallOutcome::RateLimited(Some(Duration::from_secs(30))),
        );
        let remaining = controller
            .stats(EndpointClass::Download)
            .backoff_remaining
            .unwrap();
        assert!(remaining > Duration::from_secs(25));
    }

    #[test]
    fn test_neutral_outcome_does_not_block() {
        let controller = BackoffController::new(settings(10, 60));
        controller.record(EndpointClass::Token, CallOutcome::Neutral);
        assert!(controller.try_acquire(EndpointClass::Token).is_ok());
        assert_eq!(controller.stats(EndpointClass::Token).consecutive_failures, 0);
    }

    #[test]
    fn test_wait_policy_waits_for_window() {
        let controller = BackoffController::new(settings(1, 1));
        controller.acquire(EndpointClass::Token, WaitPolicy::FailFast).unwrap();

        let start = Instant::now();
        controller
            .acquire(EndpointClass::Token, WaitPolicy::WaitUpTo(Duration::from_secs(3)))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[test]
    fn test_wait_policy_gives_up_past_bound() {
        let controller = BackoffController::new(settings(1, 60));
        controller.acquire(EndpointClass::Token, WaitPolicy::FailFast).unwrap();

        let start = Instant::now();
        let err = controller
            .acquire(EndpointClass::Token, WaitPolicy::WaitUpTo(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, AnafError::RateLimited { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_call_records_upstream_outcome() {
        let controller = BackoffController::new(settings(10, 60));

        let ok: AnafResult<u8> = controller.call(EndpointClass::Download, WaitPolicy::FailFast, || Ok(1));
        assert_eq!(ok.unwrap(), 1);

        let err: AnafResult<u8> = controller.call(EndpointClass::Download, WaitPolicy::FailFast, || {
            Err(AnafError::UpstreamUnavailable("503".into()))
        });
        assert!(matches!(err, Err(AnafError::UpstreamUnavailable(_))));
        assert_eq!(controller.stats(EndpointClass::Download).consecutive_failures, 1);

        // The backoff now denies fail-fast callers without running the call
        let ran = AtomicUsize::new(0);
        let denied: AnafResult<u8> = controller.call(EndpointClass::Download, WaitPolicy::FailFast, || {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        });
        assert!(matches!(denied, Err(AnafError::RateLimited { .. })));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_permits_are_counted_exactly() {
        let controller = Arc::new(BackoffController::new(settings(25, 60)));
        let granted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = Arc::clone(&controller);
                let granted = Arc::clone(&granted);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        if controller.try_acquire(EndpointClass::ListMessages).is_ok() {
                            granted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 25);
        let stats = controller.stats(EndpointClass::ListMessages);
        assert_eq!(stats.calls_in_window, 25);
        assert_eq!(stats.total_calls, 25);
    }
}
