//! Per-provider rate limiting
//!
//! Fixed-window budgets, one counter per provider, tracked in a lock-free
//! map so unrelated providers never contend. Reservations on one provider
//! serialize through that provider's async mutex; a reservation that cannot
//! be granted suspends cooperatively until budget frees up, the window rolls
//! over, or the configured max wait elapses.
//!
//! Consumed units are quota spent, not capacity held: releasing a lease only
//! reconciles the estimate against actual consumption and wakes waiters.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::config::BudgetConfig;
use crate::error::RateLimitTimeout;

/// Mutable window state, guarded by `ProviderState::window`
struct Window {
    started: Instant,
    consumed: u64,
}

/// Everything tracked for one provider
struct ProviderState {
    id: String,
    limit: u64,
    window_len: Duration,
    max_wait: Duration,
    window: Mutex<Window>,
    /// Woken when budget frees up or a window rolls over
    freed: Notify,
}

impl ProviderState {
    /// Roll the window if its length has elapsed. Caller holds the lock.
    fn roll_if_due(&self, w: &mut Window) -> bool {
        let now = Instant::now();
        if now.duration_since(w.started) >= self.window_len {
            // Align the new window to the boundary grid, not to `now`
            let windows_passed =
                now.duration_since(w.started).as_nanos() / self.window_len.as_nanos().max(1);
            w.started += self.window_len * windows_passed as u32;
            w.consumed = 0;
            true
        } else {
            false
        }
    }
}

/// A granted reservation of provider budget.
///
/// Dropping the lease without an explicit release keeps the estimate as the
/// recorded cost and still wakes waiters, so a cancelled call never leaks
/// the lease.
pub struct BudgetLease {
    state: Arc<ProviderState>,
    units: u64,
    granted_at: Instant,
    released: bool,
}

impl std::fmt::Debug for BudgetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLease")
            .field("provider", &self.state.id)
            .field("units", &self.units)
            .field("granted_at", &self.granted_at)
            .field("released", &self.released)
            .finish()
    }
}

impl BudgetLease {
    /// Units reserved by this lease
    pub fn units(&self) -> u64 {
        self.units
    }

    /// Record true consumption, which may differ from the estimate.
    ///
    /// A lower actual frees budget for waiters within the same window; a
    /// higher actual is charged but never pushes the counter past the limit
    /// accounting. Adjustments after a rollover are dropped: that window's
    /// books are already closed.
    pub async fn release(mut self, actual_units: u64) {
        let mut w = self.state.window.lock().await;
        let rolled = self.state.roll_if_due(&mut w);

        let same_window = !rolled && self.granted_at >= w.started;
        if same_window && actual_units != self.units {
            if actual_units < self.units {
                w.consumed = w.consumed.saturating_sub(self.units - actual_units);
            } else {
                w.consumed = w
                    .consumed
                    .saturating_add(actual_units - self.units)
                    .min(self.state.limit);
            }
            tracing::debug!(
                provider = %self.state.id,
                estimated = self.units,
                actual = actual_units,
                consumed = w.consumed,
                "lease reconciled"
            );
        }
        drop(w);

        self.released = true;
        self.state.freed.notify_waiters();
    }
}

impl Drop for BudgetLease {
    fn drop(&mut self) {
        if !self.released {
            // Estimate stands as the recorded cost; a rollover may have
            // happened while we held the lease, so nudge waiters anyway.
            self.state.freed.notify_waiters();
        }
    }
}

/// Fixed-window rate limiter over all configured providers.
///
/// Explicitly owned and injectable; production wiring creates exactly one
/// instance at startup and shares it behind an `Arc`.
pub struct RateLimiter {
    providers: DashMap<String, Arc<ProviderState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
        }
    }

    /// Register (or replace) a provider's budget
    pub fn register(&self, provider: &str, budget: &BudgetConfig) {
        self.providers.insert(
            provider.to_string(),
            Arc::new(ProviderState {
                id: provider.to_string(),
                limit: budget.limit_units,
                window_len: budget.window,
                max_wait: budget.max_wait,
                window: Mutex::new(Window {
                    started: Instant::now(),
                    consumed: 0,
                }),
                freed: Notify::new(),
            }),
        );
    }

    fn state(&self, provider: &str) -> Option<Arc<ProviderState>> {
        self.providers.get(provider).map(|s| Arc::clone(&s))
    }

    /// Reserve `estimated_units` of budget, suspending until the units fit
    /// in the current window or `max_wait` elapses.
    ///
    /// Waiting on one provider never blocks reservations on another; within
    /// one provider the check-and-increment is exclusive, so the counter can
    /// never exceed the limit.
    pub async fn reserve(
        &self,
        provider: &str,
        estimated_units: u64,
    ) -> Result<BudgetLease, RateLimitTimeout> {
        let state = match self.state(provider) {
            Some(s) => s,
            None => {
                // Unregistered providers are not limited; keep a registered
                // entry anyway so the counter invariant holds everywhere.
                self.register(
                    provider,
                    &BudgetConfig {
                        limit_units: u64::MAX,
                        ..BudgetConfig::default()
                    },
                );
                self.state(provider).expect("provider just registered")
            }
        };

        let started_waiting = Instant::now();
        let deadline = started_waiting + state.max_wait;

        loop {
            {
                let mut w = state.window.lock().await;
                if state.roll_if_due(&mut w) {
                    state.freed.notify_waiters();
                }
                if w.consumed.saturating_add(estimated_units) <= state.limit {
                    w.consumed += estimated_units;
                    tracing::trace!(
                        provider,
                        units = estimated_units,
                        consumed = w.consumed,
                        limit = state.limit,
                        "budget reserved"
                    );
                    return Ok(BudgetLease {
                        state: Arc::clone(&state),
                        units: estimated_units,
                        granted_at: Instant::now(),
                        released: false,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(provider, waited = ?state.max_wait, "rate limit wait expired");
                return Err(RateLimitTimeout {
                    provider: provider.to_string(),
                    waited: now.duration_since(started_waiting),
                });
            }

            // Wake on freed budget, the next window boundary, or the
            // reservation deadline, whichever comes first.
            let until_rollover = {
                let w = state.window.lock().await;
                state.window_len.saturating_sub(w.started.elapsed())
            };
            let wait = until_rollover.min(deadline.duration_since(now));
            tokio::select! {
                _ = state.freed.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Reserve budget for several tasks at once, granting incrementally as
    /// budget allows. Returns the granted leases and the indices of tasks
    /// that did not fit; callers retry those later rather than dropping
    /// them.
    pub async fn batch_reserve(
        &self,
        provider: &str,
        costs: &[u64],
    ) -> (Vec<BudgetLease>, Vec<usize>) {
        let mut granted = Vec::new();
        let mut ungranted = Vec::new();

        for (idx, &cost) in costs.iter().enumerate() {
            // Non-blocking pass: a task that does not fit right now is
            // handed back instead of stalling the ones behind it.
            match self.try_reserve(provider, cost).await {
                Some(lease) => granted.push(lease),
                None => ungranted.push(idx),
            }
        }

        if !ungranted.is_empty() {
            tracing::debug!(
                provider,
                granted = granted.len(),
                deferred = ungranted.len(),
                "partial batch grant"
            );
        }
        (granted, ungranted)
    }

    /// Grant immediately if the units fit, otherwise return `None`
    async fn try_reserve(&self, provider: &str, units: u64) -> Option<BudgetLease> {
        let state = self.state(provider)?;
        let mut w = state.window.lock().await;
        if state.roll_if_due(&mut w) {
            state.freed.notify_waiters();
        }
        if w.consumed.saturating_add(units) <= state.limit {
            w.consumed += units;
            drop(w);
            Some(BudgetLease {
                state,
                units,
                granted_at: Instant::now(),
                released: false,
            })
        } else {
            None
        }
    }

    /// Current consumption for a provider, for metrics and tests
    pub async fn consumed(&self, provider: &str) -> u64 {
        match self.state(provider) {
            Some(state) => state.window.lock().await.consumed,
            None => 0,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
