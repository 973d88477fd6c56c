//! Time source for every deadline in the master.
//!
//! All timers (offer expiry, delayed framework removal, health checks,
//! allocation ticks) read time through this module, which sits on tokio's
//! time driver. A paused runtime (`#[tokio::test(start_paused = true)]`)
//! together with `tokio::time::advance` therefore moves every timer in the
//! system deterministically, and `tokio::time::resume` returns to wall time.

use std::time::Duration;

pub use tokio::time::Instant;

/// Current instant on the runtime clock.
pub fn now() -> Instant {
    Instant::now()
}

pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

pub async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
}

/// Time elapsed since `earlier`, saturating at zero.
pub fn since(earlier: Instant) -> Duration {
    now().saturating_duration_since(earlier)
}
