//! Time source for the store.
//!
//! Queue ordering and cache expiry both depend on "now", so the store reads it
//! through this trait instead of calling `Utc::now()` directly.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to. Millisecond resolution.
#[derive(Debug, Default)]
pub struct ManualClock {
  millis: AtomicI64,
}

impl ManualClock {
  pub fn at_millis(millis: i64) -> Self {
    Self {
      millis: AtomicI64::new(millis),
    }
  }

  pub fn set_millis(&self, millis: i64) {
    self.millis.store(millis, Ordering::SeqCst);
  }

  pub fn advance(&self, by: Duration) {
    self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    from_millis(self.millis.load(Ordering::SeqCst))
  }
}

/// Convert stored epoch milliseconds back into a timestamp.
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
  Utc
    .timestamp_millis_opt(millis)
    .single()
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_manual_clock_advances() {
    let clock = ManualClock::at_millis(1_000);
    clock.advance(Duration::milliseconds(250));
    assert_eq!(clock.now().timestamp_millis(), 1_250);

    clock.set_millis(10);
    assert_eq!(clock.now().timestamp_millis(), 10);
  }
}
