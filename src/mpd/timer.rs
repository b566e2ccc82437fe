//! Interpolated playback position between status polls.

use tokio::time::Instant;

/// Corrections closer than this to the interpolated position are ignored.
pub const DEFAULT_TOLERANCE_MS: u64 = 100;

/// Elapsed-time timer, in milliseconds.
#[derive(Debug, Clone)]
pub struct Timer {
  reference_ms: u64,
  reference_instant: Instant,
  running: bool,
  tolerance_ms: u64,
}

impl Timer {
  pub fn new(tolerance_ms: u64) -> Self {
    Self {
      reference_ms: 0,
      reference_instant: Instant::now(),
      running: false,
      tolerance_ms,
    }
  }

  /// Current interpolated position.
  pub fn current(&self) -> u64 {
    if self.running {
      let elapsed = Instant::now().saturating_duration_since(self.reference_instant);
      self.reference_ms.saturating_add(elapsed.as_millis() as u64)
    } else {
      self.reference_ms
    }
  }

  pub fn is_running(&self) -> bool {
    self.running
  }

  pub fn tolerance_ms(&self) -> u64 {
    self.tolerance_ms
  }

  pub fn play(&mut self) {
    if self.running {
      return;
    }
    self.reference_instant = Instant::now();
    self.running = true;
  }

  pub fn pause(&mut self) {
    self.reference_ms = self.current();
    self.running = false;
  }

  pub fn stop(&mut self) {
    self.reference_ms = 0;
    self.running = false;
  }

  /// Rebase onto an authoritative value.
  ///
  /// Returns `true` if the value was far enough from the interpolated
  /// position to be applied, `false` if it was absorbed as jitter.
  pub fn correct(&mut self, value_ms: u64) -> bool {
    if self.current().abs_diff(value_ms) <= self.tolerance_ms {
      return false;
    }
    self.reference_ms = value_ms;
    self.reference_instant = Instant::now();
    true
  }
}

impl Default for Timer {
  fn default() -> Self {
    Self::new(DEFAULT_TOLERANCE_MS)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test(start_paused = true)]
  async fn test_play_then_pause_accumulates_elapsed_time() {
    let mut timer = Timer::default();
    timer.correct(5_000);
    timer.play();
    tokio::time::advance(Duration::from_millis(1_250)).await;
    timer.pause();
    assert_eq!(timer.current(), 6_250);

    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(timer.current(), 6_250);
    assert!(!timer.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_resets_to_zero() {
    let mut timer = Timer::default();
    timer.correct(42_000);
    timer.play();
    tokio::time::advance(Duration::from_secs(2)).await;
    timer.stop();
    assert_eq!(timer.current(), 0);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(timer.current(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_correct_ignores_jitter() {
    let mut timer = Timer::new(100);
    timer.correct(10_000);
    timer.play();
    tokio::time::advance(Duration::from_millis(500)).await;

    assert!(!timer.correct(10_560));
    assert_eq!(timer.current(), 10_500);
    assert!(!timer.correct(10_400));
    assert_eq!(timer.current(), 10_500);
  }

  #[tokio::test(start_paused = true)]
  async fn test_correct_rebases_on_real_jump() {
    let mut timer = Timer::new(100);
    timer.play();
    tokio::time::advance(Duration::from_millis(300)).await;

    assert!(timer.correct(90_000));
    assert_eq!(timer.current(), 90_000);

    tokio::time::advance(Duration::from_millis(40)).await;
    assert_eq!(timer.current(), 90_040);
  }

  #[tokio::test(start_paused = true)]
  async fn test_play_is_idempotent_while_running() {
    let mut timer = Timer::default();
    timer.play();
    tokio::time::advance(Duration::from_millis(700)).await;
    timer.play();
    assert_eq!(timer.current(), 700);
  }

  #[tokio::test(start_paused = true)]
  async fn test_current_saturates_instead_of_overflowing() {
    let mut timer = Timer::default();
    timer.correct(u64::MAX - 10);
    timer.play();
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(timer.current(), u64::MAX);
  }
}
