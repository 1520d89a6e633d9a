//! Refresh interval gate with exponential backoff.

// std
use std::cell::RefCell;
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
// self
use crate::_prelude::*;

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Smallest backoff delay between failed attempts.
pub const MIN_BACKOFF: Duration = Duration::from_secs(30);
/// Largest backoff delay between failed attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);
/// Jitter ratio applied around the computed delay, spreading retries across
/// processes that would otherwise wake in lockstep.
pub const JITTER_RATIO: f64 = 0.25;

const MAX_EXPONENT: u32 = 30;

/// Gate deciding when the next refresh attempt may run.
///
/// A fresh timer opens `interval` after construction; `reset` re-arms it
/// after a successful pass and `backoff` pushes it out exponentially after a
/// failed one.
#[derive(Debug)]
pub struct RefreshTimer {
	interval: Duration,
	attempts: u32,
	backoff_end: Instant,
}
impl RefreshTimer {
	/// Create a timer firing every `interval`.
	pub fn new(interval: Duration) -> Self {
		Self { interval, attempts: 0, backoff_end: Instant::now() + interval }
	}

	/// Whether the gate is open for another refresh attempt.
	pub fn can_refresh(&self) -> bool {
		Instant::now() >= self.backoff_end
	}

	/// Re-arm the timer one interval out and clear failure bookkeeping.
	pub fn reset(&mut self) {
		self.attempts = 0;
		self.backoff_end = Instant::now() + self.interval;
	}

	/// Push the gate out by the next exponential delay.
	pub fn backoff(&mut self) {
		self.attempts = self.attempts.saturating_add(1);

		let base = self.interval.min(MIN_BACKOFF);
		let cap = self.interval.min(MAX_BACKOFF);

		self.backoff_end = Instant::now() + jittered_backoff(base, cap, self.attempts);
	}
}

/// Exponential backoff delay for the given attempt count with ±25 % jitter.
///
/// The exponent saturates at the cap, after which the delay stays at
/// `cap · (1 + jitter)`.
pub fn jittered_backoff(base: Duration, cap: Duration, attempts: u32) -> Duration {
	let exponent = attempts.saturating_sub(1).min(MAX_EXPONENT);
	let raw = base.as_secs_f64() * 2_f64.powi(exponent as i32);
	let capped = raw.min(cap.as_secs_f64());
	let jitter = SMALL_RNG.with(|cell| cell.borrow_mut().random_range(-JITTER_RATIO..=JITTER_RATIO));

	Duration::from_secs_f64(capped * (1. + jitter))
}
