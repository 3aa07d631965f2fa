//! Shared utilities: observer signals, paced ticking, value ramps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keyframe::functions::EaseInOut;
use keyframe::EasingFunction;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Fan-out signal: an owning list of callbacks plus a snapshot-style
/// `fire`, so handlers may disconnect (or connect) during dispatch.
///
/// Handlers run synchronously on the calling task and must not block.
pub struct Signal<T> {
    handlers: Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connect(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn disconnect(&self, id: u64) {
        self.handlers.lock().retain(|(hid, _)| *hid != id);
    }

    pub fn fire(&self, args: &T) {
        let snapshot: Vec<_> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(args);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

/// Monotonic paced tick.
///
/// `tick()` sleeps `max(0, last + interval - now)` and records the new
/// deadline, so a slow body eats into the next sleep instead of drifting.
pub struct Ticker {
    interval: Duration,
    last: Option<Instant>,
}

impl Ticker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn tick(&mut self) {
        if let Some(last) = self.last {
            let target = last + self.interval;
            let now = Instant::now();
            if target > now {
                tokio::time::sleep(target - now).await;
            }
        }
        self.last = Some(Instant::now());
    }
}

pub fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

/// Scale a 0-100 brightness level to the 0-255 wire value.
pub fn scale_brightness(level: f64) -> u8 {
    (clamp(level, 0.0, 100.0) / 100.0 * 255.0).round() as u8
}

/// Scale a 0-255 wire value back to a 0-100 brightness level.
pub fn unscale_brightness(raw: u8) -> f64 {
    raw as f64 / 255.0 * 100.0
}

/// Tick interval of brightness ramps, matching the animation frame rate.
pub const RAMP_STEP: Duration = Duration::from_millis(33);

/// Eased intermediate values for a brightness ramp, endpoint included.
///
/// Step count scales with the distance covered so short ramps stay snappy.
pub fn brightness_ramp(start: f64, end: f64) -> Vec<f64> {
    if (end - start).abs() < f64::EPSILON {
        return vec![end];
    }

    let steps = ((end - start).abs() / 100.0 * 12.0).ceil().max(2.0) as u32;
    (1..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            EaseInOut.y(t) * (end - start) + start
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_signal_fires_all_handlers() {
        let signal: Signal<u32> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let count = Arc::clone(&count);
            signal.connect(move |v| {
                count.fetch_add(*v as usize, Ordering::SeqCst);
            });
        }

        signal.fire(&2);
        assert_eq!(count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_signal_disconnect() {
        let signal: Signal<()> = Signal::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let id = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        signal.fire(&());
        signal.disconnect(id);
        signal.fire(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_may_disconnect_during_fanout() {
        let signal: Arc<Signal<()>> = Arc::new(Signal::new());
        let count = Arc::new(AtomicUsize::new(0));

        let sig = Arc::clone(&signal);
        let id = Arc::new(AtomicU64::new(0));
        let id2 = Arc::clone(&id);
        let c = Arc::clone(&count);
        let handle = signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            sig.disconnect(id2.load(Ordering::SeqCst));
        });
        id.store(handle, Ordering::SeqCst);

        signal.fire(&());
        signal.fire(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scale_brightness() {
        assert_eq!(scale_brightness(0.0), 0);
        assert_eq!(scale_brightness(100.0), 255);
        let mid = scale_brightness(50.0);
        assert!((127..=128).contains(&mid));
        assert!((unscale_brightness(mid) - 50.0).abs() < 0.5);
    }

    #[test]
    fn test_brightness_ramp_ends_at_target() {
        let ramp = brightness_ramp(0.0, 80.0);
        assert!((ramp.last().unwrap() - 80.0).abs() < 1e-9);
        assert!(ramp.len() >= 2);

        let down = brightness_ramp(80.0, 0.0);
        assert!(down.last().unwrap().abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_paces() {
        let mut ticker = Ticker::new(Duration::from_millis(100));
        ticker.tick().await; // first tick is immediate
        let before = Instant::now();
        ticker.tick().await;
        assert!(Instant::now() - before >= Duration::from_millis(100));
    }
}
