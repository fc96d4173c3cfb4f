//! Small shared helpers: shutdown signalling and log throttling

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Process-wide cooperative shutdown: one atomic flag plus one condition
/// variable that wakes every sleeping task.
///
/// `trigger` takes the condition variable's lock and is not async-signal-safe.
/// Call it from ordinary code, e.g. a task awaiting `tokio::signal::ctrl_c`.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Shutdown {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request shutdown and wake all sleepers.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Sleep for up to `timeout`, returning early when shutdown is requested.
    ///
    /// Returns `true` if shutdown has been requested.
    pub fn sleep(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let mut guard = self.lock.lock();
        if !self.is_triggered() {
            self.wake.wait_for(&mut guard, timeout);
        }
        self.is_triggered()
    }
}

/// Lets the first event through, then one of every `every` events.
#[derive(Debug)]
pub struct LogThrottle {
    count: AtomicU64,
    every: u64,
}

impl LogThrottle {
    pub const fn new(every: u64) -> Self {
        Self {
            count: AtomicU64::new(0),
            every,
        }
    }

    /// Record an event; returns whether it should be logged.
    pub fn should_log(&self) -> bool {
        let n = self.count.fetch_add(1, Ordering::Relaxed);
        self.every <= 1 || n % self.every == 0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Hex rendering of the first `max` bytes, for protocol diagnostics.
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let shown = &data[..data.len().min(max)];
    let mut out = String::with_capacity(shown.len() * 3);
    for (i, byte) in shown.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    if data.len() > max {
        out.push_str(" ..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_shutdown_wakes_sleeper() {
        let shutdown = Shutdown::new();
        let sleeper = shutdown.clone();

        let start = Instant::now();
        let handle = thread::spawn(move || sleeper.sleep(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();

        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_trigger_from_ctrl_c_style_task() {
        let shutdown = Shutdown::new();
        let sleeper = shutdown.clone();
        let blocked = tokio::task::spawn_blocking(move || sleeper.sleep(Duration::from_secs(10)));

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        })
        .await
        .unwrap();

        assert!(blocked.await.unwrap());
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn test_sleep_times_out_without_trigger() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_throttle() {
        let throttle = LogThrottle::new(3);
        let logged: Vec<bool> = (0..7).map(|_| throttle.should_log()).collect();
        assert_eq!(logged, vec![true, false, false, true, false, false, true]);
        assert_eq!(throttle.count(), 7);
    }

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(&[0xde, 0xad, 0xbe, 0xef], 2), "de ad ..");
        assert_eq!(hex_preview(&[1, 2], 16), "01 02");
    }
}
