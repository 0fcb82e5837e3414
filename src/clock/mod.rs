use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Callback invoked when the wall-clock epoch changes.
pub type EpochChangedFn = Box<dyn Fn(u64) + Send + Sync>;

/// Genesis-relative epoch arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochTiming {
    genesis_unix: u64,
    seconds_per_epoch: u64,
}

impl EpochTiming {
    pub fn new(genesis_unix: u64, seconds_per_slot: u64, slots_per_epoch: u64) -> Result<Self> {
        if seconds_per_slot == 0 {
            bail!("seconds_per_slot must be > 0");
        }

        if slots_per_epoch == 0 {
            bail!("slots_per_epoch must be > 0");
        }

        Ok(Self {
            genesis_unix,
            seconds_per_epoch: seconds_per_slot * slots_per_epoch,
        })
    }

    pub fn seconds_per_epoch(&self) -> u64 {
        self.seconds_per_epoch
    }

    /// Unix timestamp at which `epoch` begins.
    pub fn epoch_start_unix(&self, epoch: u64) -> u64 {
        self.genesis_unix + epoch * self.seconds_per_epoch
    }

    /// Epoch containing the unix timestamp (0 before genesis).
    pub fn epoch_at_unix(&self, unix: u64) -> u64 {
        unix.saturating_sub(self.genesis_unix) / self.seconds_per_epoch
    }

    /// First epoch that begins at or after the unix timestamp.
    pub fn first_epoch_at_or_after(&self, unix: u64) -> u64 {
        unix.saturating_sub(self.genesis_unix)
            .div_ceil(self.seconds_per_epoch)
    }

    /// Number of whole epochs in a duration.
    pub fn epochs_in(&self, d: Duration) -> u64 {
        d.as_secs() / self.seconds_per_epoch
    }

    /// Number of epochs needed to cover a duration.
    pub fn epochs_covering(&self, d: Duration) -> u64 {
        d.as_secs().div_ceil(self.seconds_per_epoch)
    }
}

/// Ethereum wall clock tracking the current epoch.
pub struct Clock {
    timing: EpochTiming,
    current_epoch: Arc<AtomicU64>,
    callbacks: Arc<parking_lot::Mutex<Vec<EpochChangedFn>>>,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock")
            .field("timing", &self.timing)
            .finish()
    }
}

impl Clock {
    /// Create a new clock from genesis parameters.
    pub fn new(
        genesis_time: SystemTime,
        seconds_per_slot: u64,
        slots_per_epoch: u64,
    ) -> Result<Self> {
        let genesis_unix = genesis_time
            .duration_since(UNIX_EPOCH)
            .context("genesis time before unix epoch")?
            .as_secs();
        let timing = EpochTiming::new(genesis_unix, seconds_per_slot, slots_per_epoch)?;

        Ok(Self {
            timing,
            current_epoch: Arc::new(AtomicU64::new(compute_current_epoch(&timing))),
            callbacks: Arc::new(parking_lot::Mutex::new(Vec::with_capacity(4))),
            running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn timing(&self) -> EpochTiming {
        self.timing
    }

    /// Return the current wall-clock epoch.
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    /// Register a callback that fires when the epoch changes.
    pub fn on_epoch_changed(&self, f: EpochChangedFn) {
        self.callbacks.lock().push(f);
    }

    /// Start the background epoch polling task.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let timing = self.timing;
        let current_epoch = Arc::clone(&self.current_epoch);
        let callbacks = Arc::clone(&self.callbacks);
        let cancel = self.cancel.clone();

        info!(
            genesis = timing.genesis_unix,
            seconds_per_epoch = timing.seconds_per_epoch,
            "clock started",
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("clock stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let new_epoch = compute_current_epoch(&timing);
                        let old_epoch = current_epoch.swap(new_epoch, Ordering::Relaxed);

                        if new_epoch != old_epoch {
                            debug!(epoch = new_epoch, "epoch changed");

                            let cbs = callbacks.lock();
                            for cb in cbs.iter() {
                                cb(new_epoch);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Stop the background task.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.running.store(false, Ordering::SeqCst);
    }
}

fn compute_current_epoch(timing: &EpochTiming) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();

    timing.epoch_at_unix(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAINNET_GENESIS: u64 = 1_606_824_023;

    fn mainnet() -> EpochTiming {
        EpochTiming::new(MAINNET_GENESIS, 12, 32).expect("valid params")
    }

    #[test]
    fn test_epoch_start_and_lookup() {
        let t = mainnet();
        assert_eq!(t.seconds_per_epoch(), 384);
        assert_eq!(t.epoch_start_unix(0), MAINNET_GENESIS);
        assert_eq!(t.epoch_start_unix(10), MAINNET_GENESIS + 3_840);
        assert_eq!(t.epoch_at_unix(MAINNET_GENESIS + 3_839), 9);
        assert_eq!(t.epoch_at_unix(MAINNET_GENESIS + 3_840), 10);
        assert_eq!(t.epoch_at_unix(0), 0);
    }

    #[test]
    fn test_first_epoch_at_or_after() {
        let t = mainnet();
        assert_eq!(t.first_epoch_at_or_after(MAINNET_GENESIS), 0);
        assert_eq!(t.first_epoch_at_or_after(MAINNET_GENESIS + 1), 1);
        assert_eq!(t.first_epoch_at_or_after(MAINNET_GENESIS + 384), 1);
        assert_eq!(t.first_epoch_at_or_after(MAINNET_GENESIS - 100), 0);
    }

    #[test]
    fn test_epochs_in_duration() {
        let t = mainnet();
        assert_eq!(t.epochs_in(Duration::from_secs(86_400)), 225);
        assert_eq!(t.epochs_in(Duration::from_secs(3_600)), 9);
        assert_eq!(t.epochs_covering(Duration::from_secs(3_600)), 10);
    }

    #[test]
    fn test_timing_rejects_zero_seconds_per_slot() {
        let result = EpochTiming::new(0, 0, 32);
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("seconds_per_slot"));
    }

    #[test]
    fn test_timing_rejects_zero_slots_per_epoch() {
        let result = EpochTiming::new(0, 12, 0);
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("slots_per_epoch"));
    }

    #[test]
    fn test_current_epoch_computation() {
        // Genesis 10 epochs and a bit ago.
        let genesis = SystemTime::now() - Duration::from_secs(10 * 384 + 5);
        let clock = Clock::new(genesis, 12, 32).expect("valid params");
        assert_eq!(clock.current_epoch(), 10);
    }

    #[test]
    fn test_current_epoch_before_genesis() {
        let genesis = SystemTime::now() + Duration::from_secs(3600);
        let clock = Clock::new(genesis, 12, 32).expect("valid params");
        assert_eq!(clock.current_epoch(), 0);
    }

    #[tokio::test]
    async fn test_clock_epoch_change_callback() {
        // One-second epochs: a boundary passes within any 1.6s window.
        let genesis = SystemTime::now() - Duration::from_millis(950);
        let clock = Clock::new(genesis, 1, 1).expect("valid params");

        let observed = Arc::new(AtomicU64::new(0));
        let observed_clone = Arc::clone(&observed);

        clock.on_epoch_changed(Box::new(move |epoch| {
            observed_clone.store(epoch, Ordering::Relaxed);
        }));

        clock.start();
        tokio::time::sleep(Duration::from_millis(1_600)).await;

        let epoch = observed.load(Ordering::Relaxed);
        assert!(epoch >= 1, "expected callback to fire, got epoch={epoch}");

        clock.stop();
    }
}
