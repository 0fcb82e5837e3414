//! Rollups above the raw epoch level: fixed-grain buckets and rolling
//! windows.

pub mod bootstrap;
pub mod fixed;
pub mod rolling;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::clock::EpochTiming;
use crate::schema::EpochRange;
use crate::store::{GapDetector, Level, PartitionManager};

pub use bootstrap::{Bootstrap, BootstrapContext, BootstrapStrategy, TotalBootstrap, WindowBootstrap};
pub use fixed::{FixedCycle, FixedGrainAggregator, FixedSettings};
pub use rolling::{CycleOutcome, RollingAggregator, RollingGroup, Width};

/// How epochs are grouped into buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grain {
    /// Buckets of `width` epochs, shifted back by `offset` epochs.
    Epochs { width: u64, offset: u64 },
    /// UTC-aligned wall-clock buckets; an epoch belongs to the bucket its
    /// start time falls in.
    Calendar { width: Duration, timing: EpochTiming },
}

impl Grain {
    /// One bucket per epoch.
    pub const RAW: Grain = Grain::Epochs {
        width: 1,
        offset: 0,
    };

    pub fn epochs(width: u64, offset: u64) -> Result<Self> {
        if width == 0 {
            bail!("bucket width must be > 0");
        }
        Ok(Grain::Epochs { width, offset })
    }

    pub fn calendar(width: Duration, timing: EpochTiming) -> Result<Self> {
        if width.as_secs() == 0 {
            bail!("calendar bucket width must be at least one second");
        }
        Ok(Grain::Calendar { width, timing })
    }

    /// Wall-clock grain of a stored level.
    pub fn for_level(level: Level, timing: EpochTiming) -> Self {
        match level {
            Level::Epoch => Grain::RAW,
            Level::Hourly | Level::Daily => Grain::Calendar {
                width: level.bucket_duration(),
                timing,
            },
        }
    }

    /// The bucket containing `epoch`.
    pub fn bucket(&self, epoch: u64) -> EpochRange {
        match *self {
            Grain::Epochs { width, offset } => {
                let index = (epoch + offset) / width;
                EpochRange::new(
                    (index * width).saturating_sub(offset),
                    (index + 1) * width - offset,
                )
            }
            Grain::Calendar { width, timing } => {
                let w = width.as_secs();
                let t = timing.epoch_start_unix(epoch);
                let boundary = t - t % w;
                EpochRange::new(
                    timing.first_epoch_at_or_after(boundary),
                    timing.first_epoch_at_or_after(boundary + w),
                )
            }
        }
    }

    /// Upper bound on the number of epochs in one bucket.
    pub fn max_width(&self) -> u64 {
        match *self {
            Grain::Epochs { width, .. } => width,
            Grain::Calendar { width, timing } => timing.epochs_covering(width) + 1,
        }
    }
}

/// A stored level together with everything needed to read it.
#[derive(Debug, Clone)]
pub struct Tier {
    pub level: Level,
    pub grain: Grain,
    pub partitions: Arc<PartitionManager>,
    /// Retention in epochs, if any.
    pub retention: Option<u64>,
}

impl Tier {
    pub fn new(level: Level, grain: Grain, partitions: Arc<PartitionManager>, retention: Option<u64>) -> Self {
        Self {
            level,
            grain,
            partitions,
            retention,
        }
    }

    /// Highest epoch such that everything from `from` up to it is present
    /// at this tier.
    pub async fn frontier(&self, gaps: &GapDetector, from: u64) -> Result<Option<u64>> {
        match self.level {
            Level::Epoch => gaps.epoch_frontier(from).await,
            level => gaps.bucket_frontier(level, from).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_grain() {
        let g = Grain::epochs(4, 0).expect("grain");
        assert_eq!(g.bucket(0), EpochRange::new(0, 4));
        assert_eq!(g.bucket(7), EpochRange::new(4, 8));

        let shifted = Grain::epochs(4, 1).expect("grain");
        assert_eq!(shifted.bucket(0), EpochRange::new(0, 3));
        assert_eq!(shifted.bucket(3), EpochRange::new(3, 7));
        assert_eq!(shifted.bucket(6), EpochRange::new(3, 7));

        assert_eq!(Grain::RAW.bucket(9), EpochRange::new(9, 10));
        assert!(Grain::epochs(0, 0).is_err());
    }

    #[test]
    fn test_calendar_grain_aligns_to_utc_hours() {
        // Genesis at 00:00:00 UTC, 384 second epochs.
        let timing = EpochTiming::new(1_606_824_000, 12, 32).expect("timing");
        let hourly = Grain::for_level(Level::Hourly, timing);

        // Epochs starting in [00:00, 01:00): 0..=9 (epoch 9 starts at 57:36).
        assert_eq!(hourly.bucket(0), EpochRange::new(0, 10));
        assert_eq!(hourly.bucket(9), EpochRange::new(0, 10));
        // Epoch 10 starts at 01:04:00.
        assert_eq!(hourly.bucket(10), EpochRange::new(10, 19));

        let daily = Grain::for_level(Level::Daily, timing);
        assert_eq!(daily.bucket(0), EpochRange::new(0, 225));
        assert_eq!(daily.bucket(225), EpochRange::new(225, 450));
        assert_eq!(hourly.max_width(), 11);
    }

    #[test]
    fn test_calendar_buckets_nest() {
        let timing = EpochTiming::new(1_606_824_023, 12, 32).expect("timing");
        let hourly = Grain::for_level(Level::Hourly, timing);
        let daily = Grain::for_level(Level::Daily, timing);

        for epoch in [0, 224, 225, 226, 1_000, 10_000] {
            let day = daily.bucket(epoch);
            assert_eq!(hourly.bucket(day.start).start, day.start, "epoch {epoch}");
            assert!(hourly.bucket(epoch).end <= day.end);
        }
    }
}
