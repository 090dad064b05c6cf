//! Adaptive pool sizing
//!
//! [`AdaptiveSizer`] is a synchronous state machine fed with utilization
//! samples (`active / total`). It moves the pool's target size between
//! `min_connections` and `max_connections`:
//! - above `high_water` for `sustain_samples` consecutive samples: grow by
//!   `grow_step`
//! - below `low_water` for `sustain_samples` consecutive samples: shrink by
//!   `shrink_step`
//!
//! At most one change per `cooldown`. The background task only samples and
//! applies decisions; shrinking never touches active connections.

use std::sync::Weak;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SizingSettings;
use crate::pool::PoolInner;

/// A target-size change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingDecision {
    /// Target grew
    Grow {
        /// Previous target
        from: usize,
        /// New target
        to: usize,
    },
    /// Target shrank
    Shrink {
        /// Previous target
        from: usize,
        /// New target
        to: usize,
    },
}

impl SizingDecision {
    /// The new target
    pub fn target(self) -> usize {
        match self {
            Self::Grow { to, .. } | Self::Shrink { to, .. } => to,
        }
    }
}

/// Utilization-driven target size state machine
#[derive(Debug, Clone)]
pub struct AdaptiveSizer {
    settings: SizingSettings,
    min: usize,
    max: usize,
    target: usize,
    high_streak: u32,
    low_streak: u32,
    last_change: Option<Instant>,
}

impl AdaptiveSizer {
    /// Create a sizer starting at `min`
    pub fn new(settings: SizingSettings, min: usize, max: usize) -> Self {
        Self {
            settings,
            min,
            max,
            target: min,
            high_streak: 0,
            low_streak: 0,
            last_change: None,
        }
    }

    /// Current target
    pub fn target(&self) -> usize {
        self.target
    }

    /// Feed one utilization sample
    pub fn observe(&mut self, utilization: f64, now: Instant) -> Option<SizingDecision> {
        if utilization > self.settings.high_water {
            self.high_streak += 1;
            self.low_streak = 0;
        } else if utilization < self.settings.low_water {
            self.low_streak += 1;
            self.high_streak = 0;
        } else {
            self.high_streak = 0;
            self.low_streak = 0;
        }

        let cooling = self
            .last_change
            .is_some_and(|at| now.saturating_duration_since(at) < self.settings.cooldown);
        if cooling {
            return None;
        }

        let sustain = self.settings.sustain_samples.max(1);
        let from = self.target;
        let decision = if self.high_streak >= sustain && from < self.max {
            let to = (from + self.settings.grow_step).min(self.max);
            Some(SizingDecision::Grow { from, to })
        } else if self.low_streak >= sustain && from > self.min {
            let to = from.saturating_sub(self.settings.shrink_step).max(self.min);
            Some(SizingDecision::Shrink { from, to })
        } else {
            None
        };

        if let Some(change) = decision {
            self.target = change.target();
            self.high_streak = 0;
            self.low_streak = 0;
            self.last_change = Some(now);
        }
        decision
    }
}

/// Sizer loop. Exits on cancellation or once the pool is dropped.
pub(crate) async fn run(
    pool: Weak<PoolInner>,
    cancel: CancellationToken,
    mut sizer: AdaptiveSizer,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pool) = pool.upgrade() else { break };
        let utilization = pool.utilization();
        if let Some(decision) = sizer.observe(utilization, Instant::now()) {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = pool.apply_sizing(decision) => {}
            }
        }
    }

    debug!("Adaptive sizer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SizingSettings {
        SizingSettings {
            cooldown: Duration::from_secs(10),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grows_after_sustained_load() {
        let mut sizer = AdaptiveSizer::new(settings(), 2, 10);
        let now = Instant::now();

        assert_eq!(sizer.observe(0.9, now), None);
        assert_eq!(sizer.observe(1.0, now), None);
        assert_eq!(
            sizer.observe(0.95, now),
            Some(SizingDecision::Grow { from: 2, to: 4 })
        );
        assert_eq!(sizer.target(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_streak_does_not_grow() {
        let mut sizer = AdaptiveSizer::new(settings(), 2, 10);
        let now = Instant::now();

        sizer.observe(0.9, now);
        sizer.observe(0.9, now);
        sizer.observe(0.5, now);
        assert_eq!(sizer.observe(0.9, now), None);
        assert_eq!(sizer.target(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_between_changes() {
        let mut sizer = AdaptiveSizer::new(settings(), 2, 10);
        let start = Instant::now();

        for _ in 0..3 {
            sizer.observe(1.0, start);
        }
        assert_eq!(sizer.target(), 4);

        // sustained, but cooling down
        for _ in 0..5 {
            assert_eq!(sizer.observe(1.0, start + Duration::from_secs(5)), None);
        }

        let later = start + Duration::from_secs(10);
        assert_eq!(
            sizer.observe(1.0, later),
            Some(SizingDecision::Grow { from: 4, to: 6 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clamped_to_bounds() {
        let mut sizer = AdaptiveSizer::new(
            SizingSettings {
                cooldown: Duration::ZERO,
                sustain_samples: 1,
                grow_step: 5,
                ..Default::default()
            },
            2,
            4,
        );
        let now = Instant::now();

        assert_eq!(
            sizer.observe(1.0, now),
            Some(SizingDecision::Grow { from: 2, to: 4 })
        );
        assert_eq!(sizer.observe(1.0, now), None);

        assert_eq!(
            sizer.observe(0.0, now),
            Some(SizingDecision::Shrink { from: 4, to: 3 })
        );
        assert_eq!(
            sizer.observe(0.0, now),
            Some(SizingDecision::Shrink { from: 3, to: 2 })
        );
        assert_eq!(sizer.observe(0.0, now), None);
        assert_eq!(sizer.target(), 2);
    }
}
