//! Reprovision loop guard.
//!
//! A reprovision that the next heartbeat still reports as drifted is counted.
//! Once `max_consecutive` such reprovisions have happened the guard suppresses
//! further attempts for a window of heartbeat ticks that doubles after every
//! attempt (1, 2, 4, ... up to `max_backoff_ticks`), allowing one attempt
//! between windows. A heartbeat without drift resets everything.
//!
//! ```text
//! max_consecutive = 3
//! drift:  R R R S R S S R S S S S R ...
//! ```

use tracing::{error, info};

use crate::config::ReprovisionGuardConfig;

/// Reprovision loop guard state. Owned by the heartbeat loop.
#[derive(Debug, Clone)]
pub struct ReprovisionGuard {
    max_consecutive: u32,
    max_backoff_ticks: u32,
    consecutive: u32,
    backoff: u32,
    waiting: u32,
}

impl ReprovisionGuard {
    /// Fresh guard.
    #[must_use]
    pub fn new(config: ReprovisionGuardConfig) -> Self {
        Self {
            max_consecutive: config.max_consecutive,
            max_backoff_ticks: config.max_backoff_ticks.max(1),
            consecutive: 0,
            backoff: 0,
            waiting: 0,
        }
    }

    /// Reprovisions performed while drift persisted.
    #[must_use]
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    /// Drift reported; returns whether to reprovision on this tick.
    pub fn on_drift(&mut self) -> bool {
        if self.consecutive >= self.max_consecutive && self.backoff == 0 {
            self.backoff = 1;
            self.waiting = 1;
        }
        if self.waiting > 0 {
            self.waiting -= 1;
            error!(
                alert = true,
                consecutive = self.consecutive,
                window = self.backoff,
                remaining = self.waiting,
                "Config drift persists after reprovisioning; reprovision suppressed"
            );
            return false;
        }
        if self.consecutive >= self.max_consecutive {
            self.backoff = self.backoff.saturating_mul(2).min(self.max_backoff_ticks);
            self.waiting = self.backoff;
        }
        self.consecutive += 1;
        true
    }

    /// No drift reported.
    pub fn on_in_sync(&mut self) {
        if self.backoff > 0 {
            info!(attempts = self.consecutive, "Config drift resolved");
        }
        self.consecutive = 0;
        self.backoff = 0;
        self.waiting = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn guard(max_consecutive: u32, max_backoff_ticks: u32) -> ReprovisionGuard {
        ReprovisionGuard::new(ReprovisionGuardConfig {
            max_consecutive,
            max_backoff_ticks,
        })
    }

    fn pattern(g: &mut ReprovisionGuard, ticks: usize) -> String {
        (0..ticks)
            .map(|_| if g.on_drift() { 'R' } else { 'S' })
            .collect()
    }

    #[test]
    fn backs_off_exponentially_after_limit() {
        let mut g = guard(3, 32);
        assert_eq!(pattern(&mut g, 13), "RRRSRSSRSSSSR");
    }

    #[test]
    fn window_is_capped() {
        let mut g = guard(1, 2);
        // R, S(1), R, S S(2), R, S S(capped), R
        assert_eq!(pattern(&mut g, 10), "RSRSSRSSRS");
    }

    #[test]
    fn in_sync_resets() {
        let mut g = guard(2, 32);
        assert_eq!(pattern(&mut g, 3), "RRS");
        g.on_in_sync();
        assert_eq!(g.consecutive(), 0);
        assert_eq!(pattern(&mut g, 2), "RR");
    }
}
