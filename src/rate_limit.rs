//! Per-connection move throttling.
//!
//! Two limits apply: a minimum spacing between consecutive moves and a cap
//! on moves per window. Rejected moves are not counted.

use crate::config::RateLimitConfig;
use crate::error::{GameError, GameResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Throttle bookkeeping for one connection. Times are Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub last_move_at: u64,
    pub window_start: u64,
    pub moves_in_window: u32,
}

/// Tracks move cadence per connection.
#[derive(Debug, Default)]
pub struct MoveRateLimiter {
    config: RateLimitConfig,
    entries: HashMap<Uuid, RateLimitEntry>,
}

impl MoveRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// Records a move attempt from `conn` at `now`, or refuses it.
    pub fn check(&mut self, conn: Uuid, now: u64) -> GameResult<()> {
        let min_interval = self.config.min_interval.as_millis() as u64;
        let window = self.config.window.as_millis() as u64;

        let entry = self.entries.entry(conn).or_insert(RateLimitEntry {
            last_move_at: 0,
            window_start: now,
            moves_in_window: 0,
        });

        if entry.moves_in_window > 0 && now.saturating_sub(entry.last_move_at) < min_interval {
            log::warn!("Move rate limit exceeded by {conn}");
            return Err(GameError::RateLimited);
        }

        if now.saturating_sub(entry.window_start) > window {
            entry.moves_in_window = 0;
            entry.window_start = now;
        }

        if entry.moves_in_window >= self.config.max_moves_per_window {
            log::warn!("Moves per minute limit exceeded by {conn}");
            return Err(GameError::RateLimited);
        }

        entry.last_move_at = now;
        entry.moves_in_window += 1;
        Ok(())
    }

    /// Forgets a connection.
    pub fn purge(&mut self, conn: &Uuid) {
        self.entries.remove(conn);
    }

    /// Drops entries idle for longer than the configured staleness bound.
    /// Returns how many were removed.
    pub fn purge_stale(&mut self, now: u64) -> usize {
        let stale_after = self.config.stale_after.as_millis() as u64;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.last_move_at.max(entry.window_start)) <= stale_after);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
