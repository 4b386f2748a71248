//! Runtime tunables for sessions and move throttling.

use crate::clock::TimeControl;
use std::time::Duration;

/// Lifecycle timings and session defaults.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a disconnected player keeps their seat in an active game.
    pub disconnect_grace: Duration,
    /// Idle time after which a finished session is reclaimed.
    pub finished_retention: Duration,
    /// Idle time after which an abandoned session is reclaimed.
    pub abandoned_retention: Duration,
    /// Idle time after which a waiting session nobody is connected to is reclaimed.
    pub waiting_retention: Duration,
    /// Period of the background reclamation sweep.
    pub reclaim_interval: Duration,
    /// Plies that must pass between two draw offers.
    pub draw_offer_min_plies: u32,
    /// Tolerance applied when judging a late time-up claim.
    pub time_up_tolerance: Duration,
    /// Base URL used to build invite links.
    pub public_url: String,
    /// Preset used when a join names none or an unknown one.
    pub default_time_control: TimeControl,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_secs(30),
            finished_retention: Duration::from_secs(60 * 60),
            abandoned_retention: Duration::from_secs(30 * 60),
            waiting_retention: Duration::from_secs(30 * 60),
            reclaim_interval: Duration::from_secs(60 * 60),
            draw_offer_min_plies: 5,
            time_up_tolerance: Duration::from_millis(1000),
            public_url: "http://localhost:8080".to_string(),
            default_time_control: TimeControl::default(),
        }
    }
}

impl SessionConfig {
    /// Link a second player can open to join `session_id`.
    pub fn invite_url(&self, session_id: &str) -> String {
        format!("{}/?gameId={}", self.public_url.trim_end_matches('/'), session_id)
    }
}

/// Per-connection move throttling.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum spacing between two moves from one connection.
    pub min_interval: Duration,
    /// Moves allowed per window.
    pub max_moves_per_window: u32,
    pub window: Duration,
    /// Entries untouched for this long are dropped by the sweep.
    pub stale_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_moves_per_window: 60,
            window: Duration::from_secs(60),
            stale_after: Duration::from_secs(60 * 60),
        }
    }
}
