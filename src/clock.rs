//! Time controls and per-color clocks.
//!
//! Clocks are not ticked by a background task. The session debits the
//! mover with the wall time elapsed since the previous commit, so the only
//! state kept here is the remaining budget of each side.

use crate::types::Color;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// Base budget plus Fischer increment, e.g. `5+3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeControl {
    /// Starting budget per side, in seconds.
    pub base_secs: u32,
    /// Seconds credited to the mover after each committed move.
    pub increment_secs: u32,
}

impl TimeControl {
    pub const fn new(base_secs: u32, increment_secs: u32) -> Self {
        Self {
            base_secs,
            increment_secs,
        }
    }

    /// Parses a `minutes+increment` preset, falling back to `5+0` for
    /// anything unrecognised.
    pub fn parse_or_default(label: Option<&str>) -> Self {
        label
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

impl Default for TimeControl {
    /// Five minutes, no increment.
    fn default() -> Self {
        Self::new(300, 0)
    }
}

impl FromStr for TimeControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (minutes, increment) = s
            .trim()
            .split_once('+')
            .ok_or_else(|| format!("expected minutes+increment, got '{s}'"))?;

        let minutes: u32 = minutes
            .trim()
            .parse()
            .map_err(|_| format!("invalid minutes in '{s}'"))?;
        let increment: u32 = increment
            .trim()
            .parse()
            .map_err(|_| format!("invalid increment in '{s}'"))?;

        if minutes == 0 || minutes > 180 || increment > 60 {
            return Err(format!("time control '{s}' out of range"));
        }

        Ok(Self::new(minutes * 60, increment))
    }
}

impl fmt::Display for TimeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.base_secs / 60, self.increment_secs)
    }
}

/// Remaining seconds for each side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Clocks {
    pub white: f64,
    pub black: f64,
}

impl Clocks {
    /// Both sides start with the full base budget.
    pub fn new(tc: TimeControl) -> Self {
        let base = f64::from(tc.base_secs);
        Self {
            white: base,
            black: base,
        }
    }

    pub fn remaining(&self, color: Color) -> f64 {
        match color {
            Color::White => self.white,
            Color::Black => self.black,
        }
    }

    fn slot(&mut self, color: Color) -> &mut f64 {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }

    /// Subtracts elapsed time from `color`. Returns `false` if the clock ran
    /// out, in which case it is clamped to exactly zero.
    pub fn debit(&mut self, color: Color, elapsed_secs: f64) -> bool {
        let slot = self.slot(color);
        *slot -= elapsed_secs.max(0.0);
        if *slot <= 0.0 {
            *slot = 0.0;
            false
        } else {
            true
        }
    }

    pub fn credit(&mut self, color: Color, secs: u32) {
        *self.slot(color) += f64::from(secs);
    }

    /// Flags `color` as having lost on time.
    pub fn exhaust(&mut self, color: Color) {
        *self.slot(color) = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_parse() {
        assert_eq!("3+2".parse::<TimeControl>(), Ok(TimeControl::new(180, 2)));
        assert_eq!("5+0".parse::<TimeControl>(), Ok(TimeControl::new(300, 0)));
        assert_eq!("5+5".parse::<TimeControl>(), Ok(TimeControl::new(300, 5)));
        assert_eq!("15+10".parse::<TimeControl>(), Ok(TimeControl::new(900, 10)));
    }

    #[test]
    fn test_unknown_preset_falls_back_to_five_minutes() {
        assert_eq!(TimeControl::parse_or_default(Some("blitz")), TimeControl::new(300, 0));
        assert_eq!(TimeControl::parse_or_default(Some("0+5")), TimeControl::new(300, 0));
        assert_eq!(TimeControl::parse_or_default(None), TimeControl::new(300, 0));
        assert_eq!(TimeControl::new(180, 2).to_string(), "3+2");
    }

    #[test]
    fn test_debit_and_credit() {
        let mut clocks = Clocks::new(TimeControl::new(180, 2));
        assert!(clocks.debit(Color::White, 10.5));
        clocks.credit(Color::White, 2);
        assert_eq!(clocks.remaining(Color::White), 171.5);
        assert_eq!(clocks.remaining(Color::Black), 180.0);
    }

    #[test]
    fn test_debit_clamps_at_zero() {
        let mut clocks = Clocks::new(TimeControl::new(60, 0));
        assert!(!clocks.debit(Color::Black, 75.0));
        assert_eq!(clocks.remaining(Color::Black), 0.0);
        assert!(!clocks.debit(Color::White, 60.0));
        assert_eq!(clocks.remaining(Color::White), 0.0);
    }
}
