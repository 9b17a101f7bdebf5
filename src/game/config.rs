//! Engine Configuration
//!
//! Defaults match the live game. Every field can be overridden from the
//! environment; unparsable or inconsistent values fall back to defaults.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::core::money::{Amount, Multiplier};
use crate::game::crash_point::CrashBounds;

/// Round engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Betting window before a round runs.
    pub countdown: Duration,
    /// Multiplier tick period.
    pub tick_interval: Duration,
    /// Multiplier growth in basis points per second (500 = 0.05x/s).
    pub growth_rate_bp: u32,
    /// Smallest accepted stake.
    pub min_bet: Amount,
    /// Largest accepted stake.
    pub max_bet: Amount,
    /// Crash point range.
    pub crash_bounds: CrashBounds,
    /// Pause after a crash before the next countdown.
    pub cooldown: Duration,
    /// Upper bound on any single wallet or repository call.
    pub collaborator_timeout: Duration,
    /// Delay before retrying a failed round creation.
    pub round_retry_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_millis(5000),
            tick_interval: Duration::from_millis(100),
            growth_rate_bp: 500,
            min_bet: Amount::from_units(10),
            max_bet: Amount::from_units(10_000),
            crash_bounds: CrashBounds::default(),
            cooldown: Duration::from_millis(5000),
            collaborator_timeout: Duration::from_millis(2000),
            round_retry_backoff: Duration::from_millis(3000),
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            countdown: env_millis("COUNTDOWN_DURATION", defaults.countdown),
            tick_interval: env_millis("TICK_INTERVAL_MS", defaults.tick_interval),
            growth_rate_bp: env_parse("GROWTH_RATE_BP", defaults.growth_rate_bp),
            min_bet: env_amount("MIN_BET", defaults.min_bet),
            max_bet: env_amount("MAX_BET", defaults.max_bet),
            crash_bounds: CrashBounds {
                min: env_multiplier("CRASH_POINT_MIN", defaults.crash_bounds.min),
                max: env_multiplier("CRASH_POINT_MAX", defaults.crash_bounds.max),
            },
            cooldown: env_millis("COOLDOWN_MS", defaults.cooldown),
            collaborator_timeout: env_millis("COLLABORATOR_TIMEOUT_MS", defaults.collaborator_timeout),
            round_retry_backoff: env_millis("ROUND_RETRY_BACKOFF_MS", defaults.round_retry_backoff),
        };

        config.validated()
    }

    /// Replace inconsistent settings with defaults.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();

        if !self.min_bet.is_positive() || self.min_bet > self.max_bet {
            warn!(
                "Invalid bet limits {}..{}, using {}..{}",
                self.min_bet, self.max_bet, defaults.min_bet, defaults.max_bet
            );
            self.min_bet = defaults.min_bet;
            self.max_bet = defaults.max_bet;
        }

        let bounds = self.crash_bounds;
        if bounds.min < Multiplier::ONE || bounds.min > bounds.max {
            warn!("Invalid crash bounds {}..{}, using defaults", bounds.min, bounds.max);
            self.crash_bounds = defaults.crash_bounds;
        }

        if self.tick_interval.is_zero() {
            warn!("Tick interval must be positive, using {:?}", defaults.tick_interval);
            self.tick_interval = defaults.tick_interval;
        }

        if self.growth_rate_bp == 0 {
            warn!("Growth rate must be positive, using {}bp/s", defaults.growth_rate_bp);
            self.growth_rate_bp = defaults.growth_rate_bp;
        }

        self
    }

    /// Whole countdown seconds announced to clients (at least one).
    pub fn countdown_seconds(&self) -> u32 {
        let millis = self.countdown.as_millis();
        (millis.div_ceil(1000).max(1)).min(u32::MAX as u128) as u32
    }
}

/// Parse an environment variable, warning and falling back on bad input.
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(name, default.as_millis() as u64))
}

fn env_amount(name: &str, default: Amount) -> Amount {
    let raw: f64 = env_parse(name, default.to_decimal());
    Amount::from_decimal(raw).unwrap_or(default)
}

fn env_multiplier(name: &str, default: Multiplier) -> Multiplier {
    let raw: f64 = env_parse(name, default.to_decimal());
    Multiplier::from_decimal(raw).unwrap_or(default)
}
