//! Session configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pointmesh_game::GameConfig;
use pointmesh_transport::DEFAULT_LISTEN_TIMEOUT;
use tracing::warn;

/// Timing and persistence settings for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long `listen` may take before the session fails to start.
    pub listen_timeout: Duration,

    /// Delay before an automatic reveal once everyone has voted.
    pub reveal_debounce: Duration,

    /// Lifetime of a reaction.
    pub reaction_ttl: Duration,

    /// Shortest lifetime given to a late-arriving remote reaction.
    pub min_reaction_remaining: Duration,

    /// Transport liveness probe period.
    pub heartbeat_interval: Duration,

    /// Attempts to re-reach the bootstrap peer before giving up.
    pub reconnect_max_attempts: u32,

    /// First reconnection delay; doubled after every attempt.
    pub reconnect_base_delay: Duration,

    /// Where to keep the recovery snapshot. `None` keeps it in memory.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_timeout: DEFAULT_LISTEN_TIMEOUT,
            reveal_debounce: Duration::from_millis(500),
            reaction_ttl: Duration::from_millis(5000),
            min_reaction_remaining: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(5),
            reconnect_max_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            snapshot_path: None,
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `POINTMESH_*` environment variables.
    ///
    /// Durations are read as milliseconds. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_timeout: env_millis("POINTMESH_LISTEN_TIMEOUT_MS", defaults.listen_timeout),
            reveal_debounce: env_millis("POINTMESH_REVEAL_DEBOUNCE_MS", defaults.reveal_debounce),
            reaction_ttl: env_millis("POINTMESH_REACTION_TTL_MS", defaults.reaction_ttl),
            min_reaction_remaining: env_millis(
                "POINTMESH_MIN_REACTION_REMAINING_MS",
                defaults.min_reaction_remaining,
            ),
            heartbeat_interval: env_millis(
                "POINTMESH_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            reconnect_max_attempts: env_parse(
                "POINTMESH_RECONNECT_MAX_ATTEMPTS",
                defaults.reconnect_max_attempts,
            ),
            reconnect_base_delay: env_millis(
                "POINTMESH_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay,
            ),
            snapshot_path: std::env::var_os("POINTMESH_SNAPSHOT_PATH").map(PathBuf::from),
        }
    }

    pub fn with_listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout = timeout;
        self
    }

    pub fn with_reveal_debounce(mut self, debounce: Duration) -> Self {
        self.reveal_debounce = debounce;
        self
    }

    pub fn with_reaction_ttl(mut self, ttl: Duration) -> Self {
        self.reaction_ttl = ttl;
        self
    }

    /// Shortest lifetime a late remote reaction is still shown for.
    pub fn with_min_reaction_remaining(mut self, floor: Duration) -> Self {
        self.min_reaction_remaining = floor;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.reconnect_max_attempts = max_attempts;
        self.reconnect_base_delay = base_delay;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Timer settings for the game state machine.
    pub fn game_config(&self) -> GameConfig {
        GameConfig {
            reveal_debounce_ms: millis(self.reveal_debounce),
            reaction_ttl_ms: millis(self.reaction_ttl),
            min_reaction_remaining_ms: millis(self.min_reaction_remaining),
        }
    }

    /// Delay before reconnection attempt `attempt` (0-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.reconnect_base_delay.saturating_mul(factor)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring invalid {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, millis(default)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.listen_timeout, Duration::from_secs(10));
        assert_eq!(config.game_config(), GameConfig::default());
        assert_eq!(config.reconnect_max_attempts, 5);
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn reconnect_delay_doubles() {
        let config = SessionConfig::default().with_reconnect(5, Duration::from_millis(250));
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(250));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(4), Duration::from_millis(4000));
        assert!(config.reconnect_delay(40) >= config.reconnect_delay(4));
    }

    #[test]
    fn timing_builders_reach_the_game_config() {
        let game = SessionConfig::default()
            .with_reveal_debounce(Duration::from_millis(250))
            .with_reaction_ttl(Duration::from_secs(3))
            .with_min_reaction_remaining(Duration::from_millis(40))
            .game_config();
        assert_eq!(game.reveal_debounce_ms, 250);
        assert_eq!(game.reaction_ttl_ms, 3000);
        assert_eq!(game.min_reaction_remaining_ms, 40);
    }

    #[test]
    fn env_values_are_parsed_or_ignored() {
        std::env::set_var("POINTMESH_TEST_PARSE_OK", "42");
        std::env::set_var("POINTMESH_TEST_PARSE_BAD", "soon");
        assert_eq!(env_parse("POINTMESH_TEST_PARSE_OK", 1u32), 42);
        assert_eq!(env_parse("POINTMESH_TEST_PARSE_BAD", 7u32), 7);
        assert_eq!(env_parse("POINTMESH_TEST_PARSE_MISSING", 9u32), 9);
        assert_eq!(
            env_millis("POINTMESH_TEST_PARSE_OK", Duration::ZERO),
            Duration::from_millis(42)
        );
    }
}
