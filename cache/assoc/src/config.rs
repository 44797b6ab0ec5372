//! Configuration for the index and its maintenance thread.

use crate::error::{AssocError, AssocResult};
use serde::Deserialize;

/// Default hash power (2^16 = 64K buckets).
pub const DEFAULT_HASH_POWER: u8 = 16;

/// Smallest supported hash power.
pub const MIN_HASH_POWER: u8 = 4;

/// Largest supported hash power. Hashes are 32 bits wide, so a wider mask
/// would select nothing new.
pub const MAX_HASH_POWER: u8 = 32;

/// Default number of bucket lock shards (2^12).
pub const DEFAULT_LOCK_POWER: u8 = 12;

/// Largest supported lock power.
pub const MAX_LOCK_POWER: u8 = 24;

/// Default number of buckets migrated per scheduling quantum.
pub const DEFAULT_BULK_MOVE: usize = 1;

/// Environment variable overriding [`Config::bulk_move`] at startup.
pub const BULK_MOVE_ENV: &str = "ASSOC_HASH_BULK_MOVE";

/// Index configuration.
///
/// Usually embedded in the server's TOML config as an `[assoc]` table.
///
/// ```toml
/// hash_power = 20
/// hash_power_max = 28
/// bulk_move = 4
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Initial hash power. `0` selects [`DEFAULT_HASH_POWER`].
    #[serde(default)]
    pub hash_power: u8,

    /// Expansion stops once the table reaches this power.
    #[serde(default = "default_hash_power_max")]
    pub hash_power_max: u8,

    /// Log2 of the number of bucket lock shards. Clamped to the initial hash
    /// power so one lock always covers whole buckets.
    #[serde(default = "default_lock_power")]
    pub lock_power: u8,

    /// Buckets migrated per scheduling quantum while expanding.
    #[serde(default = "default_bulk_move")]
    pub bulk_move: usize,

    /// Optional ceiling on bytes held by bucket arrays. An expansion that
    /// would exceed it fails like an allocation failure.
    #[serde(default)]
    pub hash_bytes_limit: Option<usize>,
}

fn default_hash_power_max() -> u8 {
    MAX_HASH_POWER
}

fn default_lock_power() -> u8 {
    DEFAULT_LOCK_POWER
}

fn default_bulk_move() -> usize {
    DEFAULT_BULK_MOVE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_power: 0,
            hash_power_max: MAX_HASH_POWER,
            lock_power: DEFAULT_LOCK_POWER,
            bulk_move: DEFAULT_BULK_MOVE,
            hash_bytes_limit: None,
        }
    }
}

impl Config {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial hash power. `0` keeps the default.
    pub fn with_hash_power(mut self, power: u8) -> Self {
        self.hash_power = power;
        self
    }

    /// Set the maximum hash power.
    pub fn with_hash_power_max(mut self, power: u8) -> Self {
        self.hash_power_max = power;
        self
    }

    /// Set the log2 of the lock shard count.
    pub fn with_lock_power(mut self, power: u8) -> Self {
        self.lock_power = power;
        self
    }

    /// Set the migration batch size.
    pub fn with_bulk_move(mut self, buckets: usize) -> Self {
        self.bulk_move = buckets;
        self
    }

    /// Cap the bytes held by bucket arrays.
    pub fn with_hash_bytes_limit(mut self, bytes: usize) -> Self {
        self.hash_bytes_limit = Some(bytes);
        self
    }

    /// The initial hash power after resolving the default.
    pub fn initial_power(&self) -> u8 {
        if self.hash_power == 0 {
            DEFAULT_HASH_POWER
        } else {
            self.hash_power
        }
    }

    /// The lock power actually used.
    pub fn effective_lock_power(&self) -> u8 {
        self.lock_power
            .min(self.initial_power())
            .min(MAX_LOCK_POWER)
    }

    /// Migration batch size, never zero.
    pub fn effective_bulk_move(&self) -> usize {
        self.bulk_move.max(1)
    }

    /// Check that the config describes a usable table.
    pub fn validate(&self) -> AssocResult<()> {
        let power = self.initial_power();
        if !(MIN_HASH_POWER..=MAX_HASH_POWER).contains(&power) {
            return Err(AssocError::InvalidConfig {
                reason: format!(
                    "hash_power must be {}-{}, got {}",
                    MIN_HASH_POWER, MAX_HASH_POWER, power
                ),
            });
        }
        if self.hash_power_max < power || self.hash_power_max > MAX_HASH_POWER {
            return Err(AssocError::InvalidConfig {
                reason: format!(
                    "hash_power_max must be {}-{}, got {}",
                    power, MAX_HASH_POWER, self.hash_power_max
                ),
            });
        }
        Ok(())
    }
}

/// Read the migration batch size from [`BULK_MOVE_ENV`].
///
/// Returns `None` if the variable is unset.
pub fn bulk_move_from_env() -> Option<usize> {
    std::env::var(BULK_MOVE_ENV)
        .ok()
        .map(|value| parse_bulk_move(&value))
}

/// Parse a batch size. Unparsable or zero values fall back to the default.
pub fn parse_bulk_move(value: &str) -> usize {
    match value.trim().parse::<usize>() {
        Ok(0) | Err(_) => DEFAULT_BULK_MOVE,
        Ok(n) => n,
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.initial_power(), DEFAULT_HASH_POWER);
        assert_eq!(config.effective_lock_power(), DEFAULT_LOCK_POWER);
        assert_eq!(config.effective_bulk_move(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hint_overrides_default() {
        let config = Config::new().with_hash_power(4);
        assert_eq!(config.initial_power(), 4);
        // lock shards never outnumber initial buckets
        assert_eq!(config.effective_lock_power(), 4);
    }

    #[test]
    fn test_validate_rejects_bad_powers() {
        assert!(Config::new().with_hash_power(3).validate().is_err());
        assert!(Config::new().with_hash_power(33).validate().is_err());
        assert!(
            Config::new()
                .with_hash_power(10)
                .with_hash_power_max(8)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_parse_bulk_move() {
        assert_eq!(parse_bulk_move("16"), 16);
        assert_eq!(parse_bulk_move(" 2 "), 2);
        assert_eq!(parse_bulk_move("0"), DEFAULT_BULK_MOVE);
        assert_eq!(parse_bulk_move("-3"), DEFAULT_BULK_MOVE);
        assert_eq!(parse_bulk_move("lots"), DEFAULT_BULK_MOVE);
        assert_eq!(parse_bulk_move(""), DEFAULT_BULK_MOVE);
    }

    #[test]
    fn test_zero_bulk_move_clamped() {
        assert_eq!(Config::new().with_bulk_move(0).effective_bulk_move(), 1);
    }

    #[test]
    fn test_deserialize() {
        let config: Config = toml::from_str(
            r#"
            hash_power = 20
            bulk_move = 8
            hash_bytes_limit = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(config.initial_power(), 20);
        assert_eq!(config.hash_power_max, MAX_HASH_POWER);
        assert_eq!(config.bulk_move, 8);
        assert_eq!(config.hash_bytes_limit, Some(1 << 20));

        let bad: Result<Config, _> = toml::from_str("hashpower = 20");
        assert!(bad.is_err());
    }
}
