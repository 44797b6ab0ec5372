//! Error types for index construction and maintenance.

/// Errors reported by the index.
///
/// Foreground operations (find, insert, delete, iterate) never fail; these
/// errors come from construction, expansion and the maintenance thread.
#[derive(Debug, thiserror::Error)]
pub enum AssocError {
    /// A bucket array could not be allocated.
    ///
    /// Fatal during initialization. During expansion the table keeps serving
    /// at its previous capacity.
    #[error("failed to allocate hashtable with {buckets} buckets")]
    AllocationFailed {
        /// Number of buckets requested.
        buckets: usize,
    },

    /// The configuration cannot describe a valid table.
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },

    /// An expansion was requested while one is still migrating.
    #[error("hashtable expansion already in progress")]
    AlreadyExpanding,

    /// The table is already at its maximum hash power.
    #[error("hashtable at maximum hash power ({power})")]
    MaxHashPower {
        /// The current (and maximum) hash power.
        power: u8,
    },

    /// A maintenance thread is already running for this table.
    #[error("maintenance thread already running")]
    MaintenanceRunning,

    /// The maintenance thread could not be spawned.
    #[error("failed to spawn maintenance thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for index operations.
pub type AssocResult<T> = Result<T, AssocError>;

impl AssocError {
    /// Whether the table remains fully usable after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidConfig { .. } | Self::Spawn(_))
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            AssocError::AllocationFailed { buckets: 32 }.to_string(),
            "failed to allocate hashtable with 32 buckets"
        );
        assert_eq!(
            AssocError::AlreadyExpanding.to_string(),
            "hashtable expansion already in progress"
        );
        assert_eq!(
            AssocError::MaxHashPower { power: 32 }.to_string(),
            "hashtable at maximum hash power (32)"
        );
        assert_eq!(
            AssocError::InvalidConfig {
                reason: "bad".into()
            }
            .to_string(),
            "invalid config: bad"
        );
    }

    #[test]
    fn test_recoverable() {
        assert!(AssocError::AllocationFailed { buckets: 1 }.is_recoverable());
        assert!(AssocError::AlreadyExpanding.is_recoverable());
        assert!(
            !AssocError::InvalidConfig {
                reason: String::new()
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_spawn_from_io() {
        let err: AssocError = std::io::Error::other("no threads").into();
        assert!(matches!(err, AssocError::Spawn(_)));
        assert!(!err.is_recoverable());
    }
}
