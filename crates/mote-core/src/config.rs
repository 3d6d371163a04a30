//! Engine Configuration
//!
//! Retransmission, session admission and sweep settings for an endpoint.
//! Values can be built in code, loaded from TOML, and must pass `validate`
//! before an endpoint accepts them.

use crate::errors::{MoteError, Result};
use serde::{Deserialize, Serialize};

/// Largest accepted `resend_count`
pub const MAX_RESEND_COUNT: u8 = 8;

/// Top-level configuration for one endpoint context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transaction and codec settings
    pub transactions: TransactionConfig,

    /// Secure session admission and inactivity settings
    pub sessions: SessionConfig,

    /// Cadence, in milliseconds, at which the host calls `exec`
    pub exec_interval_ms: u64,
}

/// Transaction lifetime and codec tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Number of retransmissions the codec performs for confirmable messages
    pub resend_count: u8,

    /// Initial retransmission interval in seconds
    pub resend_interval_secs: u8,

    /// Duplicate detection history length; zero disables detection
    pub duplicate_buffer_size: u8,

    /// Blockwise transfer block size in bytes; zero disables blockwise
    pub block_size: u16,
}

/// Handshake retransmission timeout bounds handed to the handshake engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeTimeouts {
    /// Initial handshake retransmission timeout in milliseconds
    pub min_ms: u32,
    /// Upper bound for the backed-off handshake timeout in milliseconds
    pub max_ms: u32,
}

/// Secure session admission control and inactivity windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum number of sessions in the table, in any state
    pub max_sessions: u8,

    /// Maximum number of sessions simultaneously in handshake
    pub max_concurrent_handshakes: u8,

    /// Seconds a closed session lingers before being reclaimed
    pub closed_timeout_secs: u64,

    /// Seconds an established session may stay idle
    pub open_timeout_secs: u64,

    /// Seconds a handshake may go without progress
    pub ongoing_timeout_secs: u64,

    /// Default handshake timeouts for new sockets
    pub handshake_timeouts: HandshakeTimeouts,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transactions: TransactionConfig::default(),
            sessions: SessionConfig::default(),
            exec_interval_ms: 1000,
        }
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            resend_count: 3,
            resend_interval_secs: 10,
            duplicate_buffer_size: 0,
            block_size: 0,
        }
    }
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            min_ms: 10_000,
            max_ms: 60_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 3,
            max_concurrent_handshakes: 2,
            closed_timeout_secs: 3600,
            open_timeout_secs: 7200,
            ongoing_timeout_secs: 30,
            handshake_timeouts: HandshakeTimeouts::default(),
        }
    }
}

impl HandshakeTimeouts {
    /// Validate the bounds
    pub fn validate(&self) -> Result<()> {
        if self.min_ms == 0 {
            return Err(MoteError::invalid("handshake min timeout must be greater than 0"));
        }
        if self.min_ms > self.max_ms {
            return Err(MoteError::invalid(format!(
                "handshake min timeout {} exceeds max timeout {}",
                self.min_ms, self.max_ms
            )));
        }
        Ok(())
    }
}

impl TransactionConfig {
    /// Worst-case seconds the codec may still be retransmitting a message.
    ///
    /// Sums `interval * 2^k * 1.5` for the initial transmission and every
    /// retransmission (`k = 0..=resend_count`).
    pub fn worst_case_lifetime_secs(&self) -> u64 {
        let interval = u64::from(self.resend_interval_secs);
        (0..=u32::from(self.resend_count))
            .map(|k| {
                if interval == 0 {
                    return 0;
                }
                if interval.leading_zeros() < k {
                    return u64::MAX;
                }
                (interval << k).saturating_mul(3) / 2
            })
            .fold(0u64, u64::saturating_add)
    }

    /// Validate transaction settings
    pub fn validate(&self) -> Result<()> {
        if self.resend_count > MAX_RESEND_COUNT {
            return Err(MoteError::invalid(format!(
                "resend_count {} exceeds {MAX_RESEND_COUNT}",
                self.resend_count
            )));
        }
        if self.resend_interval_secs == 0 && self.resend_count > 0 {
            return Err(MoteError::invalid(
                "resend_interval_secs must be greater than 0 when resending",
            ));
        }
        if self.block_size != 0
            && (!self.block_size.is_power_of_two() || !(16..=1024).contains(&self.block_size))
        {
            return Err(MoteError::invalid(format!(
                "block_size {} must be a power of two between 16 and 1024",
                self.block_size
            )));
        }
        Ok(())
    }
}

impl SessionConfig {
    /// Validate session limits
    pub fn validate(&self) -> Result<()> {
        if self.max_sessions == 0 {
            return Err(MoteError::invalid("max_sessions must be greater than 0"));
        }
        if self.max_concurrent_handshakes == 0 {
            return Err(MoteError::invalid(
                "max_concurrent_handshakes must be greater than 0",
            ));
        }
        if self.max_concurrent_handshakes > self.max_sessions {
            return Err(MoteError::invalid(format!(
                "max_concurrent_handshakes {} exceeds max_sessions {}",
                self.max_concurrent_handshakes, self.max_sessions
            )));
        }
        self.handshake_timeouts.validate()
    }
}

impl EngineConfig {
    /// Configuration for tests: short windows, small tables
    pub fn testing() -> Self {
        Self {
            transactions: TransactionConfig {
                resend_count: 2,
                resend_interval_secs: 2,
                ..Default::default()
            },
            sessions: SessionConfig {
                max_sessions: 2,
                max_concurrent_handshakes: 2,
                closed_timeout_secs: 60,
                open_timeout_secs: 120,
                ongoing_timeout_secs: 10,
                handshake_timeouts: HandshakeTimeouts {
                    min_ms: 1000,
                    max_ms: 4000,
                },
            },
            exec_interval_ms: 1000,
        }
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        if self.exec_interval_ms == 0 {
            return Err(MoteError::invalid("exec_interval_ms must be greater than 0"));
        }
        self.transactions.validate()?;
        self.sessions.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_config_validates() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(EngineConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_worst_case_lifetime() {
        let config = TransactionConfig {
            resend_count: 3,
            resend_interval_secs: 10,
            ..Default::default()
        };
        // 15 + 30 + 60 + 120
        assert_eq!(config.worst_case_lifetime_secs(), 225);

        let no_resend = TransactionConfig {
            resend_count: 0,
            resend_interval_secs: 4,
            ..Default::default()
        };
        assert_eq!(no_resend.worst_case_lifetime_secs(), 6);
    }

    #[test]
    fn test_worst_case_lifetime_bounds() {
        let cases = [
            (0, 1, 1),
            (1, 1, 4),
            (MAX_RESEND_COUNT, 1, 766),
            (MAX_RESEND_COUNT, u8::MAX, 195_457),
        ];
        for (resend_count, resend_interval_secs, expected) in cases {
            let config = TransactionConfig {
                resend_count,
                resend_interval_secs,
                ..Default::default()
            };
            assert!(config.validate().is_ok());
            assert_eq!(
                config.worst_case_lifetime_secs(),
                expected,
                "count {resend_count} interval {resend_interval_secs}"
            );
        }

        let unchecked = TransactionConfig {
            resend_count: u8::MAX,
            resend_interval_secs: u8::MAX,
            ..Default::default()
        };
        assert_eq!(unchecked.worst_case_lifetime_secs(), u64::MAX);
    }

    #[test]
    fn test_resend_count_is_capped() {
        let config = TransactionConfig {
            resend_count: MAX_RESEND_COUNT + 1,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(MoteError::Invalid { .. }));

        let result =
            EngineConfig::from_toml_str("[transactions]\nresend_count = 64\nresend_interval_secs = 2\n");
        assert_matches!(result, Err(MoteError::Invalid { .. }));
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();

        config.sessions.max_concurrent_handshakes = config.sessions.max_sessions + 1;
        assert_matches!(config.validate(), Err(MoteError::Invalid { .. }));

        config.sessions = SessionConfig::default();
        config.sessions.handshake_timeouts = HandshakeTimeouts {
            min_ms: 5000,
            max_ms: 1000,
        };
        assert!(config.validate().is_err());

        config.sessions = SessionConfig::default();
        config.transactions.block_size = 100;
        assert!(config.validate().is_err());

        config.transactions.block_size = 256;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = EngineConfig::from_toml_str(
            r#"
            exec_interval_ms = 500

            [sessions]
            max_sessions = 8
            max_concurrent_handshakes = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.exec_interval_ms, 500);
        assert_eq!(config.sessions.max_sessions, 8);
        assert_eq!(config.sessions.closed_timeout_secs, 3600);
        assert_eq!(config.transactions, TransactionConfig::default());
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let result = EngineConfig::from_toml_str("[sessions]\nmax_sessions = 0\n");
        assert_matches!(result, Err(MoteError::Invalid { .. }));

        let result = EngineConfig::from_toml_str("exec_interval_ms = \"fast\"");
        assert_matches!(result, Err(MoteError::Invalid { .. }));
    }
}
