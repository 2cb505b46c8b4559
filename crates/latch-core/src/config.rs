//! Channel configuration shared by clients and servers.

use std::path::Path;
use std::time::Duration;

use latch_crypto::{HandshakePattern, NonceMode, SequenceWindow};
use serde::{Deserialize, Serialize};

use crate::channel_id::IdScheme;
use crate::codec::Codec;
use crate::error::{Error, Result};

pub const DEFAULT_MAX_SESSIONS: usize = 4096;
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 16;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5000;

/// Everything both ends must agree on, plus server-side limits.
///
/// Loadable from JSON; missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub pattern: HandshakePattern,
    pub id_scheme: IdScheme,
    pub codec: Codec,
    pub nonce_mode: NonceMode,
    /// Upper bound on live channels in one registry.
    pub max_sessions: usize,
    /// Idle channels are dropped after this many seconds (0 disables).
    pub idle_timeout_secs: u64,
    /// Decrypt failures before a channel is torn down (0 disables).
    pub max_auth_failures: u32,
    pub handshake_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pattern: HandshakePattern::default(),
            id_scheme: IdScheme::default(),
            codec: Codec::default(),
            nonce_mode: NonceMode::default(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl ChannelConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot produce a working channel.
    pub fn validate(&self) -> Result<()> {
        if self.codec.requires_transport_id() && self.id_scheme != IdScheme::Transport {
            return Err(Error::config(format!(
                "codec {:?} carries no identifier and needs the transport id scheme",
                self.codec
            )));
        }
        if self.codec == Codec::Envelope && self.id_scheme == IdScheme::Transport {
            return Err(Error::config(
                "envelope codec carries its own identifier and cannot use the transport id scheme",
            ));
        }
        if self.max_sessions == 0 {
            return Err(Error::config("max_sessions must be at least 1"));
        }
        if let Some(capacity) = self.id_scheme.capacity() {
            if self.max_sessions as u64 > capacity {
                return Err(Error::config(format!(
                    "max_sessions {} exceeds the {} ids available to {:?}",
                    self.max_sessions, capacity, self.id_scheme
                )));
            }
        }
        if let NonceMode::Explicit { window } = self.nonce_mode {
            if window == 0 || window > SequenceWindow::MAX_SIZE {
                return Err(Error::config(format!(
                    "replay window must be 1-{}, got {window}",
                    SequenceWindow::MAX_SIZE
                )));
            }
        }
        if self.handshake_timeout_ms == 0 {
            return Err(Error::config("handshake_timeout_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ChannelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(60)));

        let config = ChannelConfig {
            idle_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_token_reuse_needs_transport_ids() {
        let config = ChannelConfig {
            codec: Codec::TokenReuse,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ChannelConfig {
            codec: Codec::TokenReuse,
            id_scheme: IdScheme::Transport,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_random16_capacity() {
        let config = ChannelConfig {
            max_sessions: 70_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ChannelConfig {
            max_sessions: 70_000,
            id_scheme: IdScheme::Random32,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_window_bounds() {
        for (window, ok) in [(0, false), (1, true), (128, true), (129, false)] {
            let config = ChannelConfig {
                nonce_mode: NonceMode::Explicit { window },
                ..Default::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "window {window}");
        }
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latch.json");
        std::fs::write(
            &path,
            r#"{"pattern":"nk","id_scheme":"random32","nonce_mode":{"mode":"explicit","window":32}}"#,
        )
        .unwrap();

        let config = ChannelConfig::from_json_file(&path).unwrap();
        assert_eq!(config.pattern, HandshakePattern::Nk);
        assert_eq!(config.id_scheme, IdScheme::Random32);
        assert_eq!(config.nonce_mode, NonceMode::Explicit { window: 32 });
        assert_eq!(config.max_sessions, DEFAULT_MAX_SESSIONS);
    }
}
