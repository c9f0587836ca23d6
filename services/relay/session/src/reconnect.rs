//! Reconnection policy: whether and when a dropped session comes back

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default wait before a reconnection attempt
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Reason the transport reported for ending a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The account was intentionally signed out, confirmed by the server
    LoggedOut,
    /// Credentials were rejected as invalid or corrupted
    AuthFailure,
    /// The connection dropped without a protocol-level reason
    ConnectionLost,
    /// The server closed an idle connection
    IdleTimeout,
    /// The server asked the client to reconnect
    ServerRestart,
    /// Another client took over the session slot
    Replaced,
    /// Anything the transport reports that this taxonomy does not know
    Other(String),
}

impl DisconnectReason {
    /// Whether this reason ends the session for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut | DisconnectReason::AuthFailure)
    }

    /// Whether the credential record must be purged along with the session
    pub fn purges_credentials(&self) -> bool {
        self.is_terminal()
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LoggedOut => write!(f, "logged out"),
            DisconnectReason::AuthFailure => write!(f, "authentication failure"),
            DisconnectReason::ConnectionLost => write!(f, "connection lost"),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
            DisconnectReason::ServerRestart => write!(f, "server restart"),
            DisconnectReason::Replaced => write!(f, "replaced by another client"),
            DisconnectReason::Other(detail) => write!(f, "other: {}", detail),
        }
    }
}

/// Outcome of a policy decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectDecision {
    /// Whether to schedule another connection attempt
    pub reconnect: bool,
    /// How long to wait before that attempt
    pub delay: Duration,
}

/// Decides, from a disconnect reason, whether to retry and how long to wait.
///
/// Retries carry a fixed delay and continue indefinitely; there is no backoff
/// and no attempt cap. Only a server-confirmed logout or an authentication
/// rejection stops the session for good. Unrecognized reasons fail open
/// toward retry.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectPolicy {
    delay: Duration,
}

impl ReconnectPolicy {
    /// Policy with a custom retry delay
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Decide for the given reason. Never fails.
    pub fn decide(&self, reason: &DisconnectReason) -> ReconnectDecision {
        ReconnectDecision {
            reconnect: !reason.is_terminal(),
            delay: self.delay,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logout_stops_for_good() {
        let policy = ReconnectPolicy::default();
        let decision = policy.decide(&DisconnectReason::LoggedOut);
        assert!(!decision.reconnect);
        assert!(DisconnectReason::LoggedOut.purges_credentials());
    }

    #[test]
    fn test_auth_failure_stops_and_purges() {
        let policy = ReconnectPolicy::default();
        let decision = policy.decide(&DisconnectReason::AuthFailure);
        assert!(!decision.reconnect);
        assert!(DisconnectReason::AuthFailure.purges_credentials());
    }

    #[test]
    fn test_transient_reasons_retry_with_fixed_delay() {
        let policy = ReconnectPolicy::new(Duration::from_secs(5));
        for reason in [
            DisconnectReason::ConnectionLost,
            DisconnectReason::IdleTimeout,
            DisconnectReason::ServerRestart,
            DisconnectReason::Replaced,
        ] {
            let decision = policy.decide(&reason);
            assert!(decision.reconnect, "{} should retry", reason);
            assert_eq!(decision.delay, Duration::from_secs(5));
            assert!(!reason.purges_credentials());
        }
    }

    #[test]
    fn test_unknown_reason_fails_open_toward_retry() {
        let policy = ReconnectPolicy::default();
        let reason = DisconnectReason::Other("stream error 503".to_string());
        assert!(policy.decide(&reason).reconnect);
    }
}
