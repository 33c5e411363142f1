use crate::{
    error::{Error, Result},
    time::{expires_after, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one successful acquisition. Renew and release only ever act on
/// the record carrying the caller's token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One persisted lease row, keyed by `resource_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub resource_name: String,
    pub token: Token,
    pub expires_on: Timestamp,
    /// Milliseconds last used to compute `expires_on`.
    pub lock_duration_ms: i64,
}

impl LeaseRecord {
    /// A fresh record with a newly generated token. Fails if the expiry
    /// cannot be represented.
    pub fn acquire(resource_name: &str, now: Timestamp, lock_duration_ms: i64) -> Result<Self> {
        let expires_on = expires_after(now, lock_duration_ms).ok_or(Error::InvalidDuration {
            duration_ms: lock_duration_ms,
        })?;
        Ok(Self {
            resource_name: resource_name.to_string(),
            token: Token::generate(),
            expires_on,
            lock_duration_ms,
        })
    }

    pub fn is_valid(&self, now: Timestamp) -> bool {
        now < self.expires_on
    }

    /// True once `now` has passed `expires_on`; the lease may then be taken over.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_on < now
    }

    /// Whether a renewal with the given debounce window should touch the store.
    ///
    /// A window reaching past the earliest representable date is always due.
    pub fn due_for_renewal(&self, now: Timestamp, min_renew_interval_ms: i64) -> bool {
        match min_renew_interval_ms
            .checked_neg()
            .and_then(|back| expires_after(self.expires_on, back))
        {
            Some(threshold) => threshold < now,
            None => min_renew_interval_ms > 0,
        }
    }

    pub fn time_remaining(&self, now: Timestamp) -> chrono::Duration {
        if now < self.expires_on {
            self.expires_on.signed_duration_since(now)
        } else {
            chrono::Duration::zero()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{Clock, ManualClock};

    #[test]
    fn test_tokens_are_unique() {
        let a = LeaseRecord::acquire("job", chrono::Utc::now(), 1000).unwrap();
        let b = LeaseRecord::acquire("job", chrono::Utc::now(), 1000).unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_validity_window() {
        let clock = ManualClock::new();
        let record = LeaseRecord::acquire("job", clock.now(), 500).unwrap();

        assert!(record.is_valid(clock.now()));
        assert!(!record.is_expired(clock.now()));

        clock.advance_ms(500);
        // at exactly expires_on: no longer valid, not yet takeover-eligible
        assert!(!record.is_valid(clock.now()));
        assert!(!record.is_expired(clock.now()));

        clock.advance_ms(1);
        assert!(record.is_expired(clock.now()));
        assert_eq!(record.time_remaining(clock.now()), chrono::Duration::zero());
    }

    #[test]
    fn test_due_for_renewal() {
        let clock = ManualClock::new();
        let record = LeaseRecord::acquire("job", clock.now(), 1000).unwrap();

        assert!(!record.due_for_renewal(clock.now(), 250));
        clock.advance_ms(751);
        assert!(record.due_for_renewal(clock.now(), 250));
        assert!(record.due_for_renewal(clock.now(), 1000));
    }

    #[test]
    fn test_extreme_windows_do_not_overflow() {
        let clock = ManualClock::new();
        let record = LeaseRecord::acquire("job", clock.now(), 1000).unwrap();

        assert!(record.due_for_renewal(clock.now(), i64::MAX));
        assert!(!record.due_for_renewal(clock.now(), i64::MIN));
        assert!(!record.due_for_renewal(clock.now(), -i64::MAX));
    }

    #[test]
    fn test_unrepresentable_expiry_is_rejected() {
        let err = LeaseRecord::acquire("job", chrono::Utc::now(), 10_000_000_000_000_000).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidDuration {
                duration_ms: 10_000_000_000_000_000
            }
        ));
    }
}
