//! Entry type shared by the in-process backends.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::value::Body;

/// Absolute deadline for a TTL. `None` or zero never expires.
pub fn deadline(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl.filter(|d| !d.is_zero())?;
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Some(Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

/// True once `expires_at` is in the past.
pub fn is_past(expires_at: Option<DateTime<Utc>>) -> bool {
    expires_at.is_some_and(|exp| Utc::now() >= exp)
}

/// A body with an optional absolute expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub body: Body,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    pub fn new(body: Body, ttl: Option<Duration>) -> Self {
        Self {
            body,
            expires_at: deadline(ttl),
        }
    }

    /// Replaces the body and keeps the current deadline.
    pub fn with_body(&self, body: Body) -> Self {
        Self {
            body,
            expires_at: self.expires_at,
        }
    }

    pub fn is_expired(&self) -> bool {
        is_past(self.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_ttl_never_expires() {
        assert_eq!(deadline(None), None);
        assert_eq!(deadline(Some(Duration::ZERO)), None);
        assert!(!Entry::new(Body::from("v"), Some(Duration::ZERO)).is_expired());
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let far = deadline(Some(Duration::from_secs(u64::MAX))).unwrap();
        assert!(far > Utc::now());
    }

    #[test]
    fn test_past_deadline_is_expired() {
        let entry = Entry {
            body: Body::from(1),
            expires_at: Some(Utc::now() - chrono::Duration::seconds(1)),
        };
        assert!(entry.is_expired());
        let kept = entry.with_body(Body::from(2));
        assert_eq!(kept.expires_at, entry.expires_at);
    }
}
