//! Guard Verdicts and Error Types
//!
//! Rejections (rate limited, quota exceeded, nonce out of window, nonce
//! replay) are ordinary values. Misconfiguration and store failures are
//! errors: neither may be read as an accept or a reject.

use serde::{Deserialize, Serialize};

/// Result of a single guard evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The operation may proceed
    Accepted,
    /// The operation was refused
    Rejected(Rejection),
}

impl Verdict {
    /// Whether the operation may proceed
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    /// The rejection, if any
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Verdict::Accepted => None,
            Verdict::Rejected(rejection) => Some(rejection),
        }
    }
}

/// Expected, caller-recoverable refusals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    /// Too many operations in the current one-second bucket
    RateLimited {
        /// Bucket count after this attempt was recorded
        count: u64,
        /// Configured per-bucket limit
        limit: u64,
    },

    /// Rolling-window usage for an operation class is exhausted
    QuotaExceeded {
        class: String,
        used: u64,
        limit: u64,
    },

    /// Nonce too far from server time
    NonceOutOfWindow {
        /// Signed distance `now - nonce` in milliseconds
        skew_ms: i64,
        window_ms: i64,
    },

    /// Nonce is not strictly greater than the ledger's current maximum
    NonceReplay {
        ledger_id: String,
        nonce: i64,
        /// Maximum accepted nonce at decision time (`None` for an empty
        /// ledger or a conflict caught by the uniqueness constraint)
        max_nonce: Option<i64>,
    },
}

/// Store adapter failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Store could not be reached or the operation could not be completed
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Uniqueness constraint violated
    #[error("Store conflict: {0}")]
    Conflict(String),

    /// Stored data could not be interpreted
    #[error("Store data corrupt: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, _)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(err.to_string())
            }
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::InvalidColumnType(..) => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Guard failures that are neither an accept nor a reject
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// Invalid or absent numeric configuration; not retryable until fixed
    #[error("Misconfigured: {0}")]
    Misconfigured(String),

    /// The store outcome is indeterminate
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

/// Require a strictly positive configured limit
pub(crate) fn positive_limit(what: &str, value: i64) -> Result<u64, GuardError> {
    if value <= 0 {
        return Err(GuardError::Misconfigured(format!(
            "{} must be a positive integer, got {}",
            what, value
        )));
    }
    Ok(value as u64)
}

/// Parse a raw configured limit (e.g. from the environment)
pub fn parse_limit(what: &str, raw: &str) -> Result<i64, GuardError> {
    let value: i64 = raw.trim().parse().map_err(|_| {
        GuardError::Misconfigured(format!("{} is not an integer: {:?}", what, raw))
    })?;
    positive_limit(what, value)?;
    Ok(value)
}

/// Flat outcome label for the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    RateLimited,
    QuotaExceeded,
    NonceOutOfWindow,
    NonceReplay,
    Misconfigured,
    StoreUnavailable,
}

impl Outcome {
    /// Collapse a guard result into its outcome label
    pub fn from_result(result: &Result<Verdict, GuardError>) -> Self {
        match result {
            Ok(Verdict::Accepted) => Outcome::Accepted,
            Ok(Verdict::Rejected(rejection)) => Outcome::from(rejection),
            Err(GuardError::Misconfigured(_)) => Outcome::Misconfigured,
            Err(GuardError::StoreUnavailable(_)) => Outcome::StoreUnavailable,
        }
    }

    /// HTTP status the transport layer answers with
    pub fn http_status(&self) -> u16 {
        match self {
            Outcome::Accepted => 200,
            Outcome::RateLimited | Outcome::QuotaExceeded => 429,
            Outcome::NonceOutOfWindow | Outcome::NonceReplay => 409,
            Outcome::Misconfigured => 500,
            Outcome::StoreUnavailable => 503,
        }
    }

    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::RateLimited => "rate_limited",
            Outcome::QuotaExceeded => "quota_exceeded",
            Outcome::NonceOutOfWindow => "nonce_out_of_window",
            Outcome::NonceReplay => "nonce_replay",
            Outcome::Misconfigured => "misconfigured",
            Outcome::StoreUnavailable => "store_unavailable",
        }
    }
}

impl From<&Rejection> for Outcome {
    fn from(rejection: &Rejection) -> Self {
        match rejection {
            Rejection::RateLimited { .. } => Outcome::RateLimited,
            Rejection::QuotaExceeded { .. } => Outcome::QuotaExceeded,
            Rejection::NonceOutOfWindow { .. } => Outcome::NonceOutOfWindow,
            Rejection::NonceReplay { .. } => Outcome::NonceReplay,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_status_mapping() {
        assert_eq!(Outcome::Accepted.http_status(), 200);
        assert_eq!(Outcome::RateLimited.http_status(), 429);
        assert_eq!(Outcome::QuotaExceeded.http_status(), 429);
        assert_eq!(Outcome::NonceOutOfWindow.http_status(), 409);
        assert_eq!(Outcome::NonceReplay.http_status(), 409);
        assert_eq!(Outcome::Misconfigured.http_status(), 500);
        assert_eq!(Outcome::StoreUnavailable.http_status(), 503);
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Result<Verdict, GuardError> = Ok(Verdict::Accepted);
        assert_eq!(Outcome::from_result(&ok), Outcome::Accepted);

        let replay: Result<Verdict, GuardError> = Ok(Verdict::Rejected(Rejection::NonceReplay {
            ledger_id: "A".to_string(),
            nonce: 50,
            max_nonce: Some(100),
        }));
        assert_eq!(Outcome::from_result(&replay), Outcome::NonceReplay);

        let misconfigured: Result<Verdict, GuardError> =
            Err(GuardError::Misconfigured("limit must be positive".to_string()));
        assert_eq!(Outcome::from_result(&misconfigured), Outcome::Misconfigured);

        let down: Result<Verdict, GuardError> =
            Err(StoreError::Unavailable("database is locked".to_string()).into());
        assert_eq!(Outcome::from_result(&down), Outcome::StoreUnavailable);
    }

    #[test]
    fn test_limit_validation() {
        assert_eq!(positive_limit("rate limit", 5).unwrap(), 5);
        assert!(matches!(
            positive_limit("rate limit", 0),
            Err(GuardError::Misconfigured(_))
        ));
        assert!(positive_limit("rate limit", -3).is_err());

        assert_eq!(parse_limit("rate limit", " 10 ").unwrap(), 10);
        assert!(matches!(
            parse_limit("rate limit", "ten"),
            Err(GuardError::Misconfigured(_))
        ));
        assert!(parse_limit("rate limit", "").is_err());
        assert!(parse_limit("rate limit", "0").is_err());
    }

    #[test]
    fn test_verdict_serialization() {
        let verdict = Verdict::Rejected(Rejection::RateLimited { count: 6, limit: 5 });
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["verdict"], "rejected");
        assert_eq!(json["reason"], "rate_limited");
        assert_eq!(json["count"], 6);
    }

    #[test]
    fn test_constraint_violation_maps_to_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            Some("UNIQUE constraint failed".to_string()),
        );
        assert!(matches!(StoreError::from(err), StoreError::Conflict(_)));

        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(StoreError::from(busy), StoreError::Unavailable(_)));
    }
}
