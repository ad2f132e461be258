//! Deathstar Guard Library
//!
//! Admission guards for an API tier running many stateless workers against
//! one shared store: a per-second rate limiter, rolling usage quotas, a
//! nonce clock-skew window and an append-only ledger with strictly
//! increasing nonces.
//!
//! Every counter and ledger lives in the store, so limits hold across
//! processes and hosts that share it.

pub mod config;
pub mod guard;
pub mod metrics;
pub mod metrics_server;

pub use guard::{
    Gatekeeper, GuardConfig, GuardError, GuardRequest, GuardStore, LedgerAppender, MemoryStore,
    NonceWindowValidator, Outcome, QuotaEnforcer, RateLimiter, Rejection, SqliteStore, Verdict,
};
