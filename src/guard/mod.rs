//! Guard Primitives
//!
//! Request-rate limiting, rolling usage quotas, nonce clock-skew checks and
//! an append-only per-ledger nonce sequence, all coordinated through a
//! shared store rather than in-process state.
//!
//! # Features
//!
//! - One-second rate buckets with an atomic increment-and-read
//! - Per-class rolling-window quotas with count-then-insert under one scope
//! - Stateless nonce window check against wall-clock time
//! - Per-ledger strictly increasing nonces with replay rejection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Gatekeeper                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌────────────┐  │
//! │  │ Nonce    │→ │ Rate     │→ │ Quota    │→ │ Ledger     │  │
//! │  │ Window   │  │ Limiter  │  │ Enforcer │  │ Appender   │  │
//! │  └──────────┘  └──────────┘  └──────────┘  └────────────┘  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │        GuardStore (SQLite file or in-memory)         │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod dashboard;
pub mod gatekeeper;
pub mod ledger;
pub mod memory;
pub mod nonce;
pub mod outcome;
pub mod quota;
pub mod rate;
pub mod sqlite;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::GuardConfig;
pub use dashboard::{DashboardBuilder, DashboardData};
pub use gatekeeper::{Gatekeeper, GuardRequest, LedgerAppend};
pub use ledger::LedgerAppender;
pub use memory::MemoryStore;
pub use nonce::NonceWindowValidator;
pub use outcome::{parse_limit, GuardError, Outcome, Rejection, StoreError, Verdict};
pub use quota::QuotaEnforcer;
pub use rate::RateLimiter;
pub use sqlite::SqliteStore;
pub use store::{BucketKey, GuardStore, LedgerEntry, LedgerScope, PruneReport, QuotaScope};
