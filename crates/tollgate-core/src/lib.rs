//! # tollgate-core
//!
//! Consumption ledger and account model for Tollgate.
//!
//! This crate owns everything that must stay correct regardless of how the
//! surrounding runtime is wired:
//! - Accounts and their prepaid capacity (in hours)
//! - The append-only usage audit trail
//! - The [`Ledger`] contract with its atomic conditional decrement
//! - Pure retry strategies consulted by the runtime's retry loop
//!
//! ## Key Guarantees
//!
//! 1. **No negative balances**: a settlement that cannot be covered is rejected
//!    and leaves no trace
//! 2. **One decrement, one audit row**: balance change and audit append are a
//!    single unit of work
//! 3. **Idempotent by reference**: a settlement replayed with the same
//!    `source_reference` is never charged twice
//!
//! ## Example
//!
//! ```rust
//! use tollgate_core::{Account, AccountId, Ledger, MemoryLedger};
//!
//! let ledger = MemoryLedger::new();
//! ledger.open_account(&Account::new("acc-1", "professional", 5.0)).unwrap();
//!
//! let settlement = ledger
//!     .apply_settlement(&AccountId::new("acc-1"), 2.0, "meeting-1")
//!     .unwrap();
//! assert_eq!(settlement.remaining_hours, 3.0);
//! ```

pub mod account;
pub mod audit;
pub mod duration_serde;
pub mod ledger;
pub mod retry;

pub use account::{Account, AccountId, AccountStatus, Authorization, ConsumptionStatus};
pub use audit::{Settlement, UsageAuditEntry};
pub use ledger::{
    validate_hours, validate_reference, Ledger, LedgerError, MemoryLedger, SqliteLedger,
};
pub use retry::{RetryPolicy, RetryStrategy};
