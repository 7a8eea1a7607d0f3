//! The consumption ledger.
//!
//! A ledger stores per-account balances and the append-only usage audit
//! trail. Its one mutating operation, [`Ledger::apply_settlement`], checks the
//! balance, decrements it and appends the audit entry as a single unit: either
//! all three happen or none do.
//!
//! Two backends are provided:
//! - [`MemoryLedger`] for tests and embedded use
//! - [`SqliteLedger`] for durable storage

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::account::{Account, AccountId};
use crate::audit::{Settlement, UsageAuditEntry};

/// Two amounts closer than this are the same settlement on replay.
pub(crate) const HOURS_TOLERANCE: f64 = 1e-9;

/// Errors from ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("account already exists: {0}")]
    AccountExists(AccountId),

    #[error("invalid account: {0}")]
    InvalidAccount(String),

    #[error(
        "insufficient balance for account {account_id}: required={required:.2}, available={available:.2}"
    )]
    InsufficientBalance {
        account_id: AccountId,
        required: f64,
        available: f64,
    },

    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: f64, reason: &'static str },

    #[error("source reference must not be empty")]
    EmptyReference,

    #[error("source reference '{reference}' was already settled for account {account_id} ({hours:.2}h)")]
    ReferenceConflict {
        reference: String,
        account_id: AccountId,
        hours: f64,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// Whether the error is a storage fault worth retrying.
    ///
    /// Business-rule rejections (insufficient balance, unknown account,
    /// conflicting reference) are definitive and never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Unavailable(_) => true,
            LedgerError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::CannotOpen
                    | ErrorCode::DiskFull
            ),
            _ => false,
        }
    }
}

/// Durable store of balances and the usage audit trail.
///
/// Implementations must make [`apply_settlement`](Ledger::apply_settlement)
/// atomic: a crash mid-operation leaves either the pre-state or the fully
/// applied post-state, never a decrement without its audit entry.
pub trait Ledger: Send + Sync {
    /// Register a new account (signup).
    fn open_account(&self, account: &Account) -> Result<(), LedgerError>;

    /// Fetch an account with its committed balance.
    fn get_account(&self, account_id: &AccountId) -> Result<Account, LedgerError>;

    /// Committed balance in hours.
    fn get_balance(&self, account_id: &AccountId) -> Result<f64, LedgerError> {
        Ok(self.get_account(account_id)?.available_hours)
    }

    /// Atomically check, decrement and record one settlement.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InsufficientBalance`] if the balance cannot cover
    ///   `hours`; nothing is written.
    /// - [`LedgerError::ReferenceConflict`] if `source_reference` was already
    ///   settled with a different account or amount.
    ///
    /// Re-applying an identical settlement returns the original entry with
    /// [`Settlement::replayed`] set.
    fn apply_settlement(
        &self,
        account_id: &AccountId,
        hours: f64,
        source_reference: &str,
    ) -> Result<Settlement, LedgerError>;

    /// Audit entries for an account, oldest first.
    fn audit_trail(&self, account_id: &AccountId) -> Result<Vec<UsageAuditEntry>, LedgerError>;
}

/// Reject amounts that cannot be settled.
pub fn validate_hours(hours: f64) -> Result<(), LedgerError> {
    if !hours.is_finite() {
        return Err(LedgerError::InvalidAmount {
            amount: hours,
            reason: "amount must be finite",
        });
    }
    if hours <= 0.0 {
        return Err(LedgerError::InvalidAmount {
            amount: hours,
            reason: "amount must be positive",
        });
    }
    Ok(())
}

pub(crate) fn validate_account(account: &Account) -> Result<(), LedgerError> {
    if account.id.as_str().trim().is_empty() {
        return Err(LedgerError::InvalidAccount("account id cannot be empty".to_string()));
    }
    if !account.allotted_hours.is_finite() || account.allotted_hours < 0.0 {
        return Err(LedgerError::InvalidAccount(format!(
            "allotted hours must be a non-negative number, got {}",
            account.allotted_hours
        )));
    }
    if !account.available_hours.is_finite() || account.available_hours < 0.0 {
        return Err(LedgerError::InvalidAccount(format!(
            "available hours must be a non-negative number, got {}",
            account.available_hours
        )));
    }
    Ok(())
}

/// Reject empty or blank source references.
pub fn validate_reference(source_reference: &str) -> Result<(), LedgerError> {
    if source_reference.trim().is_empty() {
        return Err(LedgerError::EmptyReference);
    }
    Ok(())
}

/// Decide whether an existing audit entry is a replay of the requested
/// settlement or a conflicting reuse of its reference.
pub(crate) fn check_replay(
    existing: &UsageAuditEntry,
    account_id: &AccountId,
    hours: f64,
) -> Result<(), LedgerError> {
    if existing.account_id != *account_id || (existing.hours - hours).abs() > HOURS_TOLERANCE {
        return Err(LedgerError::ReferenceConflict {
            reference: existing.source_reference.clone(),
            account_id: existing.account_id.clone(),
            hours: existing.hours,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_hours() {
        assert!(validate_hours(0.5).is_ok());
        assert!(matches!(
            validate_hours(0.0),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            validate_hours(-1.0),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            validate_hours(f64::NAN),
            Err(LedgerError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_business_errors_are_not_transient() {
        let err = LedgerError::InsufficientBalance {
            account_id: AccountId::new("acc"),
            required: 2.0,
            available: 1.0,
        };
        assert!(!err.is_transient());
        assert!(!LedgerError::AccountNotFound(AccountId::new("acc")).is_transient());
        assert!(LedgerError::Unavailable("connection reset".into()).is_transient());
    }

    #[test]
    fn test_busy_database_is_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(LedgerError::Database(busy).is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!LedgerError::Database(constraint).is_transient());
    }
}
