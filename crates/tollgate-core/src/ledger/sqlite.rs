//! `SQLite`-backed ledger.
//!
//! Balances live in `accounts`, the audit trail in `usage_audit`. A settlement
//! runs inside one `IMMEDIATE` transaction: the conditional
//! `UPDATE … WHERE available_hours >= ?` and the audit `INSERT` commit
//! together or not at all. WAL mode plus `synchronous = FULL` make a commit
//! durable once `apply_settlement` returns.

// SQLite hands back row ids as i64; they are always positive.
#![allow(clippy::cast_sign_loss)]

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

use super::{
    check_replay, validate_account, validate_hours, validate_reference, Ledger, LedgerError,
};
use crate::account::{Account, AccountId, AccountStatus};
use crate::audit::{Settlement, UsageAuditEntry};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const ACCOUNT_COLUMNS: &str =
    "account_id, plan, status, allotted_hours, available_hours, created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, account_id, hours, source_reference, recorded_at";

/// Durable ledger stored in a `SQLite` database.
///
/// All accounts share one connection, so storage calls are serialized across
/// accounts for the few milliseconds each transaction takes. `SQLite` admits
/// one writer per database regardless of connection count.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Opens or creates a ledger at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        Self::initialize_connection(&conn)?;

        tracing::debug!(path = %path.display(), "Opened SQLite ledger");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_connection(conn: &Connection) -> Result<(), LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }
}

impl Ledger for SqliteLedger {
    fn open_account(&self, account: &Account) -> Result<(), LedgerError> {
        validate_account(account)?;
        let conn = self.conn.lock();

        let inserted = conn.execute(
            "INSERT INTO accounts (account_id, plan, status, allotted_hours, available_hours, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (account_id) DO NOTHING",
            params![
                account.id.as_str(),
                account.plan,
                account.status.as_str(),
                account.allotted_hours,
                account.available_hours,
                account.created_at,
                account.updated_at,
            ],
        )?;

        if inserted == 0 {
            return Err(LedgerError::AccountExists(account.id.clone()));
        }
        Ok(())
    }

    fn get_account(&self, account_id: &AccountId) -> Result<Account, LedgerError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = ?1"),
            params![account_id.as_str()],
            account_from_row,
        )
        .optional()?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    fn get_balance(&self, account_id: &AccountId) -> Result<f64, LedgerError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT available_hours FROM accounts WHERE account_id = ?1",
            params![account_id.as_str()],
            |row| row.get::<_, f64>(0),
        )
        .optional()?
        .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))
    }

    fn apply_settlement(
        &self,
        account_id: &AccountId,
        hours: f64,
        source_reference: &str,
    ) -> Result<Settlement, LedgerError> {
        validate_hours(hours)?;
        validate_reference(source_reference)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let available: f64 = tx
            .query_row(
                "SELECT available_hours FROM accounts WHERE account_id = ?1",
                params![account_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;

        let existing = tx
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM usage_audit WHERE source_reference = ?1"),
                params![source_reference],
                entry_from_row,
            )
            .optional()?;

        if let Some(entry) = existing {
            check_replay(&entry, account_id, hours)?;
            // Nothing was written; dropping the transaction rolls it back.
            return Ok(Settlement {
                entry,
                remaining_hours: available,
                replayed: true,
            });
        }

        let now = Utc::now();
        let updated = tx.execute(
            "UPDATE accounts
             SET available_hours = available_hours - ?2, updated_at = ?3
             WHERE account_id = ?1 AND available_hours >= ?2",
            params![account_id.as_str(), hours, now],
        )?;

        if updated == 0 {
            return Err(LedgerError::InsufficientBalance {
                account_id: account_id.clone(),
                required: hours,
                available,
            });
        }

        tx.execute(
            "INSERT INTO usage_audit (account_id, hours, source_reference, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![account_id.as_str(), hours, source_reference, now],
        )?;
        let id = tx.last_insert_rowid() as u64;

        let remaining_hours: f64 = tx.query_row(
            "SELECT available_hours FROM accounts WHERE account_id = ?1",
            params![account_id.as_str()],
            |row| row.get(0),
        )?;

        tx.commit()?;

        tracing::debug!(
            account_id = %account_id,
            hours,
            remaining_hours,
            source_reference,
            audit_id = id,
            "Settlement committed"
        );

        Ok(Settlement {
            entry: UsageAuditEntry {
                id,
                account_id: account_id.clone(),
                hours,
                source_reference: source_reference.to_string(),
                recorded_at: now,
            },
            remaining_hours,
            replayed: false,
        })
    }

    fn audit_trail(&self, account_id: &AccountId) -> Result<Vec<UsageAuditEntry>, LedgerError> {
        let conn = self.conn.lock();

        let known: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM accounts WHERE account_id = ?1",
                params![account_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(LedgerError::AccountNotFound(account_id.clone()));
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM usage_audit WHERE account_id = ?1 ORDER BY id ASC"
        ))?;
        let entries = stmt
            .query_map(params![account_id.as_str()], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let status: String = row.get(2)?;
    let status = status
        .parse::<AccountStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;

    Ok(Account {
        id: AccountId::new(row.get::<_, String>(0)?),
        plan: row.get(1)?,
        status,
        allotted_hours: row.get(3)?,
        available_hours: row.get(4)?,
        created_at: row.get::<_, DateTime<Utc>>(5)?,
        updated_at: row.get::<_, DateTime<Utc>>(6)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<UsageAuditEntry> {
    Ok(UsageAuditEntry {
        id: row.get::<_, i64>(0)? as u64,
        account_id: AccountId::new(row.get::<_, String>(1)?),
        hours: row.get(2)?,
        source_reference: row.get(3)?,
        recorded_at: row.get::<_, DateTime<Utc>>(4)?,
    })
}
