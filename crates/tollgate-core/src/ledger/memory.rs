//! In-memory ledger backend.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{
    check_replay, validate_account, validate_hours, validate_reference, Ledger, LedgerError,
};
use crate::account::{Account, AccountId};
use crate::audit::{Settlement, UsageAuditEntry};

#[derive(Default)]
struct MemoryState {
    accounts: BTreeMap<AccountId, Account>,
    audit: Vec<UsageAuditEntry>,
    by_reference: HashMap<String, usize>,
}

/// Ledger held in process memory.
///
/// A single mutex covers balances and the audit trail, so a settlement is
/// applied as one step. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger pre-populated with accounts.
    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Result<Self, LedgerError> {
        let ledger = Self::new();
        for account in accounts {
            ledger.open_account(&account)?;
        }
        Ok(ledger)
    }

    /// Total number of audit entries across all accounts.
    pub fn audit_len(&self) -> usize {
        self.state.lock().audit.len()
    }
}

impl Ledger for MemoryLedger {
    fn open_account(&self, account: &Account) -> Result<(), LedgerError> {
        validate_account(account)?;
        let mut state = self.state.lock();
        if state.accounts.contains_key(&account.id) {
            return Err(LedgerError::AccountExists(account.id.clone()));
        }
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    fn get_account(&self, account_id: &AccountId) -> Result<Account, LedgerError> {
        self.state
            .lock()
            .accounts
            .get(account_id)
            .cloned()
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

        let mut state = self.state.lock();
        let state = &mut *state;

        if let Some(&index) = state.by_reference.get(source_reference) {
            let existing = &state.audit[index];
            check_replay(existing, account_id, hours)?;
            let remaining_hours = state
                .accounts
                .get(account_id)
                .map(|a| a.available_hours)
                .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;
            return Ok(Settlement {
                entry: existing.clone(),
                remaining_hours,
                replayed: true,
            });
        }

        let account = state
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.clone()))?;

        if !account.has_capacity(hours) {
            return Err(LedgerError::InsufficientBalance {
                account_id: account_id.clone(),
                required: hours,
                available: account.available_hours,
            });
        }

        let now = Utc::now();
        account.available_hours -= hours;
        account.updated_at = now;
        let remaining_hours = account.available_hours;

        let entry = UsageAuditEntry {
            id: state.audit.len() as u64 + 1,
            account_id: account_id.clone(),
            hours,
            source_reference: source_reference.to_string(),
            recorded_at: now,
        };
        state
            .by_reference
            .insert(entry.source_reference.clone(), state.audit.len());
        state.audit.push(entry.clone());

        tracing::debug!(
            account_id = %account_id,
            hours,
            remaining_hours,
            source_reference,
            "Settlement applied"
        );

        Ok(Settlement {
            entry,
            remaining_hours,
            replayed: false,
        })
    }

    fn audit_trail(&self, account_id: &AccountId) -> Result<Vec<UsageAuditEntry>, LedgerError> {
        let state = self.state.lock();
        if !state.accounts.contains_key(account_id) {
            return Err(LedgerError::AccountNotFound(account_id.clone()));
        }
        Ok(state
            .audit
            .iter()
            .filter(|entry| entry.account_id == *account_id)
            .cloned()
            .collect())
    }
}
