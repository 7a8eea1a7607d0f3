//! Usage audit trail records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::AccountId;

/// One immutable row of the usage audit trail.
///
/// Exactly one entry exists per successful settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageAuditEntry {
    /// Ledger-generated identifier
    pub id: u64,

    /// Account that was charged
    pub account_id: AccountId,

    /// Hours deducted
    pub hours: f64,

    /// Caller-supplied reference (e.g. a meeting id), unique across the trail
    pub source_reference: String,

    /// When the settlement was committed
    pub recorded_at: DateTime<Utc>,
}

/// Result of applying a settlement to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// The audit entry backing this settlement
    pub entry: UsageAuditEntry,

    /// Balance after the settlement
    pub remaining_hours: f64,

    /// True when the reference was already settled and nothing was written
    pub replayed: bool,
}
