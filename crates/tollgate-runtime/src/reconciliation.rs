//! Reconciliation reporting.
//!
//! A settlement that cannot be recorded after the work already ran means
//! delivered hours went unbilled. Each such case is turned into a
//! [`ReconciliationFailure`] and handed to a [`ReconciliationSink`]; they are
//! never dropped silently. A settlement that never reached the ledger (the
//! account lock was not acquired) is a retryable error, not a reconciliation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tollgate_core::AccountId;

/// Why a settlement could not be recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconciliationCause {
    /// Actual usage exceeded the committed balance.
    InsufficientBalance { required: f64, available: f64 },

    /// The ledger was unreachable (circuit open or retries exhausted).
    LedgerUnavailable { detail: String },

    /// The ledger refused the settlement for another reason.
    Rejected { detail: String },
}

impl fmt::Display for ReconciliationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconciliationCause::InsufficientBalance {
                required,
                available,
            } => write!(
                f,
                "insufficient balance: required={required:.2}h, available={available:.2}h"
            ),
            ReconciliationCause::LedgerUnavailable { detail } => {
                write!(f, "ledger unavailable: {detail}")
            }
            ReconciliationCause::Rejected { detail } => write!(f, "rejected: {detail}"),
        }
    }
}

/// A settlement that needs manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationFailure {
    pub account_id: AccountId,
    pub hours: f64,
    pub source_reference: String,
    pub cause: ReconciliationCause,
    pub detected_at: DateTime<Utc>,
}

impl ReconciliationFailure {
    pub fn new(
        account_id: AccountId,
        hours: f64,
        source_reference: impl Into<String>,
        cause: ReconciliationCause,
    ) -> Self {
        Self {
            account_id,
            hours,
            source_reference: source_reference.into(),
            cause,
            detected_at: Utc::now(),
        }
    }
}

/// Destination for reconciliation failures.
pub trait ReconciliationSink: Send + Sync {
    fn report(&self, failure: &ReconciliationFailure);
}

/// Emits failures as error-level events on the `tollgate::reconciliation`
/// target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReconciliationSink;

impl ReconciliationSink for TracingReconciliationSink {
    fn report(&self, failure: &ReconciliationFailure) {
        tracing::error!(
            target: "tollgate::reconciliation",
            account_id = %failure.account_id,
            hours = failure.hours,
            source_reference = %failure.source_reference,
            cause = %failure.cause,
            detected_at = %failure.detected_at,
            "Settlement requires reconciliation"
        );
    }
}

/// Keeps failures in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryReconciliationSink {
    failures: Mutex<Vec<ReconciliationFailure>>,
}

impl MemoryReconciliationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> Vec<ReconciliationFailure> {
        self.failures.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.lock().is_empty()
    }

    /// Remove and return everything collected so far.
    pub fn drain(&self) -> Vec<ReconciliationFailure> {
        std::mem::take(&mut *self.failures.lock())
    }
}

impl ReconciliationSink for MemoryReconciliationSink {
    fn report(&self, failure: &ReconciliationFailure) {
        self.failures.lock().push(failure.clone());
    }
}
