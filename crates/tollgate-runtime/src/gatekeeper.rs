//! Consumption gatekeeper.
//!
//! The gatekeeper sits in front of every billable workflow:
//!
//! 1. [`Gatekeeper::verify`] runs before processing starts and confirms the
//!    account can cover the estimate. Nothing is reserved or written.
//! 2. [`Gatekeeper::settle`] runs after processing and records the actual
//!    usage through the ledger's atomic conditional decrement.
//!
//! Both take a lock scoped to the one account, so operations on the same
//! account are totally ordered while different accounts proceed in parallel.
//! Ledger calls go through a breaker and retry policy dedicated to the
//! ledger; when that breaker is open, `verify` fails closed.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tollgate_core::{
    validate_hours, validate_reference, Account, AccountId, AccountStatus, Authorization,
    ConsumptionStatus, Ledger, LedgerError, Settlement, UsageAuditEntry,
};

use crate::config::RuntimeConfig;
use crate::lock::{AccountLock, LocalAccountLocks, LockError, LockTimeoutError, ScopedLock};
use crate::reconciliation::{
    ReconciliationCause, ReconciliationFailure, ReconciliationSink, TracingReconciliationSink,
};
use crate::resilience::{
    CircuitBreaker, CircuitOpenError, RetryError, RetryExecutor, TerminalRetryFailure,
};
use crate::telemetry;

/// Breaker name used for the ledger.
pub const LEDGER_BREAKER: &str = "ledger";

/// Why a request was refused, for callers deciding what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// Not enough prepaid hours
    Capacity,

    /// Account unknown or not allowed to consume
    AccountState,

    /// Malformed amount or reference
    InvalidRequest,

    /// Another operation on the account held the lock too long
    Contention,

    /// The ledger or lock backend is unavailable
    DependencyUnavailable,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::Capacity => "capacity",
            DenialReason::AccountState => "account_state",
            DenialReason::InvalidRequest => "invalid_request",
            DenialReason::Contention => "contention",
            DenialReason::DependencyUnavailable => "dependency_unavailable",
        }
    }
}

/// Errors from the gatekeeper.
#[derive(Debug, Error)]
pub enum GatekeeperError {
    #[error(
        "insufficient capacity for account {account_id}: required={required:.2}h, available={available:.2}h"
    )]
    InsufficientCapacity {
        account_id: AccountId,
        required: f64,
        available: f64,
    },

    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("account {account_id} is {status} and cannot consume")]
    AccountInactive {
        account_id: AccountId,
        status: AccountStatus,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(#[source] LedgerError),

    #[error(transparent)]
    LockTimeout(LockTimeoutError),

    #[error("lock backend unavailable: {0}")]
    LockUnavailable(String),

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(#[source] CircuitOpenError),

    #[error(transparent)]
    RetriesExhausted(TerminalRetryFailure<LedgerError>),

    #[error("ledger error: {0}")]
    Ledger(#[source] LedgerError),
}

impl GatekeeperError {
    /// Structured reason for the refusal.
    pub fn denial_reason(&self) -> DenialReason {
        match self {
            GatekeeperError::InsufficientCapacity { .. } => DenialReason::Capacity,
            GatekeeperError::AccountNotFound(_) | GatekeeperError::AccountInactive { .. } => {
                DenialReason::AccountState
            }
            GatekeeperError::InvalidRequest(_) => DenialReason::InvalidRequest,
            GatekeeperError::LockTimeout(_) => DenialReason::Contention,
            GatekeeperError::LockUnavailable(_)
            | GatekeeperError::LedgerUnavailable(_)
            | GatekeeperError::RetriesExhausted(_)
            | GatekeeperError::Ledger(_) => DenialReason::DependencyUnavailable,
        }
    }

    /// Whether the same request may succeed later without changes.
    ///
    /// Capacity denials are never retryable; they need a top-up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.denial_reason(),
            DenialReason::Contention | DenialReason::DependencyUnavailable
        )
    }
}

impl From<LedgerError> for GatekeeperError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::AccountNotFound(account_id) => GatekeeperError::AccountNotFound(account_id),
            LedgerError::InsufficientBalance {
                account_id,
                required,
                available,
            } => GatekeeperError::InsufficientCapacity {
                account_id,
                required,
                available,
            },
            err @ (LedgerError::InvalidAmount { .. }
            | LedgerError::EmptyReference
            | LedgerError::InvalidAccount(_)
            | LedgerError::AccountExists(_)
            | LedgerError::ReferenceConflict { .. }) => GatekeeperError::InvalidRequest(err),
            other => GatekeeperError::Ledger(other),
        }
    }
}

impl From<RetryError<LedgerError>> for GatekeeperError {
    fn from(err: RetryError<LedgerError>) -> Self {
        match err {
            RetryError::CircuitOpen(open) => GatekeeperError::LedgerUnavailable(open),
            RetryError::Exhausted(failure) => GatekeeperError::RetriesExhausted(failure),
            RetryError::Rejected(err) => err.into(),
        }
    }
}

impl From<LockError> for GatekeeperError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout(timeout) => GatekeeperError::LockTimeout(timeout),
            LockError::Unavailable(detail) => GatekeeperError::LockUnavailable(detail),
        }
    }
}

/// Outcome of a settlement that reached the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementResult {
    /// Usage was charged and audited.
    Settled(Settlement),

    /// The reference was already settled; nothing was charged.
    Replayed(Settlement),

    /// Actual usage exceeded the balance. Nothing was charged and the
    /// failure was reported for reconciliation.
    ReconciliationRequired(ReconciliationFailure),
}

impl SettlementResult {
    /// The recorded settlement, unless reconciliation is required.
    pub fn settlement(&self) -> Option<&Settlement> {
        match self {
            SettlementResult::Settled(s) | SettlementResult::Replayed(s) => Some(s),
            SettlementResult::ReconciliationRequired(_) => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, SettlementResult::Settled(_))
    }

    pub fn requires_reconciliation(&self) -> bool {
        matches!(self, SettlementResult::ReconciliationRequired(_))
    }
}

/// Builder for [`Gatekeeper`].
pub struct GatekeeperBuilder {
    ledger: Arc<dyn Ledger>,
    config: RuntimeConfig,
    locks: Option<Arc<dyn AccountLock>>,
    ledger_breaker: Option<Arc<CircuitBreaker>>,
    reconciliation: Option<Arc<dyn ReconciliationSink>>,
}

impl GatekeeperBuilder {
    /// Use `config` for timeouts, the ledger breaker and the retry policy.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom lock provider instead of in-process locks.
    pub fn locks(mut self, locks: Arc<dyn AccountLock>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Use an existing ledger breaker, e.g. one shared with other components.
    pub fn ledger_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.ledger_breaker = Some(breaker);
        self
    }

    /// Send reconciliation failures to `sink`.
    pub fn reconciliation(mut self, sink: Arc<dyn ReconciliationSink>) -> Self {
        self.reconciliation = Some(sink);
        self
    }

    pub fn build(self) -> Gatekeeper {
        let breaker = self.ledger_breaker.unwrap_or_else(|| {
            Arc::new(
                CircuitBreaker::new(LEDGER_BREAKER, self.config.ledger.breaker.clone())
                    .counting::<LedgerError, _>(LedgerError::is_transient),
            )
        });

        Gatekeeper {
            ledger: self.ledger,
            locks: self
                .locks
                .unwrap_or_else(|| Arc::new(LocalAccountLocks::new())),
            executor: RetryExecutor::new(breaker, self.config.ledger.retry.clone()),
            reconciliation: self
                .reconciliation
                .unwrap_or_else(|| Arc::new(TracingReconciliationSink)),
            lock_timeout: self.config.lock_timeout,
            near_limit_percent: self.config.near_limit_percent,
        }
    }
}

/// Pre-flight authorization and post-flight settlement of consumption.
pub struct Gatekeeper {
    ledger: Arc<dyn Ledger>,
    locks: Arc<dyn AccountLock>,
    executor: RetryExecutor,
    reconciliation: Arc<dyn ReconciliationSink>,
    lock_timeout: Duration,
    near_limit_percent: f64,
}

impl Gatekeeper {
    /// Gatekeeper with default configuration.
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self::builder(ledger).build()
    }

    pub fn builder(ledger: Arc<dyn Ledger>) -> GatekeeperBuilder {
        GatekeeperBuilder {
            ledger,
            config: RuntimeConfig::default(),
            locks: None,
            ledger_breaker: None,
            reconciliation: None,
        }
    }

    /// Breaker guarding ledger calls.
    pub fn ledger_breaker(&self) -> &Arc<CircuitBreaker> {
        self.executor.breaker()
    }

    /// Check that `account_id` can cover `estimated_hours`.
    ///
    /// Read-only: the balance is not reserved, so a later settlement can still
    /// find it insufficient.
    pub async fn verify(
        &self,
        account_id: &AccountId,
        estimated_hours: f64,
    ) -> Result<Authorization, GatekeeperError> {
        let started = Instant::now();
        let result = self.authorize(account_id, estimated_hours).await;
        telemetry::record_verification(&result, started.elapsed());
        result
    }

    async fn authorize(
        &self,
        account_id: &AccountId,
        estimated_hours: f64,
    ) -> Result<Authorization, GatekeeperError> {
        validate_hours(estimated_hours)?;

        let lock = self.lock(account_id).await?;
        let account = self.load_account(account_id, &lock).await?;

        if !account.status.can_consume() {
            tracing::info!(
                account_id = %account_id,
                status = %account.status,
                "Verification denied: account inactive"
            );
            return Err(GatekeeperError::AccountInactive {
                account_id: account_id.clone(),
                status: account.status,
            });
        }

        if !account.has_capacity(estimated_hours) {
            tracing::info!(
                account_id = %account_id,
                amount = estimated_hours,
                available = account.available_hours,
                "Verification denied: insufficient capacity"
            );
            return Err(GatekeeperError::InsufficientCapacity {
                account_id: account_id.clone(),
                required: estimated_hours,
                available: account.available_hours,
            });
        }

        let authorization = Authorization::granted(&account, estimated_hours);
        if authorization.is_near_limit(self.near_limit_percent) {
            tracing::warn!(
                account_id = %account_id,
                consumption_percentage = authorization.consumption_percentage,
                threshold = self.near_limit_percent,
                "Account is near its consumption limit"
            );
        }

        tracing::debug!(
            account_id = %account_id,
            amount = estimated_hours,
            projected_remaining = authorization.projected_remaining_hours,
            "Verification granted"
        );
        Ok(authorization)
    }

    /// Record actual usage.
    ///
    /// Invalid input is returned as an error and not reported. A lock that
    /// cannot be acquired is a retryable error; the ledger was never touched.
    /// Every settlement that reaches the ledger and cannot be recorded is
    /// reported to the reconciliation sink: insufficient balance as
    /// [`SettlementResult::ReconciliationRequired`], anything else as an
    /// error.
    ///
    /// Dropping the returned future does not abandon a ledger write already
    /// in progress: the account stays locked until it finishes. Settling the
    /// same reference again tells whether it was recorded.
    pub async fn settle(
        &self,
        account_id: &AccountId,
        actual_hours: f64,
        source_reference: &str,
    ) -> Result<SettlementResult, GatekeeperError> {
        let result = self
            .record(account_id, actual_hours, source_reference)
            .await;
        telemetry::record_settlement(&result, actual_hours);
        result
    }

    async fn record(
        &self,
        account_id: &AccountId,
        actual_hours: f64,
        source_reference: &str,
    ) -> Result<SettlementResult, GatekeeperError> {
        validate_hours(actual_hours)?;
        validate_reference(source_reference)?;

        let lock = self.lock(account_id).await.inspect_err(|err| {
            tracing::warn!(
                account_id = %account_id,
                source_reference,
                error = %err,
                "Settlement not attempted: account lock not acquired"
            );
        })?;

        let id = account_id.clone();
        let reference = source_reference.to_string();
        let outcome = self
            .call_ledger(Some(&lock), move |ledger| {
                ledger.apply_settlement(&id, actual_hours, &reference)
            })
            .await;

        match outcome {
            Ok(settlement) if settlement.replayed => {
                tracing::info!(
                    account_id = %account_id,
                    source_reference,
                    "Settlement already recorded; replay ignored"
                );
                Ok(SettlementResult::Replayed(settlement))
            }
            Ok(settlement) => {
                tracing::info!(
                    account_id = %account_id,
                    amount = actual_hours,
                    remaining = settlement.remaining_hours,
                    source_reference,
                    "Settlement recorded"
                );
                Ok(SettlementResult::Settled(settlement))
            }
            Err(RetryError::Rejected(LedgerError::InsufficientBalance {
                required,
                available,
                ..
            })) => {
                let failure = self.reconcile(
                    account_id,
                    actual_hours,
                    source_reference,
                    ReconciliationCause::InsufficientBalance {
                        required,
                        available,
                    },
                );
                Ok(SettlementResult::ReconciliationRequired(failure))
            }
            Err(err) => {
                let cause = match &err {
                    RetryError::CircuitOpen(_) | RetryError::Exhausted(_) => {
                        ReconciliationCause::LedgerUnavailable {
                            detail: err.to_string(),
                        }
                    }
                    RetryError::Rejected(rejection) => ReconciliationCause::Rejected {
                        detail: rejection.to_string(),
                    },
                };
                self.reconcile(account_id, actual_hours, source_reference, cause);
                Err(err.into())
            }
        }
    }

    /// Read-only consumption status.
    pub async fn status(&self, account_id: &AccountId) -> Result<ConsumptionStatus, GatekeeperError> {
        let lock = self.lock(account_id).await?;
        let account = self.load_account(account_id, &lock).await?;
        Ok(ConsumptionStatus::from(&account))
    }

    /// Register a new account.
    pub async fn open_account(&self, account: Account) -> Result<(), GatekeeperError> {
        self.call_ledger(None, move |ledger| ledger.open_account(&account))
            .await
            .map_err(GatekeeperError::from)
    }

    /// Audit entries for an account, oldest first.
    pub async fn audit_trail(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<UsageAuditEntry>, GatekeeperError> {
        let id = account_id.clone();
        self.call_ledger(None, move |ledger| ledger.audit_trail(&id))
            .await
            .map_err(GatekeeperError::from)
    }

    async fn lock(&self, account_id: &AccountId) -> Result<Arc<ScopedLock>, GatekeeperError> {
        let lock = self.locks.acquire(account_id, self.lock_timeout).await?;
        Ok(Arc::new(lock))
    }

    async fn load_account(
        &self,
        account_id: &AccountId,
        lock: &Arc<ScopedLock>,
    ) -> Result<Account, GatekeeperError> {
        let id = account_id.clone();
        self.call_ledger(Some(lock), move |ledger| ledger.get_account(&id))
            .await
            .map_err(|err| {
                let err = GatekeeperError::from(err);
                if err.denial_reason() == DenialReason::DependencyUnavailable {
                    tracing::warn!(
                        account_id = %account_id,
                        error = %err,
                        "Ledger unavailable; failing closed"
                    );
                }
                err
            })
    }

    /// Run a blocking ledger call off the async workers, through the ledger
    /// breaker and retry policy.
    ///
    /// Each attempt holds a share of `lock` until its blocking call returns,
    /// so the account is not released while a write may still commit.
    async fn call_ledger<T, F>(
        &self,
        lock: Option<&Arc<ScopedLock>>,
        op: F,
    ) -> Result<T, RetryError<LedgerError>>
    where
        F: Fn(&dyn Ledger) -> Result<T, LedgerError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let op = Arc::new(op);
        self.executor
            .run(|| {
                let ledger = Arc::clone(&self.ledger);
                let op = Arc::clone(&op);
                let held = lock.cloned();
                async move {
                    tokio::task::spawn_blocking(move || {
                        let _held = held;
                        op(ledger.as_ref())
                    })
                    .await
                    .map_err(|e| LedgerError::Unavailable(format!("ledger task failed: {e}")))?
                }
            })
            .await
    }

    fn reconcile(
        &self,
        account_id: &AccountId,
        hours: f64,
        source_reference: &str,
        cause: ReconciliationCause,
    ) -> ReconciliationFailure {
        let failure =
            ReconciliationFailure::new(account_id.clone(), hours, source_reference, cause);
        tracing::error!(
            account_id = %account_id,
            amount = hours,
            source_reference,
            cause = %failure.cause,
            "Settlement could not be recorded"
        );
        self.reconciliation.report(&failure);
        failure
    }
}
