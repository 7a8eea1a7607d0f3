//! # tollgate-runtime
//!
//! Async gatekeeping and resilience for Tollgate.
//!
//! This crate wires the ledger from `tollgate-core` into a running service:
//! - [`Gatekeeper`]: pre-flight `verify` and post-flight `settle` under
//!   per-account locks
//! - [`resilience`]: circuit breaker, retry executor and breaker registry
//! - [`adapters`]: breaker-protected clients for external services
//! - [`reconciliation`]: where unrecordable settlements are reported
//!
//! Verification and settlement outcomes are recorded through the `metrics`
//! facade (`consumption_verifications_total`, `consumption_updates_total`,
//! `consumption_hours_processed`, `processing_authorization_duration_seconds`).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tollgate_core::{Account, AccountId, SqliteLedger};
//! use tollgate_runtime::{Gatekeeper, RuntimeConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Arc::new(SqliteLedger::open("tollgate.db")?);
//! let gatekeeper = Gatekeeper::builder(ledger)
//!     .config(RuntimeConfig::from_yaml_file("tollgate.yaml")?)
//!     .build();
//!
//! let account = AccountId::new("acc-1");
//! let authorization = gatekeeper.verify(&account, 1.5).await?;
//! assert!(authorization.allowed);
//!
//! // ... process the meeting ...
//!
//! gatekeeper.settle(&account, 1.25, "meeting-42").await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod gatekeeper;
pub mod lock;
pub mod reconciliation;
pub mod resilience;
mod telemetry;

pub use config::{ConfigError, DependencyConfig, RuntimeConfig};
pub use gatekeeper::{
    DenialReason, Gatekeeper, GatekeeperBuilder, GatekeeperError, SettlementResult,
    LEDGER_BREAKER,
};
pub use lock::{AccountLock, LocalAccountLocks, LockError, LockTimeoutError, ScopedLock};
pub use reconciliation::{
    MemoryReconciliationSink, ReconciliationCause, ReconciliationFailure, ReconciliationSink,
    TracingReconciliationSink,
};
pub use resilience::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState,
    RetryError, RetryExecutor, TerminalRetryFailure,
};
