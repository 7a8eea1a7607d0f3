//! Consumption metrics.
//!
//! Recorded through the `metrics` facade; the embedding service installs the
//! exporter.
//!
//! # Metrics
//! - `consumption_verifications_total` (counter): `result` is `authorized` or
//!   `denied`; denials also carry `reason`
//! - `processing_authorization_duration_seconds` (histogram): verify latency
//! - `consumption_updates_total` (counter): `status` is `settled`, `replayed`,
//!   `reconciliation_required` or `failed`
//! - `consumption_hours_processed` (histogram): hours per charged settlement;
//!   the sum is the total billed

use std::time::Duration;
use tollgate_core::Authorization;

use crate::gatekeeper::{GatekeeperError, SettlementResult};

pub(crate) fn record_verification(
    result: &Result<Authorization, GatekeeperError>,
    elapsed: Duration,
) {
    metrics::histogram!("processing_authorization_duration_seconds")
        .record(elapsed.as_secs_f64());

    match result {
        Ok(_) => {
            metrics::counter!("consumption_verifications_total", "result" => "authorized")
                .increment(1);
        }
        Err(err) => {
            metrics::counter!(
                "consumption_verifications_total",
                "result" => "denied",
                "reason" => err.denial_reason().as_str()
            )
            .increment(1);
        }
    }
}

pub(crate) fn record_settlement(result: &Result<SettlementResult, GatekeeperError>, hours: f64) {
    let status = match result {
        Ok(SettlementResult::Settled(_)) => {
            metrics::histogram!("consumption_hours_processed").record(hours);
            "settled"
        }
        Ok(SettlementResult::Replayed(_)) => "replayed",
        Ok(SettlementResult::ReconciliationRequired(_)) => "reconciliation_required",
        Err(_) => "failed",
    };
    metrics::counter!("consumption_updates_total", "status" => status).increment(1);
}
