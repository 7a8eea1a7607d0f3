//! Accounts, authorization results and consumption status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a prepaid account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Create an account identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle status of an account's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Paying account in good standing
    #[default]
    Active,

    /// Trial period, consumes capacity like an active account
    Trial,

    /// Suspended (usually a payment failure)
    Suspended,

    /// Cancelled by the account holder
    Cancelled,
}

impl AccountStatus {
    /// Whether an account in this status may be authorized to consume.
    pub fn can_consume(self) -> bool {
        matches!(self, AccountStatus::Active | AccountStatus::Trial)
    }

    /// Stable lowercase name, used for storage.
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Trial => "trial",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "trial" => Ok(AccountStatus::Trial),
            "suspended" => Ok(AccountStatus::Suspended),
            "cancelled" => Ok(AccountStatus::Cancelled),
            other => Err(format!("unknown account status: '{other}'")),
        }
    }
}

/// A prepaid account and its remaining capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account identifier
    pub id: AccountId,

    /// Plan identifier (e.g. "basic", "professional")
    pub plan: String,

    /// Subscription status
    #[serde(default)]
    pub status: AccountStatus,

    /// Hours granted by the plan for the current period
    pub allotted_hours: f64,

    /// Hours still available for consumption
    pub available_hours: f64,

    /// When the account was opened
    pub created_at: DateTime<Utc>,

    /// Last balance change
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create an active account with its full allotment available.
    pub fn new(id: impl Into<AccountId>, plan: impl Into<String>, allotted_hours: f64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            plan: plan.into(),
            status: AccountStatus::Active,
            allotted_hours,
            available_hours: allotted_hours,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the status (builder pattern).
    pub fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the available hours independently of the allotment (builder pattern).
    pub fn with_available_hours(mut self, available_hours: f64) -> Self {
        self.available_hours = available_hours;
        self
    }

    /// Whether the balance covers `hours`.
    pub fn has_capacity(&self, hours: f64) -> bool {
        self.available_hours >= hours
    }

    /// Hours consumed in the current period.
    pub fn consumed_hours(&self) -> f64 {
        (self.allotted_hours - self.available_hours).max(0.0)
    }

    /// Share of the allotment already consumed, in percent.
    pub fn consumption_percentage(&self) -> f64 {
        if self.allotted_hours <= 0.0 {
            return 0.0;
        }
        (self.consumed_hours() / self.allotted_hours * 100.0).clamp(0.0, 100.0)
    }
}

/// Outcome of a successful pre-flight check.
///
/// Request-scoped and never persisted. Rejections are reported as errors by
/// the gatekeeper, so an `Authorization` that reaches the caller is allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    /// Account that was checked
    pub account_id: AccountId,

    /// Hours the caller expects to consume
    pub estimated_hours: f64,

    /// Whether processing may start
    pub allowed: bool,

    /// Balance left if the estimate turns out exact
    pub projected_remaining_hours: f64,

    /// Consumption before this request, in percent of the allotment
    pub consumption_percentage: f64,
}

impl Authorization {
    /// Build an allowed authorization for `estimated_hours` against `account`.
    pub fn granted(account: &Account, estimated_hours: f64) -> Self {
        Self {
            account_id: account.id.clone(),
            estimated_hours,
            allowed: true,
            projected_remaining_hours: account.available_hours - estimated_hours,
            consumption_percentage: account.consumption_percentage(),
        }
    }

    /// Whether consumption has reached `threshold_percent` of the allotment.
    pub fn is_near_limit(&self, threshold_percent: f64) -> bool {
        self.consumption_percentage >= threshold_percent
    }
}

/// Read-only snapshot of an account's consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionStatus {
    pub account_id: AccountId,
    pub plan: String,
    pub status: AccountStatus,
    pub allotted_hours: f64,
    pub available_hours: f64,
    pub consumed_hours: f64,
    pub consumption_percentage: f64,
}

impl From<&Account> for ConsumptionStatus {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.id.clone(),
            plan: account.plan.clone(),
            status: account.status,
            allotted_hours: account.allotted_hours,
            available_hours: account.available_hours,
            consumed_hours: account.consumed_hours(),
            consumption_percentage: account.consumption_percentage(),
        }
    }
}
