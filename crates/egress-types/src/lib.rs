//! Shared record and enumeration types for the egress identity
//! admission-control subsystem. These are the types that cross crate
//! boundaries: identity keys, bounce events, breach and rotation
//! records, and the ports to the external warm-up and alerting
//! collaborators.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use uuid::Uuid;

/// Identifies a sending identity: the pairing of an egress IP address
/// with a provider sub-account. This is the unit of rotation and of
/// rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub address: IpAddr,
    pub sub_account: String,
}

impl IdentityKey {
    pub fn new(address: IpAddr, sub_account: impl Into<String>) -> Self {
        Self {
            address,
            sub_account: sub_account.into(),
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}/{}", self.address, self.sub_account)
    }
}

impl FromStr for IdentityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, sub_account) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid identity key '{s}': expected ADDRESS/SUB_ACCOUNT"))?;
        let address = addr
            .parse()
            .map_err(|err| format!("invalid identity address '{addr}': {err}"))?;
        Ok(Self {
            address,
            sub_account: sub_account.to_string(),
        })
    }
}

/// Coarse classification of a delivery failure signal.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::EnumString,
    strum::Display,
)]
pub enum BounceType {
    /// Permanent failure; the recipient is gone or rejects us outright
    Hard,
    /// Transient failure; may succeed on a later attempt
    Soft,
    /// The receiving site is blocking this sending identity
    Block,
}

/// A single observed delivery failure, as reported by the provider's
/// bounce callback. Appended to the per-identity event log and used
/// to recompute rolling counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BounceEvent {
    pub recipient: String,
    pub identity: IdentityKey,
    pub bounce_type: BounceType,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Severity of a threshold breach. Ordering is meaningful:
/// `Critical > High > Medium > Low`.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::EnumString,
    strum::Display,
)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Availability of an identity within the rotation pool.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display)]
pub enum AvailabilityState {
    /// Eligible for selection
    Active,
    /// Recently rotated away from; not eligible until the cooldown
    /// deadline passes
    Cooldown,
    /// Circuit-broken or administratively disabled. Requires an
    /// explicit administrative reset; never recovers automatically.
    Disabled,
    /// Taken out of service by an operator
    Maintenance,
}

/// Immutable record of a rule evaluation that crossed its threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBreach {
    pub identity: IdentityKey,
    pub rule_name: String,
    /// The observed bounce rate at evaluation time
    pub current_value: f64,
    /// The effective threshold that was crossed
    pub threshold_value: f64,
    pub severity: Severity,
    pub breach_time: DateTime<Utc>,
    /// Number of sends the observation is based on
    pub sample_size: u64,
}

/// Why a rotation was performed.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    strum::EnumString,
    strum::Display,
)]
pub enum RotationReason {
    ThresholdBreach,
    Manual,
    Scheduled,
    PerformanceDegradation,
}

/// Immutable record of a rotation attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub id: Uuid,
    pub from_identity: IdentityKey,
    /// None when no alternative could be found
    pub to_identity: Option<IdentityKey>,
    pub reason: RotationReason,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    /// Present when the rotation was driven by a threshold breach
    pub breach: Option<ThresholdBreach>,
}

/// Warm-up progression for an identity, as reported by the external
/// warm-up collaborator.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display)]
pub enum WarmupStatus {
    NotStarted,
    InProgress,
    Paused,
    Completed,
    Failed,
}

/// Port to the external warm-up stage scheduler. The admission
/// throttle consults this on every daily-ceiling check; it must not
/// block on network I/O.
pub trait WarmupProvider: Send + Sync {
    /// The daily send ceiling currently assigned to this identity.
    /// Returns 0 if the identity is not enrolled in a warm-up program
    /// or warm-up has not started.
    fn current_daily_limit(&self, identity: &IdentityKey) -> u64;

    fn warmup_status(&self, identity: &IdentityKey) -> WarmupStatus;
}

/// Category of a published notification.
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display,
)]
pub enum NotificationKind {
    ThresholdBreach,
    Rotation,
    IdentityDisabled,
    EmergencyStop,
    SystemError,
}

/// Structured notification handed to the alerting collaborator.
/// Delivery (email/webhook/chat), de-duplication windowing and circuit
/// breaking are owned by the collaborator; publishing never waits for
/// delivery confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Notification {
    pub fn new(kind: NotificationKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Port to the alerting collaborator. Implementations must be
/// fire-and-forget: a slow or failing transport must not stall the
/// publishing call site.
pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, notification: Notification);
}

/// A publisher that drops everything. Useful in tests and as a
/// default when no alerting transport is wired up.
#[derive(Default)]
pub struct NullPublisher;

impl NotificationPublisher for NullPublisher {
    fn publish(&self, _notification: Notification) {}
}
