// External crates
use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use lazy_static::lazy_static;
use serde::Serialize;
use tracing::instrument;

lazy_static! {
    static ref EVENT_TYPE_ID: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_.]*$").unwrap();
}

/// Event types selected by the `audit` preset: account, permission and inventory
/// lifecycle changes.
pub const AUDIT_EVENT_TYPES: &[&str] = &[
    "AccountCreatedEvent",
    "AccountRemovedEvent",
    "AccountUpdatedEvent",
    "UserUpgradeEvent",
    "UserPasswordChanged",
    "AdminPasswordNotChangedEvent",
    "VimAccountPasswordChangedEvent",
    "UserAssignedToGroup",
    "UserUnassignedFromGroup",
    "UserLoginSessionEvent",
    "UserLogoutSessionEvent",
    "HostAdminEnableEvent",
    "HostAdminDisableEvent",
    "AuthorizationEvent",
    "RoleAddedEvent",
    "RoleRemovedEvent",
    "RoleUpdatedEvent",
    "PermissionAddedEvent",
    "PermissionRemovedEvent",
    "PermissionUpdatedEvent",
    "HostConfigAppliedEvent",
    "ClusterReconfiguredEvent",
    "ClusterCreatedEvent",
    "ClusterDestroyedEvent",
    "HostAddedEvent",
    "HostRemovedEvent",
    "VmCreatedEvent",
    "VmRenamedEvent",
    "VmClonedEvent",
    "VmRemovedEvent",
    "VmMigratedEvent",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("lookback must be positive, got {0}")]
    NonPositiveLookback(TimeDelta),
    #[error("lookback of {0} reaches outside the representable time range")]
    OutOfRange(TimeDelta),
    #[error("invalid event type identifier {0:?}")]
    InvalidEventType(String),
}

/// Time window plus event type allowlist handed to the gateway.
///
/// An empty `event_type_ids` list matches every event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventFilterSpec {
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub event_type_ids: Vec<String>,
}

impl EventFilterSpec {
    pub fn matches_all_types(&self) -> bool {
        self.event_type_ids.is_empty()
    }
}

/// Check a single event type identifier.
pub fn validate_event_type(id: &str) -> Result<(), FilterError> {
    if EVENT_TYPE_ID.is_match(id) {
        Ok(())
    } else {
        Err(FilterError::InvalidEventType(id.to_string()))
    }
}

/// Build the filter for a collection cycle: `[now - lookback, now]`.
#[instrument(
    name = "event_collector_filter::build",
    target = "collector::filter",
    skip(event_types),
    level = "debug"
)]
pub fn build_filter(
    now: DateTime<Utc>,
    lookback: TimeDelta,
    event_types: &[String],
) -> Result<EventFilterSpec, FilterError> {
    if lookback <= TimeDelta::zero() {
        tracing::error!(lookback = %lookback, "Rejecting non-positive lookback window");
        return Err(FilterError::NonPositiveLookback(lookback));
    }

    let begin_time = now
        .checked_sub_signed(lookback)
        .ok_or(FilterError::OutOfRange(lookback))?;

    for id in event_types {
        validate_event_type(id)?;
    }

    tracing::debug!(
        begin_time = %begin_time,
        end_time = %now,
        event_type_count = event_types.len(),
        "Event filter built"
    );

    Ok(EventFilterSpec {
        begin_time,
        end_time: now,
        event_type_ids: event_types.to_vec(),
    })
}
