//! The `Event` record produced by a gateway cursor and consumed by the sink.
//!
//! An `Event` is built once per page fetch and never mutated afterwards. The
//! creation timestamp is the only ordering key; everything else is carried for
//! projection into the sink.

// External crates
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Event severity used to route operational log entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Map a vendor severity string (`EventEx.severity`) onto a `Severity`.
    ///
    /// vCenter also emits `user` for user-generated events, which is routed as info.
    pub fn from_vendor(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            _ => Severity::Info,
        }
    }

    /// Map an alarm status colour (`AlarmStatusChangedEvent.to`) onto a `Severity`.
    pub fn from_alarm_status(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "red" => Some(Severity::Error),
            "yellow" => Some(Severity::Warning),
            "green" | "gray" => Some(Severity::Info),
            _ => None,
        }
    }
}

/// Named context slots an event may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextKey {
    Host,
    Vm,
    Datastore,
    DistributedSwitch,
    Network,
    ComputeResource,
    Datacenter,
    Info,
    IpAddress,
}

impl ContextKey {
    pub const ALL: [ContextKey; 9] = [
        ContextKey::Host,
        ContextKey::Vm,
        ContextKey::Datastore,
        ContextKey::DistributedSwitch,
        ContextKey::Network,
        ContextKey::ComputeResource,
        ContextKey::Datacenter,
        ContextKey::Info,
        ContextKey::IpAddress,
    ];

    /// Property name used by the vim25 wire format and by the structured sink.
    pub fn wire_name(self) -> &'static str {
        match self {
            ContextKey::Host => "host",
            ContextKey::Vm => "vm",
            ContextKey::Datastore => "ds",
            ContextKey::DistributedSwitch => "dvs",
            ContextKey::Network => "net",
            ContextKey::ComputeResource => "computeResource",
            ContextKey::Datacenter => "datacenter",
            ContextKey::Info => "info",
            ContextKey::IpAddress => "ipAddress",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        ContextKey::ALL.into_iter().find(|k| k.wire_name() == name)
    }
}

/// Value held by a context slot.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Reference-like object (`HostEventArgument`, `VmEventArgument`, ...) exposing a display name.
    Reference { name: String },
    /// Anything else, kept as the raw wire value.
    Raw(Value),
}

/// Explicit attribute enumeration used for structured projection.
///
/// Implementors list the attributes they actually carry; absent attributes are
/// simply not returned.
pub trait EventAttributes {
    /// Scalar attributes, keyed by property name.
    fn scalar_attributes(&self) -> Vec<(&str, &Value)>;

    /// Context attributes present on the record, in `ContextKey` order.
    fn context_attributes(&self) -> Vec<(ContextKey, &AttributeValue)>;
}

/// A single vCenter event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub created_time: DateTime<Utc>,
    pub severity: Severity,
    pub full_formatted_message: String,
    pub user_name: Option<String>,
    /// Vendor type name, e.g. `VmPoweredOnEvent`.
    pub type_name: String,
    pub key: Option<i64>,
    pub context: BTreeMap<ContextKey, AttributeValue>,
    pub properties: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(created_time: DateTime<Utc>, full_formatted_message: impl Into<String>) -> Self {
        Self {
            created_time,
            severity: Severity::Info,
            full_formatted_message: full_formatted_message.into(),
            user_name: None,
            type_name: String::from("Event"),
            key: None,
            context: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    pub fn with_key(mut self, key: i64) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_context(mut self, key: ContextKey, value: AttributeValue) -> Self {
        self.context.insert(key, value);
        self
    }

    /// Shorthand for a reference context slot with a display name.
    pub fn with_reference(self, key: ContextKey, name: impl Into<String>) -> Self {
        self.with_context(key, AttributeValue::Reference { name: name.into() })
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}

impl EventAttributes for Event {
    fn scalar_attributes(&self) -> Vec<(&str, &Value)> {
        self.properties
            .iter()
            .map(|(name, value)| (name.as_str(), value))
            .collect()
    }

    fn context_attributes(&self) -> Vec<(ContextKey, &AttributeValue)> {
        self.context.iter().map(|(k, v)| (*k, v)).collect()
    }
}
