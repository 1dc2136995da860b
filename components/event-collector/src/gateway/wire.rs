//! VI/JSON wire formats: request bodies, managed object references, faults and
//! the decoding of raw event objects into `Event`.

// Local crates
use crate::{
    collector::filter::EventFilterSpec,
    gateway::gateway::GatewayError,
    models::event::{AttributeValue, ContextKey, Event, Severity},
};

// External crates
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value, json};

/// Faults that mean "your session or credentials are not (yet) good".
const AUTHENTICATION_FAULTS: &[&str] = &["InvalidLogin", "NotAuthenticated", "NoPermission"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManagedObjectReference {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

/// The parts of `ServiceContent` the gateway needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContent {
    pub session_manager: Option<ManagedObjectReference>,
    pub event_manager: Option<ManagedObjectReference>,
}

pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn login_body(username: &str, password: &str) -> Value {
    json!({ "userName": username, "password": password })
}

pub fn create_collector_body(filter: &EventFilterSpec) -> Value {
    let mut filter_spec = json!({
        "_typeName": "EventFilterSpec",
        "time": {
            "_typeName": "EventFilterSpecByTime",
            "beginTime": format_instant(&filter.begin_time),
            "endTime": format_instant(&filter.end_time),
        },
    });
    if !filter.matches_all_types() {
        filter_spec["eventTypeId"] = json!(filter.event_type_ids);
    }
    json!({ "filter": filter_spec })
}

pub fn read_next_body(max_count: usize) -> Value {
    json!({ "maxCount": max_count })
}

/// Turn a non-success HTTP answer into a classified `GatewayError`.
///
/// Method faults arrive as HTTP 500 with a typed body; untyped 5xx answers come
/// from proxies or a restarting service and are treated as transient.
pub fn classify_failure(status: StatusCode, body: &str) -> GatewayError {
    let fault = serde_json::from_str::<Value>(body).ok();
    let fault_type = fault
        .as_ref()
        .and_then(|v| v.get("_typeName"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let message = fault
        .as_ref()
        .and_then(fault_message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

    match fault_type {
        Some(kind) if AUTHENTICATION_FAULTS.contains(&kind.as_str()) => {
            GatewayError::Connection(format!("authentication failed ({kind}): {message}"))
        }
        Some(kind) => GatewayError::Fault {
            fault: kind,
            message,
        },
        None if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
            GatewayError::Connection(format!("authentication failed: HTTP {status}"))
        }
        None if status.is_server_error() => {
            GatewayError::Connection(format!("server unavailable: HTTP {status}"))
        }
        None => GatewayError::Fault {
            fault: format!("HTTP {}", status.as_u16()),
            message,
        },
    }
}

fn fault_message(fault: &Value) -> Option<String> {
    if let Some(text) = fault.get("faultstring").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    if let Some(text) = fault.get("message").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    fault
        .get("faultMessage")
        .and_then(Value::as_array)
        .and_then(|messages| messages.first())
        .and_then(|m| m.get("message"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Decode one `ReadNextEvents` answer into events, preserving page order.
pub fn decode_page(body: Value) -> Result<Vec<Event>, GatewayError> {
    match body {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.into_iter().map(decode_event).collect(),
        other => Err(GatewayError::InvalidResponse(format!(
            "expected an array of events, got {}",
            json_kind(&other)
        ))),
    }
}

/// Decode a single raw vim25 event object.
pub fn decode_event(raw: Value) -> Result<Event, GatewayError> {
    let Value::Object(mut fields) = raw else {
        return Err(GatewayError::InvalidResponse(
            "event entry is not an object".to_string(),
        ));
    };

    let created_raw = take_string(&mut fields, "createdTime").ok_or_else(|| {
        GatewayError::InvalidResponse("event without createdTime".to_string())
    })?;
    let created_time = DateTime::parse_from_rfc3339(&created_raw)
        .map_err(|e| {
            GatewayError::InvalidResponse(format!("bad createdTime {created_raw:?}: {e}"))
        })?
        .with_timezone(&Utc);

    let message = take_string(&mut fields, "fullFormattedMessage").unwrap_or_default();
    let user_name = take_string(&mut fields, "userName").filter(|u| !u.is_empty());
    let type_name = take_string(&mut fields, "_typeName").unwrap_or_else(|| "Event".to_string());
    let severity = severity_of(&type_name, &fields);

    let mut event = Event::new(created_time, message)
        .with_type_name(type_name)
        .with_severity(severity);
    if let Some(key) = fields.get("key").and_then(Value::as_i64) {
        event = event.with_key(key);
    }
    if let Some(user_name) = user_name {
        event = event.with_user_name(user_name);
    }

    for (name, value) in fields {
        if value.is_null() {
            continue;
        }
        if let Some(slot) = ContextKey::from_wire_name(&name) {
            event = event.with_context(slot, decode_attribute(value));
        } else if is_scalar(&value) {
            event = event.with_property(name, value);
        }
    }

    Ok(event)
}

fn decode_attribute(value: Value) -> AttributeValue {
    match value.get("name").and_then(Value::as_str) {
        Some(name) => AttributeValue::Reference {
            name: name.to_string(),
        },
        None => AttributeValue::Raw(value),
    }
}

fn severity_of(type_name: &str, fields: &Map<String, Value>) -> Severity {
    if let Some(raw) = fields.get("severity").and_then(Value::as_str) {
        return Severity::from_vendor(raw);
    }
    if type_name == "AlarmStatusChangedEvent" {
        if let Some(severity) = fields
            .get("to")
            .and_then(Value::as_str)
            .and_then(Severity::from_alarm_status)
        {
            return severity;
        }
    }
    Severity::Info
}

fn take_string(fields: &mut Map<String, Value>, name: &str) -> Option<String> {
    match fields.remove(name) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
