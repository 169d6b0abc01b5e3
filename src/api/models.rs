use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Connection status of an instance as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Connected,
    Ready,
    Disconnected,
    /// Any pending or unrecognised value, kept verbatim.
    Other(String),
}

impl Status {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "CONNECTED" => Self::Connected,
            "READY" => Self::Ready,
            "DISCONNECTED" => Self::Disconnected,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Connected => "CONNECTED",
            Self::Ready => "READY",
            Self::Disconnected => "DISCONNECTED",
            Self::Other(s) => s,
        }
    }

    /// `CONNECTED` and `READY` both mean the instance is linked to a device.
    pub fn is_paired(&self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }

    pub fn display_class(&self) -> StatusClass {
        if self.is_paired() {
            StatusClass::Connected
        } else if *self == Self::Disconnected {
            StatusClass::Disconnected
        } else {
            StatusClass::Pending
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusClass {
    Connected,
    Disconnected,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_key: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default = "unknown_status")]
    pub status: Status,
}

fn unknown_status() -> Status {
    Status::Other("UNKNOWN".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::Out => "OUT",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub payload: MessagePayload,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub direction: Option<Direction>,
}

impl Message {
    pub fn counterparty(&self) -> &str {
        non_empty(self.from.as_deref())
            .or_else(|| non_empty(self.to.as_deref()))
            .unwrap_or("Unknown")
    }

    pub fn body(&self) -> &str {
        non_empty(self.payload.text.as_deref())
            .or_else(|| non_empty(self.payload.caption.as_deref()))
            .unwrap_or("Media message")
    }

    /// Falls back to the current time when the timestamp is absent or unreadable.
    pub fn local_time(&self) -> DateTime<Local> {
        self.created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now)
            .with_timezone(&Local)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.is_empty())
}

/// A code the user scans to link a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingCode {
    /// Already rendered by the gateway, e.g. `data:image/png;base64,...`.
    Image(String),
    /// Raw payload that still needs to be drawn as a scannable code.
    Text(String),
}

impl PairingCode {
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with("data:image") {
            Self::Image(raw.to_string())
        } else {
            Self::Text(raw.to_string())
        }
    }
}

/// Unwraps the gateway's own `{"data": ...}` wrapper when present.
pub fn inner_data(body: &Value) -> &Value {
    body.get("data").unwrap_or(&Value::Null)
}

/// What a code retrieval returned, once the gateway body is unwrapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeLookup {
    Code(PairingCode),
    AlreadyPaired(Status),
    Nothing,
}

impl CodeLookup {
    pub fn from_body(body: &Value) -> Self {
        let data = inner_data(body);
        let code = ["qr", "qr_code"]
            .iter()
            .filter_map(|k| data.get(*k).and_then(Value::as_str))
            .find(|s| !s.is_empty());
        if let Some(code) = code {
            return Self::Code(PairingCode::parse(code));
        }
        match data.get("status").and_then(Value::as_str).map(Status::parse) {
            Some(status) if status.is_paired() => Self::AlreadyPaired(status),
            _ => Self::Nothing,
        }
    }
}

pub fn status_from_body(body: &Value) -> Option<Status> {
    inner_data(body).get("status").and_then(Value::as_str).map(Status::parse)
}

pub fn instances_from_body(body: &Value) -> Vec<Instance> {
    inner_data(body)
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Instance>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn messages_from_body(body: &Value) -> Vec<Message> {
    inner_data(body)
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Message>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_connected_and_ready_are_paired() {
        assert!(Status::parse("CONNECTED").is_paired());
        assert!(Status::parse("READY").is_paired());
        assert!(!Status::parse("DISCONNECTED").is_paired());
        assert!(!Status::parse("QR_PENDING").is_paired());
        assert!(!Status::parse("connected").is_paired());
    }

    #[test]
    fn display_class_is_three_way() {
        assert_eq!(Status::Ready.display_class(), StatusClass::Connected);
        assert_eq!(Status::Disconnected.display_class(), StatusClass::Disconnected);
        assert_eq!(Status::parse("STARTING").display_class(), StatusClass::Pending);
    }

    #[test]
    fn code_lookup_prefers_code_over_status() {
        let body = json!({"data": {"qr_code": "2@abc", "status": "CONNECTED"}});
        assert_eq!(CodeLookup::from_body(&body), CodeLookup::Code(PairingCode::Text("2@abc".into())));

        let body = json!({"data": {"qr": "data:image/png;base64,AAA"}});
        assert!(matches!(CodeLookup::from_body(&body), CodeLookup::Code(PairingCode::Image(_))));
    }

    #[test]
    fn code_lookup_detects_paired_without_code() {
        let body = json!({"data": {"status": "READY"}});
        assert_eq!(CodeLookup::from_body(&body), CodeLookup::AlreadyPaired(Status::Ready));
        let body = json!({"data": {"status": "STARTING", "qr": ""}});
        assert_eq!(CodeLookup::from_body(&body), CodeLookup::Nothing);
        assert_eq!(CodeLookup::from_body(&Value::Null), CodeLookup::Nothing);
    }

    #[test]
    fn message_projection_falls_back() {
        let m: Message = serde_json::from_value(json!({
            "to": "+15550100",
            "payload": {"caption": "look"},
            "direction": "OUT"
        }))
        .unwrap();
        assert_eq!(m.counterparty(), "+15550100");
        assert_eq!(m.body(), "look");

        let m: Message = serde_json::from_value(json!({"payload": {"media": "https://x/y.png"}})).unwrap();
        assert_eq!(m.counterparty(), "Unknown");
        assert_eq!(m.body(), "Media message");
    }

    #[test]
    fn timestamps_accept_common_shapes() {
        assert!(parse_timestamp("2025-03-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2025-03-01 10:00:00").is_some());
        assert!(parse_timestamp("2025-03-01T10:00:00.123456").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn instances_skip_malformed_entries() {
        let body = json!({"data": [
            {"instance_key": "a", "phone_number": "1", "status": "READY"},
            {"phone_number": "2"}
        ]});
        let list = instances_from_body(&body);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, Status::Ready);
    }
}
