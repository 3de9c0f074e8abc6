//! Frames of the multiplex socket: `{action, topic?, data?}` both ways.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MessageError(pub String);

#[derive(Debug, Deserialize)]
struct RawMessage {
    action: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TerminalInput {
    #[serde(default = "default_terminal_id")]
    pub terminal_id: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TerminalResize {
    #[serde(default = "default_terminal_id")]
    pub terminal_id: String,
    #[serde(flatten)]
    pub size: TerminalSize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct DashboardRequest {
    /// Seconds between ticks; must be one of the allowed intervals.
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub operations: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplicationMonitorRequest {
    pub application_id: String,
    #[serde(default)]
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Ping,
    Subscribe { topic: String, resource_id: String },
    Unsubscribe { topic: String, resource_id: String },
    Terminal(TerminalInput),
    TerminalResize(TerminalResize),
    DashboardMonitor(DashboardRequest),
    StopDashboardMonitor,
    MonitorApplication(ApplicationMonitorRequest),
    StopApplicationMonitor { application_id: String },
    CloseTerminal { terminal_id: String },
}

fn default_terminal_id() -> String {
    "default".to_string()
}

fn decode<T: serde::de::DeserializeOwned>(action: &str, data: Value) -> Result<T, MessageError> {
    let data = if data.is_null() { json!({}) } else { data };
    serde_json::from_value(data).map_err(|error| MessageError(format!("invalid data for {action}: {error}")))
}

fn topic_and_resource(action: &str, topic: Option<String>, data: &Value) -> Result<(String, String), MessageError> {
    let topic = topic
        .filter(|topic| !topic.trim().is_empty())
        .ok_or_else(|| MessageError(format!("{action} requires a topic")))?;
    let resource_id = data
        .get("resource_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| MessageError(format!("{action} requires data.resource_id")))?;
    Ok((topic, resource_id.to_string()))
}

impl ClientMessage {
    /// # Errors
    /// Returns a [`MessageError`] for malformed JSON, an unknown action or
    /// data that does not fit the action.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|error| MessageError(format!("malformed message: {error}")))?;
        let action = raw.action.as_str();

        match action {
            "ping" => Ok(Self::Ping),
            "subscribe" => {
                let (topic, resource_id) = topic_and_resource(action, raw.topic, &raw.data)?;
                Ok(Self::Subscribe { topic, resource_id })
            }
            "unsubscribe" => {
                let (topic, resource_id) = topic_and_resource(action, raw.topic, &raw.data)?;
                Ok(Self::Unsubscribe { topic, resource_id })
            }
            "terminal" => decode(action, raw.data).map(Self::Terminal),
            "terminal_resize" => decode(action, raw.data).map(Self::TerminalResize),
            "close_terminal" => {
                let input: TerminalInput = decode(action, raw.data)?;
                Ok(Self::CloseTerminal {
                    terminal_id: input.terminal_id,
                })
            }
            "dashboard_monitor" => decode(action, raw.data).map(Self::DashboardMonitor),
            "stop_dashboard_monitor" => Ok(Self::StopDashboardMonitor),
            "monitor_application" => decode(action, raw.data).map(Self::MonitorApplication),
            "stop_application_monitor" => {
                let request: ApplicationMonitorRequest = decode(action, raw.data)?;
                Ok(Self::StopApplicationMonitor {
                    application_id: request.application_id,
                })
            }
            other => Err(MessageError(format!("unknown action '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub data: Value,
}

impl ServerMessage {
    #[must_use]
    pub fn new(action: &str, data: Value) -> Self {
        Self {
            action: action.to_string(),
            topic: None,
            data,
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::new("pong", Value::Null)
    }

    #[must_use]
    pub fn error(message: &str) -> Self {
        Self::new("error", json!({ "message": message }))
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"action":"error","data":null}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_needs_a_topic_and_resource() {
        let message = ClientMessage::parse(
            r#"{"action":"subscribe","topic":"deployments","data":{"resource_id":"app-1"}}"#,
        )
        .expect("subscribe");
        assert_eq!(
            message,
            ClientMessage::Subscribe {
                topic: "deployments".to_string(),
                resource_id: "app-1".to_string(),
            }
        );

        assert!(ClientMessage::parse(r#"{"action":"subscribe","data":{"resource_id":"a"}}"#).is_err());
        assert!(ClientMessage::parse(r#"{"action":"subscribe","topic":"deployments"}"#).is_err());
    }

    #[test]
    fn terminal_messages_default_their_id() {
        let message = ClientMessage::parse(r#"{"action":"terminal","data":{"value":"ls\n"}}"#).expect("terminal");
        assert_eq!(
            message,
            ClientMessage::Terminal(TerminalInput {
                terminal_id: "default".to_string(),
                value: "ls\n".to_string(),
            })
        );

        let resize = ClientMessage::parse(r#"{"action":"terminal_resize","data":{"rows":40,"cols":120}}"#)
            .expect("resize");
        assert_eq!(
            resize,
            ClientMessage::TerminalResize(TerminalResize {
                terminal_id: "default".to_string(),
                size: TerminalSize { rows: 40, cols: 120 },
            })
        );
    }

    #[test]
    fn unknown_actions_and_bad_data_are_errors() {
        assert!(ClientMessage::parse(r#"{"action":"reboot"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"action":"terminal_resize","data":{"rows":"many"}}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
        assert_eq!(ClientMessage::parse(r#"{"action":"ping"}"#), Ok(ClientMessage::Ping));
    }

    #[test]
    fn server_messages_omit_absent_topics() {
        assert_eq!(ServerMessage::pong().to_json(), r#"{"action":"pong","data":null}"#);
        let event = ServerMessage::new("deployments", json!({ "status": "live" })).with_topic("deployments");
        assert_eq!(
            event.to_json(),
            r#"{"action":"deployments","topic":"deployments","data":{"status":"live"}}"#
        );
    }
}
