use serde::{Deserialize, Serialize};

/// Sent to every viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerSignal {
    HeartRate { value: u16 },
    Status { message: String },
    Error { message: String },
}

impl ViewerSignal {
    pub fn status(message: impl Into<String>) -> Self {
        ViewerSignal::Status { message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ViewerSignal::Error { message: message.into() }
    }
}

/// Received from a viewer. Anything that does not parse as one of the known
/// actions becomes `Unknown` and is dropped by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ViewerCommand {
    Connect { address: String },
    Disconnect,
    #[serde(skip)]
    Unknown,
}

impl ViewerCommand {
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or(ViewerCommand::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_shapes() {
        assert_eq!(
            serde_json::to_value(ViewerSignal::HeartRate { value: 72 }).unwrap(),
            json!({"type": "heart_rate", "value": 72})
        );
        assert_eq!(
            serde_json::to_value(ViewerSignal::status("Disconnected")).unwrap(),
            json!({"type": "status", "message": "Disconnected"})
        );
        assert_eq!(
            serde_json::to_value(ViewerSignal::error("boom")).unwrap(),
            json!({"type": "error", "message": "boom"})
        );
    }

    #[test]
    fn test_inbound_commands() {
        assert_eq!(
            ViewerCommand::parse(r#"{"action":"connect","address":"AA:BB"}"#),
            ViewerCommand::Connect { address: "AA:BB".to_string() }
        );
        assert_eq!(ViewerCommand::parse(r#"{"action":"disconnect"}"#), ViewerCommand::Disconnect);
    }

    #[test]
    fn test_malformed_commands_are_unknown() {
        for text in [
            r#"{"action":"connect"}"#,
            r#"{"action":"reboot"}"#,
            r#"{"address":"AA:BB"}"#,
            r#"{"action":"unknown"}"#,
            "[1,2,3]",
            "not json",
        ] {
            assert_eq!(ViewerCommand::parse(text), ViewerCommand::Unknown, "{text}");
        }
    }
}
