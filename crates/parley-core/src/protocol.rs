use serde::{Deserialize, Serialize};

use crate::events::{BridgeCommand, BridgeEvent};

/// One line of the bridge protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub id: String,
    #[serde(flatten)]
    pub content: BridgeMessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BridgeMessageContent {
    Command(BridgeCommand),
    Event(BridgeEvent),
}

impl BridgeMessage {
    pub fn new_command(command: BridgeCommand) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: BridgeMessageContent::Command(command),
        }
    }

    pub fn new_event(event: BridgeEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: BridgeMessageContent::Event(event),
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        Ok(serde_json::to_string(self)? + "\n")
    }

    pub fn from_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    pub fn into_event(self) -> Option<BridgeEvent> {
        match self.content {
            BridgeMessageContent::Event(event) => Some(event),
            BridgeMessageContent::Command(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_disconnect_event_line() {
        let line = r#"{"id":"abc","type":"Disconnected","payload":{"tenant_id":"t1","status_code":401,"reason":"logged out"}}"#;
        let event = BridgeMessage::from_line(line).and_then(BridgeMessage::into_event);
        match event {
            Some(BridgeEvent::Disconnected { tenant_id, status_code, .. }) => {
                assert_eq!(tenant_id, "t1");
                assert_eq!(status_code, Some(401));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn command_line_is_newline_terminated_and_tagged() {
        let msg = BridgeMessage::new_command(BridgeCommand::Logout { tenant_id: "t1".into() });
        let line = msg.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "Logout");
        assert_eq!(value["payload"]["tenant_id"], "t1");
        assert_eq!(value["id"], msg.id.as_str());
    }

    #[test]
    fn garbage_line_is_ignored() {
        assert!(BridgeMessage::from_line("npm WARN something").is_none());
    }
}
