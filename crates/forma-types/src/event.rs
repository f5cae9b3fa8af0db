use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event envelope published on the engine bus and forwarded to clients.
///
/// `properties` carries a `sessionID` field for every session-scoped event
/// so transports can filter the bus down to one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl ClientEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.properties
            .get("sessionID")
            .or_else(|| self.properties.get("sessionId"))
            .and_then(|v| v.as_str())
    }
}
