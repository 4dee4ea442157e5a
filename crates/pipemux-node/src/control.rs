use serde::{Deserialize, Serialize};

/// Control message type: the sender closed its endpoint for a route.
pub const CONTROL_CLOSE_ROUTE: &str = "close_route";

/// Payload of a control frame. JSON keeps the control plane inspectable and
/// extensible without a wire format bump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<u64>,
}

impl ControlMessage {
    /// Announce closure of the sending side of `route`.
    pub fn close_route(route: u64) -> Self {
        Self {
            msg_type: CONTROL_CLOSE_ROUTE.to_string(),
            route: Some(route),
        }
    }
}
