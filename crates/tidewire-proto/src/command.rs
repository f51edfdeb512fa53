//! Command names multiplexed over the request channel

use crate::message::{ListenerKey, Request};
use crate::ProtocolError;
use serde_json::Value;

/// Register a listener: `(eventKind, filter) -> key`
pub const ADD_EVENT_LISTENER: &str = "addEventListener";
/// Drop a listener: `(key) -> ()`
pub const REMOVE_EVENT_LISTENER: &str = "removeEventListener";
/// Query registrations: `(eventKind) -> [{key, filter}]`
pub const GET_EVENT_LISTENER_INFOS: &str = "getEventListenerInfos";
/// Push a payload to listeners: `(keys, payload) -> ()`
pub const EMIT_EVENT: &str = "emitEvent";

/// Build a `Service.method` command string
pub fn method_command(service: &str, method: &str) -> String {
    format!("{}.{}", service, method)
}

/// Split a `Service.method` command into its parts
pub fn parse_method_command(command: &str) -> Option<(&str, &str)> {
    let (service, method) = command.split_once('.')?;
    if service.is_empty() || method.is_empty() || method.contains('.') {
        return None;
    }
    Some((service, method))
}

/// Control commands handled by the server itself
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Register a listener for an event kind
    AddEventListener {
        /// Event kind
        event_kind: String,
        /// Filter payload evaluated by emitters
        filter: Value,
    },
    /// Drop a listener
    RemoveEventListener {
        /// Key returned at registration
        key: ListenerKey,
    },
    /// List registrations for an event kind
    GetEventListenerInfos {
        /// Event kind
        event_kind: String,
    },
    /// Push a payload to the given listeners
    EmitEvent {
        /// Target registrations
        keys: Vec<ListenerKey>,
        /// Event payload
        payload: Value,
    },
}

impl ControlRequest {
    /// Command name of this control request
    pub fn command(&self) -> &'static str {
        match self {
            Self::AddEventListener { .. } => ADD_EVENT_LISTENER,
            Self::RemoveEventListener { .. } => REMOVE_EVENT_LISTENER,
            Self::GetEventListenerInfos { .. } => GET_EVENT_LISTENER_INFOS,
            Self::EmitEvent { .. } => EMIT_EVENT,
        }
    }

    /// Convert into a request with positional parameters
    pub fn into_request(self) -> Request {
        let command = self.command();
        let params = match self {
            Self::AddEventListener { event_kind, filter } => {
                vec![Value::String(event_kind), filter]
            }
            Self::RemoveEventListener { key } => vec![Value::String(key.0)],
            Self::GetEventListenerInfos { event_kind } => vec![Value::String(event_kind)],
            Self::EmitEvent { keys, payload } => vec![
                Value::Array(keys.into_iter().map(|key| Value::String(key.0)).collect()),
                payload,
            ],
        };
        Request::new(command, params)
    }

    /// Parse a control request, `Ok(None)` if the command is not a control command
    pub fn from_request(command: &str, params: &[Value]) -> Result<Option<Self>, ProtocolError> {
        let request = match command {
            ADD_EVENT_LISTENER => Self::AddEventListener {
                event_kind: string_param(command, params, 0)?,
                filter: params.get(1).cloned().unwrap_or(Value::Null),
            },
            REMOVE_EVENT_LISTENER => Self::RemoveEventListener {
                key: ListenerKey(string_param(command, params, 0)?),
            },
            GET_EVENT_LISTENER_INFOS => Self::GetEventListenerInfos {
                event_kind: string_param(command, params, 0)?,
            },
            EMIT_EVENT => {
                let keys = match params.first() {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|item| {
                            item.as_str().map(ListenerKey::from).ok_or_else(|| {
                                ProtocolError::Malformed(format!(
                                    "{}: listener keys must be strings",
                                    command
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                    _ => {
                        return Err(ProtocolError::Malformed(format!(
                            "{}: parameter 0 must be an array of keys",
                            command
                        )))
                    }
                };
                Self::EmitEvent {
                    keys,
                    payload: params.get(1).cloned().unwrap_or(Value::Null),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(request))
    }
}

fn string_param(command: &str, params: &[Value], index: usize) -> Result<String, ProtocolError> {
    params
        .get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "{}: parameter {} must be a string",
                command, index
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_command_parsing() {
        assert_eq!(parse_method_command("Echo.say"), Some(("Echo", "say")));
        assert_eq!(method_command("Echo", "say"), "Echo.say");
        assert_eq!(parse_method_command("Echo"), None);
        assert_eq!(parse_method_command(".say"), None);
        assert_eq!(parse_method_command("Echo."), None);
        assert_eq!(parse_method_command("a.b.c"), None);
        assert_eq!(parse_method_command(ADD_EVENT_LISTENER), None);
    }

    #[test]
    fn test_control_request_roundtrip() {
        let requests = vec![
            ControlRequest::AddEventListener {
                event_kind: "Notify".to_string(),
                filter: json!({"room": "A"}),
            },
            ControlRequest::RemoveEventListener {
                key: ListenerKey::from("k1"),
            },
            ControlRequest::GetEventListenerInfos {
                event_kind: "Notify".to_string(),
            },
            ControlRequest::EmitEvent {
                keys: vec![ListenerKey::from("k1"), ListenerKey::from("k2")],
                payload: json!([1, 2, 3]),
            },
        ];

        for control in requests {
            let request = control.clone().into_request();
            let parsed = ControlRequest::from_request(&request.command, &request.params).unwrap();
            assert_eq!(parsed, Some(control));
        }
    }

    #[test]
    fn test_non_control_command() {
        assert_eq!(ControlRequest::from_request("Echo.say", &[json!("hi")]).unwrap(), None);
    }

    #[test]
    fn test_malformed_control_params() {
        assert!(ControlRequest::from_request(ADD_EVENT_LISTENER, &[]).is_err());
        assert!(ControlRequest::from_request(REMOVE_EVENT_LISTENER, &[json!(5)]).is_err());
        assert!(ControlRequest::from_request(EMIT_EVENT, &[json!("k1")]).is_err());
        assert!(ControlRequest::from_request(EMIT_EVENT, &[json!([1]), json!(null)]).is_err());
    }
}
