//! Protocol message types.
//!
//! A caller sends a [`Request`] naming a member path and an [`Operation`];
//! the exposing side answers with a [`Response`] carrying the same id and a
//! [`WireValue`]. Messages travel in-process, so PROXY and HANDLER wire
//! values carry their [`Port`]s directly; the same ports are also listed in
//! the message's transfer list when it is posted.
//!
//! Transports that cannot carry ports in-band use the JSON envelope from
//! [`Message::to_json`], where each port is replaced by its index in the
//! transfer list.

use crate::channel::Port;
use farcall_types::error::{ErrorObject, Fault, RpcError, RpcResult};
use serde::{Deserialize, Serialize};

/// A value encoded for transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// JSON data, passed through unchanged.
    Raw(serde_json::Value),
    /// Reference to a remote object exposed on the other end of this port.
    Proxy(Port),
    /// Value encoded by a registered transfer handler.
    Handler {
        /// Registered handler name.
        name: String,
        /// Handler-produced payload.
        payload: serde_json::Value,
        /// Ports the handler moves with the payload.
        ports: Vec<Port>,
    },
    /// A thrown failure.
    Throw {
        /// Whether `value` is a structured `{name, message, stack}` error.
        is_error: bool,
        /// The error payload, or the raw thrown value.
        value: serde_json::Value,
    },
}

impl WireValue {
    /// Wire tag of this value.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Raw(_) => "RAW",
            Self::Proxy(_) => "PROXY",
            Self::Handler { .. } => "HANDLER",
            Self::Throw { .. } => "THROW",
        }
    }

    /// Encode a fault as a THROW value.
    pub fn throw(fault: &Fault) -> Self {
        match fault {
            Fault::Error(err) => Self::Throw {
                is_error: true,
                value: err.to_json(),
            },
            Fault::Value(value) => Self::Throw {
                is_error: false,
                value: value.clone(),
            },
        }
    }

    /// Rebuild the fault carried by a THROW value.
    pub fn into_fault(self) -> Option<Fault> {
        match self {
            Self::Throw {
                is_error: true,
                value,
            } => Some(Fault::Error(ErrorObject::from_json(&value))),
            Self::Throw {
                is_error: false,
                value,
            } => Some(Fault::Value(value)),
            _ => None,
        }
    }

    /// Ports embedded in this value.
    pub fn ports(&self) -> Vec<Port> {
        match self {
            Self::Proxy(port) => vec![port.clone()],
            Self::Handler { ports, .. } => ports.clone(),
            Self::Raw(_) | Self::Throw { .. } => Vec::new(),
        }
    }
}

/// What a request asks the exposing side to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Read the member at the path.
    Get,
    /// Assign `value` to the member at the path.
    Set {
        /// The encoded new value.
        value: WireValue,
    },
    /// Call the function at the path with its parent as `this`.
    Apply {
        /// Encoded arguments.
        arguments: Vec<WireValue>,
    },
    /// Construct an instance of the class at the path.
    Construct {
        /// Encoded arguments.
        arguments: Vec<WireValue>,
    },
    /// Open a new channel exposing the same root.
    Endpoint,
    /// Stop serving this channel.
    Release,
    /// An operation type this implementation does not understand.
    Other(String),
}

impl Operation {
    /// Wire name of the operation type.
    pub fn name(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Set { .. } => "SET",
            Self::Apply { .. } => "APPLY",
            Self::Construct { .. } => "CONSTRUCT",
            Self::Endpoint => "ENDPOINT",
            Self::Release => "RELEASE",
            Self::Other(name) => name,
        }
    }
}

/// An operation request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Unique request id, echoed by the response.
    pub id: String,
    /// Member names leading from the exposed root to the target.
    pub path: Vec<String>,
    /// The operation to perform.
    pub operation: Operation,
}

/// The answer to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the request being answered.
    pub id: String,
    /// The result or failure.
    pub value: WireValue,
}

/// Any message exchanged over an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Request from a remote handle.
    Request(Request),
    /// Response from a dispatcher.
    Response(Response),
}

impl Message {
    /// The request id this message belongs to.
    pub fn id(&self) -> &str {
        match self {
            Self::Request(req) => &req.id,
            Self::Response(resp) => &resp.id,
        }
    }
}

impl Message {
    /// Encode as a JSON envelope. Ports are replaced by indexes into the
    /// returned list, which is the transfer list to send alongside.
    pub fn to_json(&self) -> RpcResult<(serde_json::Value, Vec<Port>)> {
        let mut ports = PortTable::default();
        let frame = match self {
            Self::Request(req) => {
                let (value, argument_list) = match &req.operation {
                    Operation::Set { value } => (Some(ports.frame(value)), None),
                    Operation::Apply { arguments } | Operation::Construct { arguments } => {
                        (None, Some(arguments.iter().map(|a| ports.frame(a)).collect()))
                    }
                    _ => (None, None),
                };
                MessageFrame {
                    id: req.id.clone(),
                    kind: FrameKind::Request(RequestFrame {
                        op: req.operation.name().to_string(),
                        path: req.path.clone(),
                        value,
                        argument_list,
                    }),
                }
            }
            Self::Response(resp) => MessageFrame {
                id: resp.id.clone(),
                kind: FrameKind::Response(ResponseFrame {
                    value: ports.frame(&resp.value),
                }),
            },
        };
        let json = serde_json::to_value(&frame)
            .map_err(|e| RpcError::Protocol(format!("Failed to encode message: {e}")))?;
        Ok((json, ports.ports))
    }

    /// Decode a JSON envelope produced by [`Message::to_json`], resolving
    /// port indexes against `ports`.
    ///
    /// Operation types this side does not know decode to
    /// [`Operation::Other`].
    pub fn from_json(json: serde_json::Value, ports: &[Port]) -> RpcResult<Message> {
        let frame: MessageFrame = serde_json::from_value(json)
            .map_err(|e| RpcError::Protocol(format!("Malformed message: {e}")))?;
        match frame.kind {
            FrameKind::Request(req) => {
                let operation = match req.op.as_str() {
                    "GET" => Operation::Get,
                    "SET" => {
                        let value = req.value.ok_or_else(|| {
                            RpcError::Protocol("SET request without a value".to_string())
                        })?;
                        Operation::Set {
                            value: value.resolve(ports)?,
                        }
                    }
                    "APPLY" | "CONSTRUCT" => {
                        let arguments = req
                            .argument_list
                            .unwrap_or_default()
                            .into_iter()
                            .map(|a| a.resolve(ports))
                            .collect::<RpcResult<Vec<_>>>()?;
                        if req.op == "APPLY" {
                            Operation::Apply { arguments }
                        } else {
                            Operation::Construct { arguments }
                        }
                    }
                    "ENDPOINT" => Operation::Endpoint,
                    "RELEASE" => Operation::Release,
                    _ => Operation::Other(req.op),
                };
                Ok(Message::Request(Request {
                    id: frame.id,
                    path: req.path,
                    operation,
                }))
            }
            FrameKind::Response(resp) => Ok(Message::Response(Response {
                id: frame.id,
                value: resp.value.resolve(ports)?,
            })),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MessageFrame {
    id: String,
    #[serde(flatten)]
    kind: FrameKind,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
enum FrameKind {
    Request(RequestFrame),
    Response(ResponseFrame),
}

#[derive(Serialize, Deserialize)]
struct RequestFrame {
    /// Kept as a string so unknown operation types survive decoding.
    #[serde(rename = "type")]
    op: String,
    #[serde(default)]
    path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<ValueFrame>,
    #[serde(
        default,
        rename = "argumentList",
        skip_serializing_if = "Option::is_none"
    )]
    argument_list: Option<Vec<ValueFrame>>,
}

#[derive(Serialize, Deserialize)]
struct ResponseFrame {
    value: ValueFrame,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum ValueFrame {
    Raw {
        value: serde_json::Value,
    },
    Proxy {
        port: usize,
    },
    Handler {
        name: String,
        value: serde_json::Value,
        #[serde(default)]
        ports: Vec<usize>,
    },
    Throw {
        #[serde(rename = "isError")]
        is_error: bool,
        value: serde_json::Value,
    },
}

impl ValueFrame {
    fn resolve(self, ports: &[Port]) -> RpcResult<WireValue> {
        let port = |index: usize| {
            ports.get(index).cloned().ok_or_else(|| {
                RpcError::Protocol(format!(
                    "Port index {index} out of range ({} transferred)",
                    ports.len()
                ))
            })
        };
        Ok(match self {
            Self::Raw { value } => WireValue::Raw(value),
            Self::Proxy { port: index } => WireValue::Proxy(port(index)?),
            Self::Handler {
                name,
                value,
                ports: indexes,
            } => WireValue::Handler {
                name,
                payload: value,
                ports: indexes
                    .into_iter()
                    .map(port)
                    .collect::<RpcResult<Vec<_>>>()?,
            },
            Self::Throw { is_error, value } => WireValue::Throw { is_error, value },
        })
    }
}

/// Ports seen while framing a message, each listed once.
#[derive(Default)]
struct PortTable {
    ports: Vec<Port>,
}

impl PortTable {
    fn index(&mut self, port: &Port) -> usize {
        match self.ports.iter().position(|p| p.same_port(port)) {
            Some(index) => index,
            None => {
                self.ports.push(port.clone());
                self.ports.len() - 1
            }
        }
    }

    fn frame(&mut self, value: &WireValue) -> ValueFrame {
        match value {
            WireValue::Raw(value) => ValueFrame::Raw {
                value: value.clone(),
            },
            WireValue::Proxy(port) => ValueFrame::Proxy {
                port: self.index(port),
            },
            WireValue::Handler {
                name,
                payload,
                ports,
            } => ValueFrame::Handler {
                name: name.clone(),
                value: payload.clone(),
                ports: ports.iter().map(|p| self.index(p)).collect(),
            },
            WireValue::Throw { is_error, value } => ValueFrame::Throw {
                is_error: *is_error,
                value: value.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use serde_json::json;

    #[test]
    fn test_structured_throw_roundtrip() {
        let fault = Fault::Error(ErrorObject::named("TypeError", "nope").with_stack("trace"));
        let wire = WireValue::throw(&fault);
        assert_eq!(wire.kind(), "THROW");
        match &wire {
            WireValue::Throw { is_error, value } => {
                assert!(is_error);
                assert_eq!(value["message"], "nope");
            }
            other => panic!("Expected Throw, got {other:?}"),
        }
        assert_eq!(wire.into_fault(), Some(fault));
    }

    #[test]
    fn test_raw_throw_keeps_value() {
        let wire = WireValue::throw(&Fault::value(json!({"code": 7})));
        assert_eq!(wire.into_fault(), Some(Fault::value(json!({"code": 7}))));
    }

    #[test]
    fn test_non_throw_has_no_fault() {
        assert!(WireValue::Raw(json!(1)).into_fault().is_none());
    }

    #[test]
    fn test_embedded_ports() {
        let (a, b) = MessageChannel::new();
        assert_eq!(WireValue::Proxy(a.clone()).ports(), vec![a.clone()]);
        let handler = WireValue::Handler {
            name: "port".into(),
            payload: json!(null),
            ports: vec![a.clone(), b.clone()],
        };
        assert_eq!(handler.ports().len(), 2);
        assert!(WireValue::Raw(json!("x")).ports().is_empty());
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::Get.name(), "GET");
        assert_eq!(Operation::Apply { arguments: vec![] }.name(), "APPLY");
        assert_eq!(Operation::Other("PATCH".into()).name(), "PATCH");
    }

    #[test]
    fn test_message_id() {
        let msg = Message::Request(Request {
            id: "req-1".into(),
            path: vec!["a".into()],
            operation: Operation::Get,
        });
        assert_eq!(msg.id(), "req-1");
    }

    #[test]
    fn test_json_envelope_carries_ports_by_index() {
        let (a, _b) = MessageChannel::new();
        let msg = Message::Request(Request {
            id: "req-2".into(),
            path: vec!["math".into(), "add".into()],
            operation: Operation::Apply {
                arguments: vec![
                    WireValue::Raw(json!(2)),
                    WireValue::Proxy(a.clone()),
                    WireValue::Handler {
                        name: "port".into(),
                        payload: json!(null),
                        ports: vec![a.clone()],
                    },
                ],
            },
        });
        let (encoded, ports) = msg.to_json().unwrap();
        assert_eq!(ports, vec![a.clone()]);
        assert_eq!(encoded["message"], "request");
        assert_eq!(encoded["type"], "APPLY");
        assert_eq!(encoded["argumentList"][1], json!({"type": "PROXY", "port": 0}));

        assert_eq!(Message::from_json(encoded, &ports).unwrap(), msg);
    }

    #[test]
    fn test_json_response_with_throw() {
        let msg = Message::Response(Response {
            id: "req-3".into(),
            value: WireValue::throw(&Fault::type_error("nope")),
        });
        let (encoded, ports) = msg.to_json().unwrap();
        assert!(ports.is_empty());
        assert_eq!(encoded["value"]["type"], "THROW");
        assert_eq!(encoded["value"]["isError"], true);
        assert_eq!(Message::from_json(encoded, &[]).unwrap(), msg);
    }

    #[test]
    fn test_unknown_operation_type_decodes_to_other() {
        let decoded = Message::from_json(
            json!({"id": "req-4", "message": "request", "type": "PATCH", "path": ["a"]}),
            &[],
        )
        .unwrap();
        match decoded {
            Message::Request(req) => {
                assert_eq!(req.operation, Operation::Other("PATCH".into()));
                assert_eq!(req.path, vec!["a".to_string()]);
            }
            other => panic!("Expected Request, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_port_index_is_protocol_error() {
        let err = Message::from_json(
            json!({"id": "req-5", "message": "response", "value": {"type": "PROXY", "port": 3}}),
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));

        let err = Message::from_json(json!({"id": "req-6", "message": "request", "type": "SET"}), &[])
            .unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
