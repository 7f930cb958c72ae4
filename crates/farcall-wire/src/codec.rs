//! Wire value codec.
//!
//! [`Codec`] bundles everything encoding and decoding need: the handler
//! registry, the transfer side-table and the protocol configuration. It is
//! cheap to clone and every clone shares the same state. Dispatchers and
//! remote handles created from a codec carry it along, so nested proxies use
//! the same handlers as the channel they came from.

use crate::channel::{Endpoint, ListenerId, MessageChannel, Port};
use crate::dispatcher::Dispatcher;
use crate::handler::HandlerRegistry;
use crate::message::WireValue;
use crate::remote::Remote;
use crate::transfer::TransferTable;
use crate::value::{Object, Value};
use farcall_types::config::ProtocolConfig;
use farcall_types::error::{RpcError, RpcResult};
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// A wire value plus every port that must move with it.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub wire: WireValue,
    pub transfer: Vec<Port>,
}

/// Encoder/decoder for wire values, shared by the dispatchers and remote
/// handles created from it.
///
/// Every codec consults the process-wide [`TransferTable`], so ports tagged
/// with [`transfer`] ride along whichever codec sends the value.
#[derive(Clone)]
pub struct Codec {
    handlers: HandlerRegistry,
    transfers: Arc<TransferTable>,
    config: Arc<ProtocolConfig>,
}

impl Codec {
    /// A codec with the built-in handlers and the given protocol switches.
    pub fn new(config: ProtocolConfig) -> Self {
        Self::with_handlers(HandlerRegistry::new(), config)
    }

    /// A codec over an existing handler registry. The registry is shared,
    /// not copied: later registrations are visible to this codec.
    pub fn with_handlers(handlers: HandlerRegistry, config: ProtocolConfig) -> Self {
        Self {
            handlers,
            transfers: Arc::clone(TransferTable::global()),
            config: Arc::new(config),
        }
    }

    /// The process-wide codec used by [`expose`], [`wrap`], [`proxy`] and
    /// [`transfer`].
    pub fn global() -> &'static Codec {
        static GLOBAL: OnceLock<Codec> = OnceLock::new();
        GLOBAL.get_or_init(|| Codec::new(ProtocolConfig::default()))
    }

    /// Handlers consulted before the proxy marker.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// The transfer side-table (the process-wide one).
    pub fn transfers(&self) -> &TransferTable {
        &self.transfers
    }

    /// Protocol switches applied by dispatchers built from this codec.
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Encode `value` for sending.
    ///
    /// Handlers are consulted first, then the proxy marker; anything else
    /// must have a JSON form.
    pub fn encode(&self, value: &Value) -> RpcResult<Encoded> {
        let tagged = self.transfers.resources_of([value]);

        let wire = if let Some((name, handler)) = self.handlers.find(value) {
            let (payload, mut ports) =
                handler
                    .serialize(value)
                    .map_err(|fault| RpcError::Handler {
                        name: name.clone(),
                        reason: fault.to_string(),
                    })?;
            merge_ports(&mut ports, &tagged);
            WireValue::Handler {
                name,
                payload,
                ports,
            }
        } else if value.is_proxied() {
            let (local, remote) = MessageChannel::new();
            self.expose(value.clone(), Arc::new(local));
            debug!(kind = value.type_name(), port = %remote.id(), "Encoded value as proxy");
            WireValue::Proxy(remote)
        } else {
            WireValue::Raw(value.to_json()?)
        };

        let mut transfer = wire.ports();
        if !value.is_proxied() {
            merge_ports(&mut transfer, &tagged);
        }
        Ok(Encoded { wire, transfer })
    }

    /// Encode a list of values, collecting every transfer in order.
    pub fn encode_all(&self, values: &[Value]) -> RpcResult<(Vec<WireValue>, Vec<Port>)> {
        let mut wires = Vec::with_capacity(values.len());
        let mut transfer = Vec::new();
        for value in values {
            let encoded = self.encode(value)?;
            wires.push(encoded.wire);
            merge_ports(&mut transfer, &encoded.transfer);
        }
        Ok((wires, transfer))
    }

    /// Decode a received wire value. A THROW becomes `Err(RpcError::Remote)`.
    pub fn decode(&self, wire: WireValue) -> RpcResult<Value> {
        match wire {
            WireValue::Raw(data) => Ok(Value::Data(data)),
            WireValue::Proxy(port) => Ok(Value::Remote(self.wrap(Arc::new(port)))),
            WireValue::Handler {
                name,
                payload,
                ports,
            } => {
                let handler = self
                    .handlers
                    .get(&name)
                    .ok_or_else(|| RpcError::UnknownHandler(name.clone()))?;
                handler
                    .deserialize(payload, ports)
                    .map_err(|fault| RpcError::Handler {
                        name,
                        reason: fault.to_string(),
                    })
            }
            throw @ WireValue::Throw { .. } => match throw.into_fault() {
                Some(fault) => Err(RpcError::Remote(fault)),
                None => Err(RpcError::Protocol("malformed THROW value".to_string())),
            },
        }
    }

    pub fn decode_all(&self, wires: Vec<WireValue>) -> RpcResult<Vec<Value>> {
        wires.into_iter().map(|wire| self.decode(wire)).collect()
    }

    /// Serve `root` on `endpoint` using this codec.
    pub fn expose(&self, root: impl Into<Value>, endpoint: Arc<dyn Endpoint>) -> ListenerId {
        Dispatcher::new(root.into(), self.clone()).listen(endpoint)
    }

    /// Build an empty-path remote handle over `endpoint` using this codec.
    ///
    /// Wrapping an endpoint that already has live handles joins their
    /// connection, and that connection keeps the codec it was opened with.
    pub fn wrap(&self, endpoint: Arc<dyn Endpoint>) -> Remote {
        Remote::new(endpoint, self.clone())
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(ProtocolConfig::default())
    }
}

/// Append ports not already present.
fn merge_ports(into: &mut Vec<Port>, from: &[Port]) {
    for port in from {
        if !into.iter().any(|p| p.same_port(port)) {
            into.push(port.clone());
        }
    }
}

/// Serve `root` on `endpoint` with the global codec.
pub fn expose(root: impl Into<Value>, endpoint: Arc<dyn Endpoint>) -> ListenerId {
    Codec::global().expose(root, endpoint)
}

/// Build a remote handle over `endpoint` with the global codec.
pub fn wrap(endpoint: Arc<dyn Endpoint>) -> Remote {
    Codec::global().wrap(endpoint)
}

/// Mark `value` to be sent as a remote reference instead of data.
///
/// Objects, functions and classes carry the marker on their identity, so
/// every clone is affected. A plain JSON object is first lifted into an
/// [`Object`] record. Other plain data cannot carry the marker and is
/// returned unchanged.
pub fn proxy(value: impl Into<Value>) -> Value {
    let value = match value.into() {
        Value::Data(serde_json::Value::Object(map)) => Value::Object(Object::from_json(map)),
        other => other,
    };
    if !value.mark_proxied() {
        debug!(kind = value.type_name(), "Value cannot carry the proxy marker");
    }
    value
}

/// Register `ports` as transferables of `value` and return the value.
///
/// The tag lives in the process-wide table, so it applies to every codec.
pub fn transfer(value: impl Into<Value>, ports: Vec<Port>) -> Value {
    let value = value.into();
    TransferTable::global().mark(&value, ports);
    value
}
