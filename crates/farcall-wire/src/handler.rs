//! Transfer handler registry.
//!
//! Handlers teach the codec to encode types it has no native representation
//! for. The registry is ordered: when several handlers accept a value, the
//! one registered first wins. Re-registering a name swaps the handler but
//! keeps its earlier position.

use crate::channel::Port;
use crate::value::Value;
use farcall_types::error::Fault;
use std::sync::{Arc, RwLock};

/// Name under which the built-in port handler is registered.
pub const PORT_HANDLER: &str = "port";

/// Custom encoder/decoder for a family of values.
pub trait TransferHandler: Send + Sync + 'static {
    /// Whether this handler encodes `value`.
    fn can_handle(&self, value: &Value) -> bool;

    /// Encode `value` into a JSON payload plus ports to move with it.
    fn serialize(&self, value: &Value) -> Result<(serde_json::Value, Vec<Port>), Fault>;

    /// Rebuild a value from a payload and the ports that arrived with it.
    fn deserialize(&self, payload: serde_json::Value, ports: Vec<Port>) -> Result<Value, Fault>;
}

/// Moves bare [`Port`] values across a channel.
pub struct PortHandler;

impl TransferHandler for PortHandler {
    fn can_handle(&self, value: &Value) -> bool {
        matches!(value, Value::Port(_))
    }

    fn serialize(&self, value: &Value) -> Result<(serde_json::Value, Vec<Port>), Fault> {
        match value {
            Value::Port(port) => Ok((serde_json::Value::Null, vec![port.clone()])),
            other => Err(Fault::type_error(format!(
                "port handler cannot encode {}",
                other.type_name()
            ))),
        }
    }

    fn deserialize(&self, _payload: serde_json::Value, ports: Vec<Port>) -> Result<Value, Fault> {
        ports
            .into_iter()
            .next()
            .map(Value::Port)
            .ok_or_else(|| Fault::type_error("port payload arrived without a port"))
    }
}

type Entry = (String, Arc<dyn TransferHandler>);

/// Shared, ordered handler registry. Clones see the same entries.
#[derive(Clone)]
pub struct HandlerRegistry {
    entries: Arc<RwLock<Vec<Entry>>>,
}

impl HandlerRegistry {
    /// A registry holding only the built-in port handler.
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(PORT_HANDLER, PortHandler);
        registry
    }

    /// A registry with no handlers at all.
    pub fn empty() -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register `handler` under `name`.
    pub fn register(&self, name: impl Into<String>, handler: impl TransferHandler) {
        let name = name.into();
        let handler: Arc<dyn TransferHandler> = Arc::new(handler);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = handler;
        } else {
            entries.push((name, handler));
        }
    }

    /// Look up a handler by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn TransferHandler>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, h)| Arc::clone(h))
    }

    /// The first handler, in registration order, that accepts `value`.
    pub fn find(&self, value: &Value) -> Option<(String, Arc<dyn TransferHandler>)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .find(|(_, h)| h.can_handle(value))
            .map(|(n, h)| (n.clone(), Arc::clone(h)))
    }

    /// Registered names in precedence order.
    pub fn names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use serde_json::json;

    /// Accepts every number and tags its payload with a label.
    struct Labeler(&'static str);

    impl TransferHandler for Labeler {
        fn can_handle(&self, value: &Value) -> bool {
            value.as_f64().is_some()
        }

        fn serialize(&self, value: &Value) -> Result<(serde_json::Value, Vec<Port>), Fault> {
            Ok((json!({"label": self.0, "n": value.as_f64()}), vec![]))
        }

        fn deserialize(&self, payload: serde_json::Value, _ports: Vec<Port>) -> Result<Value, Fault> {
            Ok(payload["n"].clone().into())
        }
    }

    #[test]
    fn test_first_registered_wins() {
        let registry = HandlerRegistry::empty();
        registry.register("first", Labeler("first"));
        registry.register("second", Labeler("second"));

        let (name, handler) = registry.find(&Value::from(3)).unwrap();
        assert_eq!(name, "first");
        let (payload, _) = handler.serialize(&Value::from(3)).unwrap();
        assert_eq!(payload["label"], "first");
    }

    #[test]
    fn test_reregister_keeps_position() {
        let registry = HandlerRegistry::empty();
        registry.register("a", Labeler("a1"));
        registry.register("b", Labeler("b"));
        registry.register("a", Labeler("a2"));

        assert_eq!(registry.names(), vec!["a", "b"]);
        let (name, handler) = registry.find(&Value::from(1)).unwrap();
        assert_eq!(name, "a");
        assert_eq!(handler.serialize(&Value::from(1)).unwrap().0["label"], "a2");
    }

    #[test]
    fn test_no_match() {
        let registry = HandlerRegistry::new();
        assert!(registry.find(&Value::from("text")).is_none());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_builtin_port_handler() {
        let registry = HandlerRegistry::new();
        assert_eq!(registry.names(), vec![PORT_HANDLER]);

        let (port, _peer) = MessageChannel::new();
        let value = Value::Port(port.clone());
        let (name, handler) = registry.find(&value).unwrap();
        assert_eq!(name, PORT_HANDLER);

        let (payload, ports) = handler.serialize(&value).unwrap();
        assert_eq!(ports, vec![port.clone()]);
        let decoded = handler.deserialize(payload, ports).unwrap();
        assert_eq!(decoded, value);
        assert!(handler.deserialize(json!(null), vec![]).is_err());
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = HandlerRegistry::empty();
        let clone = registry.clone();
        clone.register("late", Labeler("late"));
        assert!(registry.get("late").is_some());
    }
}
