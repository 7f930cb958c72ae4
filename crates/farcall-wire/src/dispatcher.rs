//! Serving side of the protocol.
//!
//! A [`Dispatcher`] owns an exposed root value and answers requests arriving
//! on an endpoint. Each request is handled on its own task, so a slow call
//! does not hold up the others and responses may go out in any order.

use crate::channel::{Endpoint, ListenerId, MessageChannel, MessageEvent, Port};
use crate::codec::Codec;
use crate::message::{Message, Operation, Request, Response, WireValue};
use crate::value::Value;
use farcall_types::error::Fault;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// What a handled request sends back.
enum Outcome {
    /// A result value still to be encoded.
    Value(Value),
    /// An already encoded reply.
    Wire(WireValue, Vec<Port>),
    /// No reply at all.
    Silent,
}

/// Serves one exposed root on one endpoint.
///
/// Cloning is cheap; every clone serves the same root with the same codec.
#[derive(Clone)]
pub struct Dispatcher {
    root: Value,
    codec: Codec,
}

impl Dispatcher {
    /// A dispatcher for `root` that encodes replies with `codec`.
    pub fn new(root: Value, codec: Codec) -> Self {
        Self { root, codec }
    }

    /// Serve requests arriving on `endpoint` and start it.
    pub fn listen(self, endpoint: Arc<dyn Endpoint>) -> ListenerId {
        let registered: Arc<OnceLock<ListenerId>> = Arc::new(OnceLock::new());
        let listener_id = {
            let endpoint_ref = Arc::clone(&endpoint);
            let registered = Arc::clone(&registered);
            endpoint.add_listener(Arc::new(move |event: &MessageEvent| {
                let Message::Request(request) = &event.data else {
                    return;
                };
                let dispatcher = self.clone();
                let endpoint = Arc::clone(&endpoint_ref);
                let registered = Arc::clone(&registered);
                let request = request.clone();
                tokio::spawn(async move {
                    dispatcher.handle(request, endpoint, registered).await;
                });
            }))
        };
        let _ = registered.set(listener_id);
        endpoint.start();
        listener_id
    }

    async fn handle(
        &self,
        request: Request,
        endpoint: Arc<dyn Endpoint>,
        registered: Arc<OnceLock<ListenerId>>,
    ) {
        let Request {
            id,
            path,
            operation,
        } = request;
        let op = operation.name().to_string();
        let is_release = matches!(operation, Operation::Release);
        debug!(id = %id, op = %op, path = ?path, "Handling request");

        let outcome = match self.execute(&path, operation).await {
            Ok(outcome) => outcome,
            Err(fault) => {
                debug!(id = %id, op = %op, error = %fault, "Request failed");
                Outcome::Wire(WireValue::throw(&fault), Vec::new())
            }
        };

        let (value, transfer) = match outcome {
            Outcome::Silent => return,
            Outcome::Wire(value, transfer) => (value, transfer),
            Outcome::Value(value) => match self.codec.encode(&value) {
                Ok(encoded) => (encoded.wire, encoded.transfer),
                Err(err) => {
                    warn!(id = %id, op = %op, error = %err, "Failed to encode result");
                    (WireValue::throw(&Fault::from(err)), Vec::new())
                }
            },
        };
        endpoint.post_message(
            Message::Response(Response {
                id: id.clone(),
                value,
            }),
            transfer,
        );

        if is_release {
            if let Some(listener_id) = registered.get() {
                endpoint.remove_listener(*listener_id);
            }
            endpoint.close();
            if self.codec.config().finalize_on_release {
                if let Some(root) = self.root.as_object() {
                    root.finalize();
                }
            }
            debug!(id = %id, "Endpoint released");
        }
    }

    async fn execute(&self, path: &[String], operation: Operation) -> Result<Outcome, Fault> {
        match operation {
            Operation::Get => {
                let target = self.walk(path)?;
                Ok(Outcome::Value(target.settle().await?))
            }
            Operation::Set { value } => {
                let Some((key, parent_path)) = path.split_last() else {
                    return Err(Fault::type_error("Cannot assign to the exposed root"));
                };
                let parent = self.walk(parent_path)?;
                let value = self.decode(value)?;
                parent.assign(key, value).await?;
                Ok(Outcome::Value(true.into()))
            }
            Operation::Apply { arguments } => {
                let parent = match path.split_last() {
                    Some((_, parent_path)) => self.walk(parent_path)?,
                    None => Value::null(),
                };
                let target = self.walk(path)?;
                let args = self.decode_all(arguments)?;
                let result = target.invoke(parent, args).await?;
                Ok(Outcome::Value(result.settle().await?))
            }
            Operation::Construct { arguments } => {
                let target = self.walk(path)?;
                let args = self.decode_all(arguments)?;
                let instance = target.instantiate(args).await?.settle().await?;
                let (local, remote) = MessageChannel::new();
                self.codec.expose(instance, Arc::new(local));
                Ok(Outcome::Wire(WireValue::Proxy(remote.clone()), vec![remote]))
            }
            Operation::Endpoint => {
                let (local, remote) = MessageChannel::new();
                self.codec.expose(self.root.clone(), Arc::new(local));
                Ok(Outcome::Value(Value::Port(remote)))
            }
            Operation::Release => Ok(Outcome::Value(Value::null())),
            Operation::Other(name) => {
                warn!(op = %name, "Unsupported operation");
                if self.codec.config().reject_unknown_operations {
                    Err(Fault::type_error(format!("Unsupported operation '{name}'")))
                } else {
                    Ok(Outcome::Silent)
                }
            }
        }
    }

    fn walk(&self, path: &[String]) -> Result<Value, Fault> {
        let mut current = self.root.clone();
        for key in path {
            current = current.member(key)?;
        }
        Ok(current)
    }

    fn decode(&self, wire: WireValue) -> Result<Value, Fault> {
        self.codec.decode(wire).map_err(Fault::from)
    }

    fn decode_all(&self, wires: Vec<WireValue>) -> Result<Vec<Value>, Fault> {
        self.codec.decode_all(wires).map_err(Fault::from)
    }
}
