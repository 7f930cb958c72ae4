//! Client-side remote handles.
//!
//! A [`Remote`] names a member path on an object exposed at the other end of
//! an endpoint. Handles are cheap: [`Remote::get`] only extends the path and
//! sends nothing. Work happens when the handle is resolved, assigned,
//! called or constructed.
//!
//! ```ignore
//! let api = wrap(Arc::new(port));
//! let answer = api.get("math").get("add").call(vec![2.into(), 3.into()]).await?;
//! let name = api.get("name").await?;
//! ```

use crate::channel::{Endpoint, Port};
use crate::codec::Codec;
use crate::correlator::request;
use crate::message::{Message, Operation, Request, WireValue};
use crate::value::Value;
use farcall_types::error::{RpcError, RpcResult};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;
use uuid::Uuid;

/// Live connections by endpoint identity. Wrapping an endpoint that already
/// has a live connection joins it instead of opening a second one.
fn connections() -> &'static DashMap<usize, Weak<Connection>> {
    static CONNECTIONS: OnceLock<DashMap<usize, Weak<Connection>>> = OnceLock::new();
    CONNECTIONS.get_or_init(DashMap::new)
}

/// State shared by every handle on one endpoint.
struct Connection {
    key: usize,
    endpoint: Arc<dyn Endpoint>,
    codec: Codec,
    released: AtomicBool,
}

impl Drop for Connection {
    /// The last handle on the endpoint is gone: tell the exposing side to
    /// stop serving.
    fn drop(&mut self) {
        connections().remove_if(&self.key, |_, weak| weak.strong_count() == 0);
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.endpoint.post_message(
            Message::Request(Request {
                id: Uuid::new_v4().to_string(),
                path: Vec::new(),
                operation: Operation::Release,
            }),
            Vec::new(),
        );
        self.endpoint.close();
        debug!("Last remote handle dropped, endpoint released");
    }
}

/// A handle to a member of a remotely exposed object.
#[derive(Clone)]
pub struct Remote {
    connection: Arc<Connection>,
    path: Vec<String>,
}

impl Remote {
    /// A root handle on `endpoint`. If another live handle already wraps the
    /// same endpoint the two share its connection, including its codec.
    pub(crate) fn new(endpoint: Arc<dyn Endpoint>, codec: Codec) -> Self {
        let key = endpoint.endpoint_key();
        let mut slot = connections().entry(key).or_default();
        let connection = match slot.upgrade() {
            Some(existing) => {
                debug!("Endpoint already wrapped, sharing its connection");
                existing
            }
            None => {
                endpoint.start();
                let connection = Arc::new(Connection {
                    key,
                    endpoint,
                    codec,
                    released: AtomicBool::new(false),
                });
                *slot = Arc::downgrade(&connection);
                connection
            }
        };
        drop(slot);
        Self {
            connection,
            path: Vec::new(),
        }
    }

    /// Member names from the exposed root to this handle.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The endpoint requests are sent on.
    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.connection.endpoint
    }

    /// A handle to member `name` of this one. Sends nothing.
    pub fn get(&self, name: impl Into<String>) -> Remote {
        let mut path = self.path.clone();
        path.push(name.into());
        Remote {
            connection: Arc::clone(&self.connection),
            path,
        }
    }

    /// Whether the connection has been released.
    pub fn is_released(&self) -> bool {
        self.connection.released.load(Ordering::Acquire)
    }

    /// Fetch the value at this path.
    ///
    /// The root handle resolves to itself, so awaiting a freshly wrapped
    /// endpoint yields a usable handle.
    pub async fn value(&self) -> RpcResult<Value> {
        self.ensure_usable()?;
        if self.path.is_empty() {
            return Ok(Value::Remote(self.clone()));
        }
        let reply = self.send(self.path.clone(), Operation::Get, Vec::new()).await;
        self.connection.codec.decode(reply)
    }

    /// Assign `value` to member `name` and wait for the assignment to land.
    pub async fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> RpcResult<()> {
        self.ensure_usable()?;
        let encoded = self.connection.codec.encode(&value.into())?;
        let mut path = self.path.clone();
        path.push(name.into());
        let reply = self
            .send(
                path,
                Operation::Set {
                    value: encoded.wire,
                },
                encoded.transfer,
            )
            .await;
        self.connection.codec.decode(reply)?;
        Ok(())
    }

    /// Call the function at this path, with its parent as receiver.
    ///
    /// Calling a `bind` member returns the function handle itself without
    /// contacting the other side.
    pub async fn call(&self, args: Vec<Value>) -> RpcResult<Value> {
        self.ensure_usable()?;
        if self.path.last().is_some_and(|last| last == "bind") {
            let mut bound = self.clone();
            bound.path.pop();
            return Ok(Value::Remote(bound));
        }
        let (arguments, transfer) = self.connection.codec.encode_all(&args)?;
        let reply = self
            .send(self.path.clone(), Operation::Apply { arguments }, transfer)
            .await;
        self.connection.codec.decode(reply)
    }

    /// Construct an instance of the class at this path.
    pub async fn construct(&self, args: Vec<Value>) -> RpcResult<Remote> {
        self.ensure_usable()?;
        let (arguments, transfer) = self.connection.codec.encode_all(&args)?;
        let reply = self
            .send(self.path.clone(), Operation::Construct { arguments }, transfer)
            .await;
        match self.connection.codec.decode(reply)? {
            Value::Remote(instance) => Ok(instance),
            other => Err(RpcError::Protocol(format!(
                "CONSTRUCT answered with {} instead of a proxy",
                other.type_name()
            ))),
        }
    }

    /// Ask the other side for a new channel exposing the same root.
    pub async fn create_endpoint(&self) -> RpcResult<Port> {
        self.ensure_usable()?;
        let reply = self.send(Vec::new(), Operation::Endpoint, Vec::new()).await;
        match self.connection.codec.decode(reply)? {
            Value::Port(port) => Ok(port),
            other => Err(RpcError::Protocol(format!(
                "ENDPOINT answered with {} instead of a port",
                other.type_name()
            ))),
        }
    }

    /// Stop the other side serving this connection and close it. Every
    /// handle sharing the connection becomes unusable.
    pub async fn release(&self) -> RpcResult<()> {
        if self.connection.released.swap(true, Ordering::AcqRel) {
            return Err(RpcError::Released);
        }
        let reply = self.send(Vec::new(), Operation::Release, Vec::new()).await;
        self.connection.endpoint.close();
        self.connection.codec.decode(reply)?;
        Ok(())
    }

    fn ensure_usable(&self) -> RpcResult<()> {
        if self.is_released() {
            Err(RpcError::Released)
        } else {
            Ok(())
        }
    }

    async fn send(&self, path: Vec<String>, operation: Operation, transfer: Vec<Port>) -> WireValue {
        request(self.connection.endpoint.as_ref(), path, operation, transfer).await
    }
}

impl IntoFuture for Remote {
    type Output = RpcResult<Value>;
    type IntoFuture = BoxFuture<'static, RpcResult<Value>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.value().await })
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote").field("path", &self.path).finish()
    }
}

impl PartialEq for Remote {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.connection, &other.connection) && self.path == other.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;
    use crate::value::{Function, Object};
    use std::time::Duration;

    fn connect(root: Object) -> Remote {
        let codec = Codec::default();
        let (client, server) = MessageChannel::new();
        codec.expose(root, Arc::new(server));
        codec.wrap(Arc::new(client))
    }

    #[tokio::test]
    async fn test_get_builds_paths_without_sending() {
        let remote = connect(Object::new());
        let deep = remote.get("a").get("b");
        assert_eq!(deep.path(), ["a", "b"]);
        assert!(remote.path().is_empty());
        assert_ne!(deep, remote);
        assert_eq!(deep, remote.get("a").get("b"));
    }

    #[tokio::test]
    async fn test_root_resolves_to_itself() {
        let remote = connect(Object::new());
        let resolved = remote.clone().await.unwrap();
        assert_eq!(resolved.as_remote(), Some(&remote));
    }

    #[tokio::test]
    async fn test_bind_returns_function_handle() {
        let remote = connect(Object::new());
        let bound = remote.get("f").get("bind").call(vec![]).await.unwrap();
        assert_eq!(bound.as_remote(), Some(&remote.get("f")));
    }

    #[tokio::test]
    async fn test_argument_clone_error_sends_nothing() {
        let remote = connect(Object::new());
        let f = Function::sync("local", |_, _| Ok(Value::null()));
        let err = remote.get("g").call(vec![f.into()]).await.unwrap_err();
        assert!(matches!(err, RpcError::DataClone(_)));
    }

    #[tokio::test]
    async fn test_wrapping_same_port_twice_shares_connection() {
        let codec = Codec::default();
        let (client, server) = MessageChannel::new();
        codec.expose(Object::new().with("x", 1), Arc::new(server));

        let long_lived = codec.wrap(Arc::new(client.clone()));
        let temporary = codec.wrap(Arc::new(client.clone()));
        assert_eq!(temporary, long_lived);
        drop(temporary);

        let x = tokio::time::timeout(Duration::from_millis(200), long_lived.get("x").value())
            .await
            .expect("connection was released by the temporary handle")
            .unwrap();
        assert_eq!(x.as_i64(), Some(1));
        assert!(!long_lived.is_released());
    }

    #[tokio::test]
    async fn test_distinct_ports_get_distinct_connections() {
        let first = connect(Object::new());
        let second = connect(Object::new());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_release_disables_all_handles() {
        let remote = connect(Object::new().with("x", 1));
        let child = remote.get("x");
        assert_eq!(child.clone().await.unwrap().as_i64(), Some(1));

        remote.release().await.unwrap();
        assert!(child.is_released());
        assert_eq!(child.await.unwrap_err(), RpcError::Released);
        assert_eq!(remote.release().await.unwrap_err(), RpcError::Released);
    }
}
