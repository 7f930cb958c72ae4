//! Endpoint contract and the in-process message channel.
//!
//! An [`Endpoint`] is one side of a two-way message channel: it can post a
//! message (moving a list of [`Port`]s along with it) and notify registered
//! listeners of incoming messages. Transport adapters for foreign channels
//! implement this trait; [`MessageChannel`] is the built-in in-process
//! transport used for every channel the protocol opens on its own.
//!
//! A [`Port`] queues incoming messages until [`Endpoint::start`] spawns its
//! delivery pump, so a port handed across a channel can be started by the
//! receiver without losing anything sent in the meantime.

use crate::message::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// A message delivered to a listener, together with the ports moved with it.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    /// The protocol message.
    pub data: Message,
    /// Ports transferred alongside the message.
    pub ports: Vec<Port>,
}

/// Callback invoked for every message arriving on an endpoint.
pub type Listener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

/// Handle returned by [`Endpoint::add_listener`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// One side of a bidirectional message channel.
pub trait Endpoint: Send + Sync + 'static {
    /// Send a message to the other side, moving `transfer` with it.
    ///
    /// Delivery is fire-and-forget: a closed channel drops the message.
    fn post_message(&self, message: Message, transfer: Vec<Port>);

    /// Register a listener for incoming messages.
    fn add_listener(&self, listener: Listener) -> ListenerId;

    /// Unregister a listener. Unknown ids are ignored.
    fn remove_listener(&self, id: ListenerId);

    /// Begin delivering queued and future messages. Idempotent.
    fn start(&self) {}

    /// Tear down this side of the channel.
    fn close(&self) {}

    /// Identity of the underlying channel end. Two endpoint objects that
    /// drive the same end must return the same key.
    fn endpoint_key(&self) -> usize {
        self as *const Self as *const () as usize
    }
}

struct PortInner {
    id: Uuid,
    /// Sender into the peer's inbox. `None` once closed.
    peer: Mutex<Option<mpsc::UnboundedSender<MessageEvent>>>,
    /// Our own inbox, taken by the pump on start.
    inbox: Mutex<Option<mpsc::UnboundedReceiver<MessageEvent>>>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl PortInner {
    fn snapshot_listeners(&self) -> Vec<Listener> {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.clear();
    }
}

/// One end of a [`MessageChannel`]. Cloning yields another handle to the
/// same end.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    fn new(
        peer: mpsc::UnboundedSender<MessageEvent>,
        inbox: mpsc::UnboundedReceiver<MessageEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id: Uuid::new_v4(),
                peer: Mutex::new(Some(peer)),
                inbox: Mutex::new(Some(inbox)),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Unique id of this end.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Whether both handles refer to the same end.
    pub fn same_port(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether this end can still send.
    pub fn is_open(&self) -> bool {
        let peer = self.inner.peer.lock().unwrap_or_else(|e| e.into_inner());
        peer.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        let listeners = self.inner.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.len()
    }

    pub(crate) fn downgrade(&self) -> Weak<dyn std::any::Any + Send + Sync> {
        let weak: Weak<PortInner> = Arc::downgrade(&self.inner);
        weak
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }
}

impl Endpoint for Port {
    fn post_message(&self, message: Message, transfer: Vec<Port>) {
        let peer = self.inner.peer.lock().unwrap_or_else(|e| e.into_inner());
        let delivered = match peer.as_ref() {
            Some(tx) => tx
                .send(MessageEvent {
                    data: message,
                    ports: transfer,
                })
                .is_ok(),
            None => false,
        };
        if !delivered {
            debug!(port = %self.inner.id, "Channel closed, message dropped");
        }
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.inner.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        let mut listeners = self.inner.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(existing, _)| *existing != id);
    }

    /// Spawn the delivery pump. Must be called within a Tokio runtime.
    ///
    /// The pump holds the port weakly. When the peer end goes away the pump
    /// exits and clears the listeners, which releases anything they captured.
    fn start(&self) {
        let inbox = {
            let mut inbox = self.inner.inbox.lock().unwrap_or_else(|e| e.into_inner());
            inbox.take()
        };
        let Some(mut inbox) = inbox else {
            return;
        };

        let port_id = self.inner.id;
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let listeners = inner.snapshot_listeners();
                drop(inner);
                trace!(port = %port_id, id = event.data.id(), "Delivering message");
                for listener in listeners {
                    listener(&event);
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.clear_listeners();
            }
            debug!(port = %port_id, "Port pump stopped");
        });
    }

    fn endpoint_key(&self) -> usize {
        self.addr()
    }

    fn close(&self) {
        {
            let mut peer = self.inner.peer.lock().unwrap_or_else(|e| e.into_inner());
            peer.take();
        }
        self.inner.clear_listeners();
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port").field("id", &self.inner.id).finish()
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.same_port(other)
    }
}

/// A pair of entangled ports: whatever one posts, the other receives.
pub struct MessageChannel;

impl MessageChannel {
    /// Create a new channel and return both ends.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Port, Port) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        (Port::new(tx2, rx1), Port::new(tx1, rx2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Response, WireValue};
    use tokio::sync::mpsc::unbounded_channel;

    fn response(id: &str, value: i64) -> Message {
        Message::Response(Response {
            id: id.to_string(),
            value: WireValue::Raw(value.into()),
        })
    }

    fn collect(port: &Port) -> mpsc::UnboundedReceiver<MessageEvent> {
        let (tx, rx) = unbounded_channel();
        port.add_listener(Arc::new(move |event: &MessageEvent| {
            let _ = tx.send(event.clone());
        }));
        rx
    }

    #[tokio::test]
    async fn test_messages_queue_until_started() {
        let (a, b) = MessageChannel::new();
        a.post_message(response("1", 1), vec![]);
        a.post_message(response("2", 2), vec![]);

        let mut rx = collect(&b);
        b.start();
        assert_eq!(rx.recv().await.unwrap().data.id(), "1");
        assert_eq!(rx.recv().await.unwrap().data.id(), "2");
    }

    #[tokio::test]
    async fn test_ports_travel_with_message() {
        let (a, b) = MessageChannel::new();
        let (moved, _other) = MessageChannel::new();
        let mut rx = collect(&b);
        b.start();

        a.post_message(response("p", 0), vec![moved.clone()]);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.ports.len(), 1);
        assert!(event.ports[0].same_port(&moved));
    }

    #[tokio::test]
    async fn test_removed_listener_not_called() {
        let (a, b) = MessageChannel::new();
        let (tx, mut rx) = unbounded_channel();
        let id = b.add_listener(Arc::new(move |event: &MessageEvent| {
            let _ = tx.send(event.data.id().to_string());
        }));
        let mut kept = collect(&b);
        b.remove_listener(id);
        b.start();

        a.post_message(response("x", 0), vec![]);
        assert_eq!(kept.recv().await.unwrap().data.id(), "x");
        assert!(rx.try_recv().is_err());
        assert_eq!(b.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_close_drops_messages_and_clears_peer() {
        let (a, b) = MessageChannel::new();
        let _rx = collect(&b);
        b.start();
        assert!(a.is_open());

        a.close();
        assert!(!a.is_open());
        a.post_message(response("lost", 0), vec![]);

        // Peer pump sees the closed inbox and drops its listeners.
        for _ in 0..50 {
            if b.listener_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(b.listener_count(), 0);
    }

    #[test]
    fn test_distinct_ends() {
        let (a, b) = MessageChannel::new();
        assert_ne!(a.id(), b.id());
        assert!(a.same_port(&a.clone()));
        assert!(!a.same_port(&b));
    }
}
