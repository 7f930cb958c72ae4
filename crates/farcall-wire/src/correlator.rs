//! Request/response correlation.
//!
//! Every outgoing request gets a fresh id and a one-shot listener that
//! waits for the response carrying that id. Many requests can be in flight
//! on one endpoint at once; responses may arrive in any order.

use crate::channel::{Endpoint, MessageEvent, Port};
use crate::message::{Message, Operation, Request, WireValue};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

/// Send a request and wait for its response.
///
/// A request that is never answered never resolves.
pub async fn request(
    endpoint: &dyn Endpoint,
    path: Vec<String>,
    operation: Operation,
    transfer: Vec<Port>,
) -> WireValue {
    let id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel::<WireValue>();
    let slot = Arc::new(Mutex::new(Some(tx)));

    let expected = id.clone();
    let waiting = Arc::clone(&slot);
    let listener_id = endpoint.add_listener(Arc::new(move |event: &MessageEvent| {
        let Message::Response(response) = &event.data else {
            return;
        };
        if response.id != expected {
            return;
        }
        let sender = {
            let mut waiting = waiting.lock().unwrap_or_else(|e| e.into_inner());
            waiting.take()
        };
        if let Some(sender) = sender {
            let _ = sender.send(response.value.clone());
        }
    }));
    endpoint.start();

    trace!(id = %id, op = operation.name(), path = ?path, "Sending request");
    endpoint.post_message(
        Message::Request(Request {
            id: id.clone(),
            path,
            operation,
        }),
        transfer,
    );

    match rx.await {
        Ok(value) => {
            endpoint.remove_listener(listener_id);
            value
        }
        Err(_) => {
            // The listener was dropped with the channel; no reply can come.
            debug!(id = %id, "Channel closed before response arrived");
            futures::future::pending().await
        }
    }
}
