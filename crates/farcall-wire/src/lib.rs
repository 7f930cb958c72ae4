//! Remote invocation over message channels.
//!
//! One side exposes a root [`Value`] on an [`Endpoint`]; the other side wraps
//! its end of the channel into a [`Remote`] handle and reads, assigns, calls
//! and constructs members of the exposed graph as if they were local. Values
//! marked with [`proxy`] travel as references over fresh channels instead of
//! being copied, and custom types cross the channel through registered
//! [`TransferHandler`]s.

pub mod channel;
pub mod codec;
pub mod correlator;
pub mod dispatcher;
pub mod handler;
pub mod message;
pub mod remote;
pub mod transfer;
pub mod value;

pub use channel::{Endpoint, Listener, ListenerId, MessageChannel, MessageEvent, Port};
pub use codec::{expose, proxy, transfer, wrap, Codec, Encoded};
pub use dispatcher::Dispatcher;
pub use handler::{HandlerRegistry, PortHandler, TransferHandler, PORT_HANDLER};
pub use message::{Message, Operation, Request, Response, WireValue};
pub use remote::Remote;
pub use transfer::TransferTable;
pub use value::{Class, Custom, Function, NativeFunction, Object, Promise, Value};

pub use farcall_types::config::ProtocolConfig;
pub use farcall_types::error::{ErrorObject, Fault, RpcError, RpcResult};
