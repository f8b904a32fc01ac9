//! Completion-based networking runtime.
//!
//! A fixed pool of worker threads drains one shared completion queue. Each
//! completion carries the operation that finished (accept, receive, send or
//! the wake sentinel) and is routed by the [`Dispatcher`]:
//!
//! - `AcceptPipeline`: keeps accepts posted on the listener
//! - `SocketPool`: disconnected sockets kept for reuse
//! - `Connection`: per-client receive reassembly and send queueing
//! - `CompletionPort`: the queue itself, behind a trait

mod accept;
mod buffer;
mod connection;
mod dispatcher;
mod handler;
pub mod port;
mod socket_pool;
mod token;

pub use connection::{Connection, ConnectionId, ConnectionRegistry, SendOutcome};
pub use handler::{handler_fn, ConnectionHandler, FnHandler};
pub use port::{CompletionPort, MioPort, PostAcceptError};
pub use token::{AcceptOp, Completion, CompletionKey, Operation, SocketHandle, SocketId};

pub(crate) use connection::ConnectionLimits;
pub(crate) use dispatcher::Dispatcher;
