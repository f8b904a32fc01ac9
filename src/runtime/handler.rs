//! Application callbacks.

use crate::runtime::connection::Connection;
use std::sync::Arc;

/// Receives the byte stream of every connection and its end.
///
/// Callbacks run on worker threads. Calls for one connection never overlap
/// on the receive side, but different connections are served in parallel.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// New bytes arrived on `conn`.
    ///
    /// `data` starts with whatever was left unconsumed by the previous call.
    /// Return how many leading bytes were consumed; the rest is handed back
    /// with the next receive. Returning 0 means no complete message yet.
    ///
    /// Runs with the connection's receive path locked. `send`, `id`, the
    /// address getters and `is_closing` are safe to call on `conn` from here.
    fn on_receive(&self, conn: &Arc<Connection>, data: &[u8]) -> usize;

    /// `conn` is going away.
    ///
    /// Called exactly once per accepted connection, before it leaves the
    /// registry. Sends from here on fail.
    fn on_disconnect(&self, conn: &Arc<Connection>);
}

/// A [`ConnectionHandler`] made of two closures.
pub struct FnHandler<R, D> {
    on_receive: R,
    on_disconnect: D,
}

/// Build a handler from an `on_receive` and an `on_disconnect` closure.
pub fn handler_fn<R, D>(on_receive: R, on_disconnect: D) -> FnHandler<R, D>
where
    R: Fn(&Arc<Connection>, &[u8]) -> usize + Send + Sync + 'static,
    D: Fn(&Arc<Connection>) + Send + Sync + 'static,
{
    FnHandler {
        on_receive,
        on_disconnect,
    }
}

impl<R, D> ConnectionHandler for FnHandler<R, D>
where
    R: Fn(&Arc<Connection>, &[u8]) -> usize + Send + Sync + 'static,
    D: Fn(&Arc<Connection>) + Send + Sync + 'static,
{
    fn on_receive(&self, conn: &Arc<Connection>, data: &[u8]) -> usize {
        (self.on_receive)(conn, data)
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        (self.on_disconnect)(conn)
    }
}
