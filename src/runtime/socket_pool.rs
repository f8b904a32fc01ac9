//! Pool of disconnected sockets kept for reuse by later accepts.

use crate::runtime::port::CompletionPort;
use crate::runtime::token::SocketHandle;
use parking_lot::Mutex;
use tracing::debug;

/// LIFO stack of reusable sockets.
#[derive(Debug, Default)]
pub struct SocketPool {
    free: Mutex<Vec<SocketHandle>>,
}

impl SocketPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, socket: SocketHandle) {
        self.free.lock().push(socket);
    }

    /// Take the most recently returned socket, if any.
    pub fn pop(&self) -> Option<SocketHandle> {
        self.free.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }

    /// Remove every pooled socket.
    pub fn drain(&self) -> Vec<SocketHandle> {
        std::mem::take(&mut *self.free.lock())
    }

    /// Disconnect `socket` and keep it for reuse. A socket that cannot be
    /// disconnected is closed instead.
    pub fn recycle(&self, port: &dyn CompletionPort, socket: SocketHandle) {
        match port.disconnect(&socket) {
            Ok(()) => self.push(socket),
            Err(e) => {
                debug!(socket = %socket.id(), error = %e, "Closing socket that failed to disconnect");
                port.close(socket);
            }
        }
    }
}
