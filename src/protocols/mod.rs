//! Demo protocols served by the binary.
//!
//! Both rely on the consumed-bytes contract of [`ConnectionHandler`]: they
//! answer every complete request in the data and leave a trailing partial
//! one to be redelivered with the next receive.
//!
//! - `echo`: length-prefixed payloads echoed back
//! - `ping`: `PING` / `PONG` health check
//!
//! [`ConnectionHandler`]: crate::runtime::ConnectionHandler

pub mod echo;
pub mod ping;

pub use echo::EchoHandler;
pub use ping::PingHandler;
