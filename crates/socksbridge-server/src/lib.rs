//! Listen, dial through SOCKS5, relay
//!
//! A [`ProxyEndpoint`] serves one mapping: it accepts local connections and
//! runs a [`Session`] for each. A session dials the upstream SOCKS5 proxy,
//! lets the [`HandshakeEngine`] negotiate a CONNECT to the mapping's target,
//! then relays bytes in both directions until either side finishes.

mod endpoint;
mod handshake;
mod session;

pub use endpoint::{EndpointError, ProxyEndpoint, SessionIdGenerator};
pub use handshake::{HandshakeEngine, HandshakeError};
pub use session::{Session, Stage};
