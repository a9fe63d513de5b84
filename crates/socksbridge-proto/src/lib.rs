//! SOCKS5 client wire format
//!
//! Byte-exact encoders and reply validators for the one SOCKS5 profile the
//! bridge speaks: no authentication, CONNECT, IPv4 target. Domain names, IPv6,
//! authentication methods and UDP associate are out of scope.

pub mod socks5;

pub use socks5::{
    check_method_selection, parse_connect_reply, reply_code_description, ConnectReply,
    ConnectRequest, ProtoError, CONNECT_REPLY_BUFFER_SIZE, CONNECT_REQUEST_LEN, GREETING,
    IPV4_REPLY_LEN, METHOD_SELECTION_LEN,
};

/// SOCKS protocol version byte
pub const SOCKS_VERSION: u8 = 0x05;
