//! Restricted SOCKS5 client profile (RFC 1928 subset)

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

use crate::SOCKS_VERSION;

/// "No authentication required" method
pub const METHOD_NO_AUTH: u8 = 0x00;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;

/// Reply code for a successful CONNECT
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Client greeting: version 5, one method offered, no authentication
pub const GREETING: [u8; 3] = [SOCKS_VERSION, 0x01, METHOD_NO_AUTH];

/// Length of the server's method selection message
pub const METHOD_SELECTION_LEN: usize = 2;

/// Upper bound of a single read of the CONNECT reply
pub const CONNECT_REPLY_BUFFER_SIZE: usize = 1024;

/// Size of a CONNECT request for an IPv4 target
pub const CONNECT_REQUEST_LEN: usize = 10;

/// Size of a CONNECT reply carrying an IPv4 bound address:
/// 4-byte header + 4-byte address + 2-byte port.
///
/// Anything past this offset in the first read is treated as target data that
/// arrived together with the reply. The offset is only right for IPv4-shaped
/// replies, which is the only shape this profile expects.
pub const IPV4_REPLY_LEN: usize = 10;

/// Wire-level protocol errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Upstream refused no-auth greeting: version {version:#04x}, method {method:#04x}")]
    MethodRejected { version: u8, method: u8 },

    #[error("Upstream CONNECT failed: version {version:#04x}, reply {reply:#04x} ({})", describe_reply(.reply))]
    ConnectRejected { version: u8, reply: u8 },

    #[error("CONNECT reply too short: {0} bytes")]
    ShortReply(usize),
}

/// Validate the server's method selection (`05 00` is the only accepted answer)
pub fn check_method_selection(reply: [u8; METHOD_SELECTION_LEN]) -> Result<(), ProtoError> {
    match reply {
        [SOCKS_VERSION, METHOD_NO_AUTH] => Ok(()),
        [version, method] => Err(ProtoError::MethodRejected { version, method }),
    }
}

/// CONNECT request for an IPv4 target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub target: SocketAddrV4,
}

impl ConnectRequest {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            target: SocketAddrV4::new(ip, port),
        }
    }

    /// Encode as `05 01 00 01 <ipv4> <port be>`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONNECT_REQUEST_LEN);

        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(CMD_CONNECT);
        buf.put_u8(0x00);
        buf.put_u8(ATYP_IPV4);
        buf.put_slice(&self.target.ip().octets());
        buf.put_u16(self.target.port());

        buf.freeze()
    }
}

/// Successful CONNECT reply as read from the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectReply<'a> {
    /// Target data that arrived in the same read as the reply
    pub early_data: &'a [u8],
}

/// Validate the first read of a CONNECT reply.
///
/// Only the version and reply code are checked. The bound address is not
/// parsed; bytes past [`IPV4_REPLY_LEN`] are handed back as early data.
pub fn parse_connect_reply(buf: &[u8]) -> Result<ConnectReply<'_>, ProtoError> {
    if buf.len() < 2 {
        return Err(ProtoError::ShortReply(buf.len()));
    }

    if buf[0] != SOCKS_VERSION || buf[1] != REPLY_SUCCEEDED {
        return Err(ProtoError::ConnectRejected {
            version: buf[0],
            reply: buf[1],
        });
    }

    let early_data = if buf.len() > IPV4_REPLY_LEN {
        &buf[IPV4_REPLY_LEN..]
    } else {
        &[]
    };

    Ok(ConnectReply { early_data })
}

fn describe_reply(code: &u8) -> &'static str {
    reply_code_description(*code)
}

/// Human readable text for a SOCKS5 reply code
pub fn reply_code_description(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unassigned",
    }
}
