//! Wire-level decoders (component I-local): HTTP proxy framing and SOCKS5
//! framing, both reduced to the single shape the route policy and server
//! actually need — a [`DialRequest`].

pub mod http;
pub mod socks5;

use bytes::Bytes;
use thiserror::Error;

/// The single fixed reply written to an HTTP client for a `Direct` (or
/// locally-terminated) CONNECT — never sent when the route is
/// `Anonymous`/`Bridge`, where the upstream's own reply is relayed instead.
pub const HTTP_CONNECT_OK: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("connection closed before a request was read")]
    Eof,
    #[error("malformed request line: {0}")]
    Malformed(String),
    #[error("i/o error reading request: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything downstream needs to route and splice a client connection,
/// independent of which listener protocol produced it.
#[derive(Debug, Clone)]
pub struct DialRequest {
    /// `host:port`, always with a port after normalisation.
    pub target: String,
    /// Bytes already consumed from the client that must be replayed to the
    /// outbound stream verbatim — the original HTTP request line and
    /// headers, for both plain HTTP and CONNECT. Always empty for SOCKS5.
    /// A locally-terminated CONNECT (`Direct`/`Tunnel`) never forwards
    /// this; a `Bridge`/`Anonymous` route replays it to the upstream proxy.
    pub preamble: Bytes,
    /// True for HTTP CONNECT: when the route terminates locally (`Direct`
    /// or `Tunnel`), the server must write [`HTTP_CONNECT_OK`] to the
    /// client before splicing instead of forwarding `preamble`.
    pub requires_tls_ok_reply: bool,
    /// SOCKS5 only: the client's original request bytes, to be echoed back
    /// with the reply byte overwritten to success once the dial succeeds.
    pub socks5_reply_template: Option<Bytes>,
}
