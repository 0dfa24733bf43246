//! SOCKS5 framing: hard-coded support for the no-auth method and the
//! CONNECT command only, mirroring the original's fixed byte-pattern
//! checks rather than a general SOCKS5 state machine.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{DecodeError, DialRequest};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Reads the client's method-selection request and replies `METHOD=0`
/// (no auth). Any handshake not exactly `VER=5, NMETHODS=1, METHOD=0` is
/// rejected — there is no fallback negotiation.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(), DecodeError> {
    let mut buf = [0u8; 3];
    stream.read_exact(&mut buf).await?;
    if buf != [0x05, 0x01, 0x00] {
        return Err(DecodeError::Malformed("socks5 handshake request not VER=5/NMETHODS=1/METHOD=0".into()));
    }
    stream.write_all(&[0x05, 0x00]).await?;
    Ok(())
}

/// Decodes the CONNECT request into a [`DialRequest`]. The reply sent
/// back to the client is not written here: the caller writes
/// `socks5_reply_template` (with byte 1 zeroed) only once the outbound
/// dial has actually succeeded.
pub async fn decode_request<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<DialRequest, DecodeError> {
    let mut buf = vec![0u8; 1024];
    let n = reader.read(&mut buf).await?;
    if n < 10 || buf[0] != 0x05 || buf[1] != 0x01 {
        return Err(DecodeError::Malformed("socks5 request malformed or unsupported command".into()));
    }
    buf.truncate(n);

    let atyp = buf[3];
    let port = u16::from_be_bytes([buf[n - 2], buf[n - 1]]);

    let target = match atyp {
        ATYP_IPV4 => {
            let octets: [u8; 4] = buf[4..8].try_into().unwrap();
            format!("{}:{port}", std::net::Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = buf[4] as usize;
            let host = String::from_utf8_lossy(&buf[5..5 + len]).into_owned();
            format!("{host}:{port}")
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = buf[4..20].try_into().unwrap();
            format!("[{}]:{port}", std::net::Ipv6Addr::from(octets))
        }
        other => return Err(DecodeError::Malformed(format!("unsupported socks5 address type {other:#x}"))),
    };

    Ok(DialRequest {
        target,
        preamble: Bytes::new(),
        requires_tls_ok_reply: false,
        socks5_reply_template: Some(Bytes::copy_from_slice(&buf)),
    })
}

/// Builds the success reply for a completed dial: the client's own
/// request, byte 1 overwritten from `CMD` to `REP=0x00`.
pub fn success_reply(template: &Bytes) -> Bytes {
    let mut reply = template.to_vec();
    if reply.len() > 1 {
        reply[1] = 0x00;
    }
    Bytes::from(reply)
}

pub async fn decode<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<DialRequest, DecodeError> {
    handshake(stream).await?;
    decode_request(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_accepts_no_auth_and_replies() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        handshake(&mut server).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn handshake_rejects_auth_methods() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        assert!(handshake(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn decodes_ipv4_connect_request() {
        let mut req = vec![0x05, 0x01, 0x00, ATYP_IPV4];
        req.extend_from_slice(&[93, 184, 216, 34]);
        req.extend_from_slice(&443u16.to_be_bytes());
        let mut cursor = std::io::Cursor::new(req);
        let parsed = decode_request(&mut cursor).await.unwrap();
        assert_eq!(parsed.target, "93.184.216.34:443");
        assert!(parsed.socks5_reply_template.is_some());
    }

    #[tokio::test]
    async fn decodes_domain_connect_request() {
        let domain = b"example.com";
        let mut req = vec![0x05, 0x01, 0x00, ATYP_DOMAIN, domain.len() as u8];
        req.extend_from_slice(domain);
        req.extend_from_slice(&80u16.to_be_bytes());
        let mut cursor = std::io::Cursor::new(req);
        let parsed = decode_request(&mut cursor).await.unwrap();
        assert_eq!(parsed.target, "example.com:80");
    }

    #[test]
    fn success_reply_zeroes_the_reply_byte_only() {
        let template = Bytes::from_static(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80]);
        let reply = success_reply(&template);
        assert_eq!(reply[1], 0x00);
        assert_eq!(reply[3], 0x01);
    }
}
