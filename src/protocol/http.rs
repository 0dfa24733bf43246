//! HTTP proxy request-line decoder: just enough to pull a target host and
//! an optional preamble out of the client's first read, mirroring the
//! byte-level original rather than parsing full HTTP with `hyper`.

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use super::{DecodeError, DialRequest};

const READ_BUF_SIZE: usize = 8192;

pub async fn decode<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<DialRequest, DecodeError> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Err(DecodeError::Eof);
    }
    buf.truncate(n);

    let line_end = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| DecodeError::Malformed(preview(&buf)))?;
    let line = String::from_utf8_lossy(&buf[..line_end]);
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| DecodeError::Malformed(preview(&buf)))?
        .to_uppercase();
    let host_or_url = parts
        .next()
        .ok_or_else(|| DecodeError::Malformed(preview(&buf)))?;

    if method == "CONNECT" {
        let target = add_port_if_missing(host_or_url, "443");
        Ok(DialRequest {
            target,
            // Kept even though a locally-terminated CONNECT never forwards
            // it: a `Bridge`/`Anonymous` route replays this CONNECT line to
            // the upstream proxy instead of answering the client directly.
            preamble: Bytes::copy_from_slice(&buf),
            requires_tls_ok_reply: true,
            socks5_reply_template: None,
        })
    } else {
        let url = if host_or_url.starts_with('/') {
            let host = find_header(&buf, "host")
                .ok_or_else(|| DecodeError::Malformed("absolute-form request missing Host header".into()))?;
            format!("http://{host}{host_or_url}")
        } else {
            host_or_url.to_string()
        };
        let authority = extract_authority(&url)?;
        let target = add_port_if_missing(&authority, "80");
        Ok(DialRequest {
            target,
            preamble: Bytes::copy_from_slice(&buf),
            requires_tls_ok_reply: false,
            socks5_reply_template: None,
        })
    }
}

fn preview(buf: &[u8]) -> String {
    String::from_utf8_lossy(&buf[..buf.len().min(50)]).into_owned()
}

fn find_header(buf: &[u8], key: &str) -> Option<String> {
    let text = String::from_utf8_lossy(buf);
    let key = key.to_uppercase();
    text.split("\r\n").find_map(|line| {
        let (k, v) = line.trim().split_once(':')?;
        (k.trim().to_uppercase() == key).then(|| v.trim().to_string())
    })
}

fn extract_authority(url: &str) -> Result<String, DecodeError> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(DecodeError::Malformed(format!("no authority in {url}")));
    }
    Ok(authority.to_string())
}

/// Mirrors the original's `addPortIfNot`: a bare IPv6 literal (`[::1]`) or
/// any host without a colon gets the listener's default port appended.
fn add_port_if_missing(host: &str, default_port: &str) -> String {
    let needs_port = (!host.starts_with('[') && !host.contains(':'))
        || (host.starts_with('[') && host.ends_with(']'));
    if needs_port {
        format!("{host}:{default_port}")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn connect_request_gets_default_tls_port() {
        let mut input = Cursor::new(b"CONNECT example.com HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec());
        let req = decode(&mut input).await.unwrap();
        assert_eq!(req.target, "example.com:443");
        assert!(req.requires_tls_ok_reply);
        assert!(!req.preamble.is_empty());
    }

    #[tokio::test]
    async fn absolute_uri_request_keeps_explicit_port() {
        let mut input = Cursor::new(b"GET http://example.com:8080/path HTTP/1.1\r\n\r\n".to_vec());
        let req = decode(&mut input).await.unwrap();
        assert_eq!(req.target, "example.com:8080");
        assert!(!req.requires_tls_ok_reply);
        assert!(!req.preamble.is_empty());
    }

    #[tokio::test]
    async fn origin_form_request_uses_host_header() {
        let mut input = Cursor::new(b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec());
        let req = decode(&mut input).await.unwrap();
        assert_eq!(req.target, "example.com:80");
    }

    #[tokio::test]
    async fn missing_newline_is_malformed() {
        let mut input = Cursor::new(b"GET /path HTTP/1.1".to_vec());
        assert!(decode(&mut input).await.is_err());
    }
}
