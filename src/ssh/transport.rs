//! The transport abstraction every outbound SSH-backed dialer implements.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// A dynamically-dispatched duplex stream, used as the return type for any
/// tunnel-backed dial so callers don't need to know the concrete channel
/// type behind it.
///
/// `dyn DuplexStream` doesn't itself implement `AsyncRead`/`AsyncWrite` —
/// trait objects don't inherit impls of their supertraits — so this
/// newtype carries its own forwarding impls instead of relying on one.
pub struct BoxedDuplex(Pin<Box<dyn DuplexStream>>);

impl BoxedDuplex {
    pub fn new<T: DuplexStream + 'static>(inner: T) -> Self {
        Self(Box::pin(inner))
    }
}

impl AsyncRead for BoxedDuplex {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for BoxedDuplex {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.0.as_mut().poll_shutdown(cx)
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("ssh connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("tunnel client not valid (closed, or never connected)")]
    NotValid,
    #[error("dial {network}/{addr} over ssh tunnel failed: {source}")]
    DialFailed {
        network: String,
        addr: String,
        #[source]
        source: anyhow::Error,
    },
}

/// One TCP dialer reachable through a tunnel. Implemented by
/// [`super::TunnelClient`] (a single SSH session) and by
/// [`super::TunnelPool`] (uniform-random selection over several sessions,
/// pool-of-one being the SOCKS5 node's case).
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedDuplex, TunnelError>;
    async fn shutdown(&self);
}

/// Lets a pool (or anything else) hold `Arc<TunnelClient>` members directly
/// and still satisfy `TunnelTransport` without an extra wrapper type.
#[async_trait]
impl<T: TunnelTransport + ?Sized> TunnelTransport for Arc<T> {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedDuplex, TunnelError> {
        (**self).dial(network, addr).await
    }

    async fn shutdown(&self) {
        (**self).shutdown().await
    }
}
