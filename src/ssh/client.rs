//! One persistent, multiplexed SSH session used purely as a TCP dialer
//! (component E): connect once, keep it alive with a 60-second
//! `keepalive@ssh-tunnel` global request, and reconnect transparently on
//! ping failure or a dial that surfaces end-of-stream.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_io_timeout::TimeoutStream;
use tracing::{info, warn};

use super::transport::{BoxedDuplex, TunnelError, TunnelTransport};

/// Handshake timeout, and the idle/I-O deadline applied to every dialed
/// channel (renewed on every read/write — see §5).
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(180);
const IO_DEADLINE: Duration = Duration::from_secs(180);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

const STATE_CONNECTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_RECONNECTING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// SSH client handler. Host-key verification is intentionally skipped:
/// the trust model is operator placement of both endpoints, not
/// cryptographic identity (§4.E).
struct InsecureHostKeys;

impl client::Handler for InsecureHostKeys {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct TunnelClient {
    addr: String,
    user: String,
    key_path: PathBuf,
    session: RwLock<Option<Handle<InsecureHostKeys>>>,
    state: AtomicU8,
    dial_failed_tx: mpsc::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelClient {
    pub async fn connect(
        addr: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Result<Arc<Self>, TunnelError> {
        let addr = addr.into();
        let user = user.into();
        let key_path = key_path.into();

        let session = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            dial_session(&addr, &user, &key_path),
        )
        .await
        .map_err(|_| TunnelError::ConnectFailed {
            addr: addr.clone(),
            source: anyhow::anyhow!("handshake timed out after {HANDSHAKE_TIMEOUT:?}"),
        })?
        .map_err(|source| TunnelError::ConnectFailed {
            addr: addr.clone(),
            source,
        })?;

        let (dial_failed_tx, dial_failed_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = Arc::new(Self {
            addr,
            user,
            key_path,
            session: RwLock::new(Some(session)),
            state: AtomicU8::new(STATE_READY),
            dial_failed_tx,
            shutdown_tx,
        });

        spawn_keepalive(Arc::clone(&client), dial_failed_rx, shutdown_rx);

        Ok(client)
    }

    pub fn state(&self) -> ClientState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => ClientState::Connecting,
            STATE_READY => ClientState::Ready,
            STATE_RECONNECTING => ClientState::Reconnecting,
            _ => ClientState::Closed,
        }
    }

    async fn reconnect(&self) {
        self.state.store(STATE_RECONNECTING, Ordering::Release);
        {
            let mut guard = self.session.write().await;
            if let Some(session) = guard.take() {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "", "English")
                    .await;
            }
        }

        match dial_session(&self.addr, &self.user, &self.key_path).await {
            Ok(new_session) => {
                let mut guard = self.session.write().await;
                *guard = Some(new_session);
                self.state.store(STATE_READY, Ordering::Release);
                info!(addr = %self.addr, "ssh tunnel reconnected");
            }
            Err(e) => {
                // Stay in Reconnecting; the next keepalive tick retries.
                self.state.store(STATE_RECONNECTING, Ordering::Release);
                warn!(addr = %self.addr, error = %e, "ssh tunnel reconnect failed, will retry");
            }
        }
    }

    async fn ping(&self) -> bool {
        let guard = self.session.read().await;
        match guard.as_ref() {
            Some(session) => session.send_keepalive(true).await.is_ok(),
            None => false,
        }
    }
}

async fn dial_session(
    addr: &str,
    user: &str,
    key_path: &Path,
) -> anyhow::Result<Handle<InsecureHostKeys>> {
    let key_pair = russh::keys::load_secret_key(key_path, None)?;
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, addr, InsecureHostKeys).await?;
    let auth_result = session
        .authenticate_publickey(user, Arc::new(key_pair))
        .await?;
    if !auth_result.success() {
        anyhow::bail!("ssh public-key authentication rejected for {user}@{addr}");
    }
    Ok(session)
}

fn spawn_keepalive(
    client: Arc<TunnelClient>,
    mut dial_failed_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !client.ping().await {
                        client.reconnect().await;
                    }
                }
                Some(()) = dial_failed_rx.recv() => {
                    client.reconnect().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        client.state.store(STATE_CLOSED, Ordering::Release);
    });
}

fn split_host_port(addr: &str) -> Result<(String, u32), TunnelError> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| TunnelError::DialFailed {
        network: "tcp".to_string(),
        addr: addr.to_string(),
        source: anyhow::anyhow!("address missing port"),
    })?;
    let port: u32 = port.parse().map_err(|_| TunnelError::DialFailed {
        network: "tcp".to_string(),
        addr: addr.to_string(),
        source: anyhow::anyhow!("invalid port"),
    })?;
    Ok((host.to_string(), port))
}

/// Only an end-of-stream means the underlying session is actually dead;
/// everything else (forward refused, policy rejection, bad address) is a
/// per-dial failure that must not trigger a reconnect.
fn is_session_dead(err: &russh::Error) -> bool {
    match err {
        russh::Error::Disconnect => true,
        russh::Error::IO(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

#[async_trait]
impl TunnelTransport for TunnelClient {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedDuplex, TunnelError> {
        if self.state() != ClientState::Ready {
            return Err(TunnelError::NotValid);
        }

        let (host, port) = split_host_port(addr)?;

        let channel = {
            let guard = self.session.read().await;
            let Some(session) = guard.as_ref() else {
                return Err(TunnelError::NotValid);
            };
            session
                .channel_open_direct_tcpip(&host, port, "0.0.0.0", 0)
                .await
        };

        let channel = match channel {
            Ok(c) => c,
            Err(e) => {
                // Only an end-of-stream (session actually dead) should
                // force a reconnect; a routine forward refusal must not
                // tear down a session serving other multiplexed
                // connections (§4.E, mirrors `myssh.Client.Dial`'s
                // `err == io.EOF` check).
                if is_session_dead(&e) {
                    let _ = self.dial_failed_tx.try_send(());
                }
                return Err(TunnelError::DialFailed {
                    network: network.to_string(),
                    addr: addr.to_string(),
                    source: e.into(),
                });
            }
        };

        let mut stream = TimeoutStream::new(channel.into_stream());
        stream.set_read_timeout(Some(IO_DEADLINE));
        stream.set_write_timeout(Some(IO_DEADLINE));
        Ok(BoxedDuplex::new(stream))
    }

    async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut guard = self.session.write().await;
        if let Some(session) = guard.take() {
            let _ = session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_requires_port() {
        assert!(split_host_port("example.com").is_err());
        let (host, port) = split_host_port("example.com:443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }
}
