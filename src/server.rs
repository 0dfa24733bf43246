//! Node server (component H): accepts client connections on one listener,
//! decodes the wire protocol, routes, dials out, and splices.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_io_timeout::TimeoutStream;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::flow::{format_bytes, FlowMeter, MeteredStream};
use crate::geoip::GeoIpClassifier;
use crate::protocol::{self, DecodeError, DialRequest};
use crate::route::{self, RoutePlan};
use crate::ssh::{BoxedDuplex, TunnelTransport};

/// I/O deadline applied to every accepted client connection and renewed on
/// every read/write (§5 "per-operation renewed deadline").
const CLIENT_IO_DEADLINE: Duration = Duration::from_secs(180);
/// Connect timeout for both the `Direct` and `Anonymous` dial paths.
const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// How often the node's flow meter emits a summary log line.
const FLOW_EMIT_INTERVAL_SECONDS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Http,
    Socks5,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("node {name}: listen address {addr:?} does not parse")]
    BadAddr { name: String, addr: String },
    #[error("node {name}: failed to bind {addr}: {source}")]
    Listen {
        name: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub struct NodeServer<T: TunnelTransport> {
    name: String,
    kind: NodeKind,
    config: NodeConfig,
    tunnel: Arc<T>,
    geoip: Arc<GeoIpClassifier>,
    flow: Arc<FlowMeter>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: TunnelTransport + 'static> NodeServer<T> {
    pub fn new(
        name: String,
        kind: NodeKind,
        config: NodeConfig,
        tunnel: Arc<T>,
        geoip: Arc<GeoIpClassifier>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            name,
            kind,
            config,
            tunnel,
            geoip,
            flow: FlowMeter::new(),
            shutdown_tx,
        })
    }

    /// Binds the listener and runs the accept loop until `shutdown` is
    /// called or `accept` itself fails (the latter is treated as fatal —
    /// the node will not re-accept, per §7).
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let addr = self.config.listen_addr().map_err(|_| ServerError::BadAddr {
            name: self.name.clone(),
            addr: self.config.addr.clone(),
        })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Listen {
                name: self.name.clone(),
                addr,
                source,
            })?;

        let name = self.name.clone();
        self.flow.start(FLOW_EMIT_INTERVAL_SECONDS, move |snap| {
            info!(
                node = %name,
                conn = snap.conn,
                read_total = %format_bytes(snap.read_total),
                written_total = %format_bytes(snap.written_total),
                read_peak = %format_bytes(snap.read_speed_peak),
                written_peak = %format_bytes(snap.written_speed_peak),
                "netflow"
            );
        });

        info!(node = %self.name, %addr, kind = ?self.kind, "listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer).await {
                                    debug!(node = %server.name, %peer, error = %e, "connection ended");
                                }
                            });
                        }
                        Err(e) => {
                            error!(node = %self.name, error = %e, "accept failed, node stopping");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!(node = %self.name, "shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.flow.stop();
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), DecodeError> {
        let mut client = TimeoutStream::new(stream);
        client.set_read_timeout(Some(CLIENT_IO_DEADLINE));
        client.set_write_timeout(Some(CLIENT_IO_DEADLINE));

        let dial_req = match self.kind {
            NodeKind::Http => protocol::http::decode(&mut client).await,
            NodeKind::Socks5 => protocol::socks5::decode(&mut client).await,
        }?;

        let plan = route::decide(&self.config, &self.geoip, &dial_req.target).await;

        let outbound = match self.dial_plan(&plan).await {
            Ok(o) => o,
            Err(e) => {
                warn!(node = %self.name, %peer, target = %dial_req.target, error = %e, "dial failed");
                return Ok(());
            }
        };
        let mut outbound = MeteredStream::new(outbound, Arc::clone(&self.flow));

        self.flow.add_conn(1);
        if let Err(e) = self.pre_splice_reply(&mut client, &mut outbound, &plan, &dial_req).await {
            self.flow.del_conn(1);
            return Err(e.into());
        }

        info!(node = %self.name, %peer, target = %dial_req.target, plan = ?plan, "connected");
        splice(client, outbound).await;
        self.flow.del_conn(1);
        info!(node = %self.name, %peer, target = %dial_req.target, "released");

        Ok(())
    }

    async fn dial_plan(&self, plan: &RoutePlan) -> anyhow::Result<BoxedDuplex> {
        match plan {
            // Bridge, Anonymous, and the non-local Tunnel fallback all go
            // out over the SSH tunnel; only a local-region target is
            // dialed with a plain local TCP connection (§4.G).
            RoutePlan::Bridge(bridge) => Ok(self.tunnel.dial("tcp", bridge).await?),
            RoutePlan::Anonymous(upstream) => Ok(self.tunnel.dial("tcp", upstream).await?),
            RoutePlan::Tunnel(target) => Ok(self.tunnel.dial("tcp", target).await?),
            RoutePlan::Direct(target) => dial_tcp(target).await,
        }
    }

    /// Mirrors the original's `localReply && req.IsHTTPS()` branch exactly:
    /// a locally-terminated CONNECT (`Direct`/`Tunnel`) gets the client-side
    /// 200 reply; every other case forwards the client's original preamble
    /// to the outbound stream, and a SOCKS5 request gets its echoed reply
    /// only once the dial has actually succeeded.
    async fn pre_splice_reply<C, O>(
        &self,
        client: &mut C,
        outbound: &mut O,
        plan: &RoutePlan,
        dial_req: &DialRequest,
    ) -> std::io::Result<()>
    where
        C: tokio::io::AsyncWrite + Unpin,
        O: tokio::io::AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWriteExt;

        let is_proxy_hop = matches!(plan, RoutePlan::Bridge(_) | RoutePlan::Anonymous(_));

        if dial_req.requires_tls_ok_reply && !is_proxy_hop {
            client.write_all(protocol::HTTP_CONNECT_OK).await?;
        } else if !dial_req.preamble.is_empty() {
            outbound.write_all(&dial_req.preamble).await?;
        }

        if let Some(template) = &dial_req.socks5_reply_template {
            let reply = protocol::socks5::success_reply(template);
            client.write_all(&reply).await?;
        }

        Ok(())
    }
}

async fn dial_tcp(addr: &str) -> anyhow::Result<BoxedDuplex> {
    let stream = tokio::time::timeout(DIRECT_DIAL_TIMEOUT, TcpStream::connect(addr)).await??;
    Ok(BoxedDuplex::new(stream))
}

/// Splices two duplex streams bidirectionally with a 32 KiB buffer per
/// direction; the first direction to finish (EOF or error) tears down the
/// other by virtue of `select!` dropping its still-pending future, which
/// drops both stream halves and closes the underlying sockets.
async fn splice<C, O>(client: C, outbound: O)
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    O: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (client_r, mut client_w) = tokio::io::split(client);
    let (out_r, mut out_w) = tokio::io::split(outbound);

    let mut client_r = tokio::io::BufReader::with_capacity(32 * 1024, client_r);
    let mut out_r = tokio::io::BufReader::with_capacity(32 * 1024, out_r);

    tokio::select! {
        res = tokio::io::copy_buf(&mut client_r, &mut out_w) => { let _ = res; }
        res = tokio::io::copy_buf(&mut out_r, &mut client_w) => { let _ = res; }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DialRequest;
    use bytes::Bytes;
    use tokio::io::duplex;

    #[tokio::test]
    async fn direct_connect_gets_local_reply_not_forwarded_preamble() {
        let (mut client_peer, client) = duplex(256);
        let (mut outbound_peer, outbound) = duplex(256);
        let mut client = client;
        let mut outbound = outbound;

        let req = DialRequest {
            target: "example.com:443".to_string(),
            preamble: Bytes::from_static(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n"),
            requires_tls_ok_reply: true,
            socks5_reply_template: None,
        };

        let server = NodeServerTestHandle;
        server
            .pre_splice_reply(&mut client, &mut outbound, &RoutePlan::Direct(req.target.clone()), &req)
            .await
            .unwrap();

        drop(client);
        drop(outbound);

        let mut got = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client_peer, &mut got).await.unwrap();
        assert_eq!(got, protocol::HTTP_CONNECT_OK);

        let mut forwarded = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut outbound_peer, &mut forwarded).await.unwrap();
        assert!(forwarded.is_empty());
    }

    #[tokio::test]
    async fn bridged_connect_forwards_preamble_instead_of_local_reply() {
        let (mut client_peer, client) = duplex(256);
        let (mut outbound_peer, outbound) = duplex(256);
        let mut client = client;
        let mut outbound = outbound;

        let req = DialRequest {
            target: "example.com:443".to_string(),
            preamble: Bytes::from_static(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n"),
            requires_tls_ok_reply: true,
            socks5_reply_template: None,
        };

        let server = NodeServerTestHandle;
        server
            .pre_splice_reply(&mut client, &mut outbound, &RoutePlan::Bridge("bridge:3128".into()), &req)
            .await
            .unwrap();

        drop(client);
        drop(outbound);

        let mut got = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client_peer, &mut got).await.unwrap();
        assert!(got.is_empty());

        let mut forwarded = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut outbound_peer, &mut forwarded).await.unwrap();
        assert_eq!(forwarded, req.preamble.to_vec());
    }

    /// A free-standing copy of `pre_splice_reply`'s logic so the decision
    /// table can be tested without constructing a whole `NodeServer<T>`
    /// (which needs a live `TunnelTransport`).
    struct NodeServerTestHandle;

    impl NodeServerTestHandle {
        async fn pre_splice_reply<C, O>(
            &self,
            client: &mut C,
            outbound: &mut O,
            plan: &RoutePlan,
            dial_req: &DialRequest,
        ) -> std::io::Result<()>
        where
            C: tokio::io::AsyncWrite + Unpin,
            O: tokio::io::AsyncWrite + Unpin,
        {
            use tokio::io::AsyncWriteExt;
            let is_proxy_hop = matches!(plan, RoutePlan::Bridge(_) | RoutePlan::Anonymous(_));
            if dial_req.requires_tls_ok_reply && !is_proxy_hop {
                client.write_all(protocol::HTTP_CONNECT_OK).await?;
            } else if !dial_req.preamble.is_empty() {
                outbound.write_all(&dial_req.preamble).await?;
            }
            if let Some(template) = &dial_req.socks5_reply_template {
                let reply = protocol::socks5::success_reply(template);
                client.write_all(&reply).await?;
            }
            Ok(())
        }
    }
}
