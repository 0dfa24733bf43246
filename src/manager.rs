//! Node manager: builds the process-wide singletons once and spawns one
//! [`NodeServer`] per configured HTTP/SOCKS5 node, per §9's explicit-handle
//! ownership rule (no process globals).

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::error;

use crate::config::Config;
use crate::dns::DnsCache;
use crate::geoip::{maintenance, GeoIpClassifier};
use crate::server::{NodeKind, NodeServer, ServerError};
use crate::ssh::{TunnelClient, TunnelError, TunnelPool};

/// A node's transport is a pool of SSH sessions; an HTTP node configures
/// several (`pool_size`, default 10) and a SOCKS5 node is forced to
/// exactly one, both through the same `TunnelPool<Arc<TunnelClient>>` type
/// (§9's unification of the two historically-separate pool shapes).
type NodeTransport = TunnelPool<Arc<TunnelClient>>;

struct RunningNode {
    name: String,
    server: Arc<NodeServer<NodeTransport>>,
    join: JoinHandle<Result<(), ServerError>>,
}

pub struct Manager {
    nodes: Vec<RunningNode>,
}

impl Manager {
    /// Loads the GeoIP database (downloading it if missing — best effort,
    /// never fatal), then connects a tunnel pool and spawns a server for
    /// every configured node. A node whose tunnel pool fails to connect
    /// aborts the whole startup; a misconfigured node should be caught at
    /// `config::load` time, not here.
    pub async fn start(config: Config, geoip_db_path: &Path) -> anyhow::Result<Self> {
        maintenance::ensure_database(geoip_db_path).await;
        let dns_cache = Arc::new(DnsCache::new());
        let geoip = Arc::new(GeoIpClassifier::load(geoip_db_path, Arc::clone(&dns_cache)));

        let mut nodes = Vec::new();

        for (name, node_cfg) in &config.http {
            let pool = build_pool(node_cfg, node_cfg.pool_size).await?;
            let server = NodeServer::new(
                name.clone(),
                NodeKind::Http,
                node_cfg.clone(),
                pool,
                Arc::clone(&geoip),
            );
            let join = tokio::spawn(Arc::clone(&server).run());
            nodes.push(RunningNode {
                name: name.clone(),
                server,
                join,
            });
        }

        for (name, node_cfg) in &config.socks5 {
            let display_name = format!("socks5/{name}");
            let pool = build_pool(node_cfg, 1).await?;
            let server = NodeServer::new(
                display_name.clone(),
                NodeKind::Socks5,
                node_cfg.clone(),
                pool,
                Arc::clone(&geoip),
            );
            let join = tokio::spawn(Arc::clone(&server).run());
            nodes.push(RunningNode {
                name: display_name,
                server,
                join,
            });
        }

        Ok(Self { nodes })
    }

    /// Signals every node to stop accepting and joins its accept-loop task.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.server.shutdown();
        }
        for node in self.nodes {
            match node.join.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(node = %node.name, error = %e, "node exited with error"),
                Err(e) => error!(node = %node.name, error = %e, "node task panicked"),
            }
        }
    }
}

async fn build_pool(
    node_cfg: &crate::config::NodeConfig,
    size: usize,
) -> anyhow::Result<Arc<NodeTransport>> {
    let (user, host, port) = node_cfg
        .ssh
        .parse()
        .map_err(|_| anyhow::anyhow!("ssh.url must be user@host:port"))?;
    let addr = format!("{host}:{port}");
    let identity_file = node_cfg.ssh.identity_file.clone();

    let pool = TunnelPool::build(size, move |_slot| {
        let addr = addr.clone();
        let user = user.clone();
        let identity_file = identity_file.clone();
        async move { TunnelClient::connect(addr, user, identity_file).await }
    })
    .await
    .map_err(|e: TunnelError| anyhow::Error::new(e))?;

    Ok(Arc::new(pool))
}
