//! Route policy (component G): an ordered decision tree run once per
//! accepted connection, deciding how its target gets dialed.

use crate::config::NodeConfig;
use crate::geoip::GeoIpClassifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutePlan {
    /// Matched a hostname glob in the node's match table: dial the paired
    /// bridge address over the tunnel instead of the original target.
    Bridge(String),
    /// No match, target is outside the local region, node has an
    /// anonymous upstream configured: dial that upstream HTTP proxy over
    /// the tunnel instead of the real target.
    Anonymous(String),
    /// No match, no anonymous upstream configured, target is in the local
    /// region: dial directly.
    Direct(String),
    /// No match, target is outside the local region: dial over the tunnel.
    Tunnel(String),
}

/// Decides the outbound path for `target` (`host:port`).
///
/// Order mirrors the original exactly: the match table is checked first
/// (sorted by bridge address, since `NodeConfig::matches` is a
/// `BTreeMap` — see DESIGN.md), then GeoIP, then the anonymous upstream,
/// falling back to the tunnel.
pub async fn decide(node: &NodeConfig, geoip: &GeoIpClassifier, target: &str) -> RoutePlan {
    let host = target.rsplit_once(':').map(|(h, _)| h).unwrap_or(target);

    for (bridge, patterns) in &node.matches {
        for pattern in patterns {
            if glob::Pattern::new(pattern)
                .map(|p| p.matches(host))
                .unwrap_or(false)
            {
                return RoutePlan::Bridge(bridge.clone());
            }
        }
    }

    if geoip.in_local_region(target).await {
        return RoutePlan::Direct(target.to_string());
    }

    match &node.anonymous {
        Some(upstream) => RoutePlan::Anonymous(upstream.clone()),
        None => RoutePlan::Tunnel(target.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SshConfig;
    use crate::dns::DnsCache;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn node(matches: BTreeMap<String, Vec<String>>, anonymous: Option<&str>) -> NodeConfig {
        NodeConfig {
            addr: ":8001".to_string(),
            ssh: SshConfig {
                url: "goway@localhost:22".to_string(),
                identity_file: PathBuf::from("id"),
            },
            anonymous: anonymous.map(str::to_string),
            matches,
            pool_size: 1,
        }
    }

    fn no_database_classifier() -> GeoIpClassifier {
        GeoIpClassifier::load(std::path::Path::new("/nonexistent.mmdb"), Arc::new(DnsCache::new()))
    }

    #[tokio::test]
    async fn glob_match_wins_over_geoip_and_anonymous() {
        let mut matches = BTreeMap::new();
        matches.insert("bridge.internal:3128".to_string(), vec!["*.openai.com".to_string()]);
        let node = node(matches, Some("127.0.0.1:3128"));
        let plan = decide(&node, &no_database_classifier(), "api.openai.com:443").await;
        assert_eq!(plan, RoutePlan::Bridge("bridge.internal:3128".to_string()));
    }

    #[tokio::test]
    async fn no_match_with_missing_database_defaults_direct() {
        // A missing GeoIP database is conservatively "local region" (§4.D),
        // so with no match table entries this takes the Direct branch.
        let node = node(BTreeMap::new(), Some("127.0.0.1:3128"));
        let plan = decide(&node, &no_database_classifier(), "example.com:443").await;
        assert_eq!(plan, RoutePlan::Direct("example.com:443".to_string()));
    }

    #[tokio::test]
    async fn lowest_bridge_address_wins_when_multiple_match() {
        let mut matches = BTreeMap::new();
        matches.insert("zzz.bridge:1".to_string(), vec!["*.example.com".to_string()]);
        matches.insert("aaa.bridge:1".to_string(), vec!["*.example.com".to_string()]);
        let node = node(matches, None);
        let plan = decide(&node, &no_database_classifier(), "foo.example.com:443").await;
        assert_eq!(plan, RoutePlan::Bridge("aaa.bridge:1".to_string()));
    }
}
