//! GeoIP classifier (component D): decides whether a target belongs to the
//! "local region" (country code `CN`), conservatively defaulting to `true`
//! on any failure so ambiguous hosts stay on the direct path rather than
//! burning a scarce SSH tunnel slot (see §4.D rationale).

pub mod maintenance;

use std::sync::Arc;

use tracing::warn;

use crate::dns::DnsCache;

pub struct GeoIpClassifier {
    db: Option<maxminddb::Reader<Vec<u8>>>,
    dns_cache: Arc<DnsCache>,
}

impl GeoIpClassifier {
    /// Load the MaxMind database at `path`. A missing or unreadable
    /// database degrades every lookup to the conservative default rather
    /// than failing node startup — this is consistent with the core
    /// treating GeoIP failures as non-fatal.
    pub fn load(path: &std::path::Path, dns_cache: Arc<DnsCache>) -> Self {
        let db = match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "geoip database unavailable, defaulting to local region on every lookup");
                None
            }
        };
        Self { db, dns_cache }
    }

    /// `true` if `target` (a `host` or `host:port`) resolves to a local
    /// (`CN`) address, or if anything about the lookup failed.
    pub async fn in_local_region(&self, target: &str) -> bool {
        let host = match target.rsplit_once(':') {
            Some((h, _port)) => h,
            None => target,
        };
        if host.is_empty() {
            return true;
        }

        let (ip, ok) = self.dns_cache.query(host).await;
        if !ok {
            return true;
        }

        let Some(db) = &self.db else {
            return true;
        };

        match db.lookup::<maxminddb::geoip2::Country>(ip) {
            Ok(Some(record)) => record
                .country
                .and_then(|c| c.iso_code)
                .map(|code| code == "CN")
                .unwrap_or(true),
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "geoip lookup failed");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_database_defaults_to_local_region() {
        let dns_cache = Arc::new(DnsCache::new());
        let classifier = GeoIpClassifier::load(std::path::Path::new("/nonexistent.mmdb"), dns_cache);
        assert!(classifier.in_local_region("8.8.8.8:443").await);
    }

    #[tokio::test]
    async fn strips_port_before_resolving() {
        let dns_cache = Arc::new(DnsCache::new());
        let classifier = GeoIpClassifier::load(std::path::Path::new("/nonexistent.mmdb"), dns_cache);
        // No database loaded -> conservative true regardless of host, but
        // this also exercises the host:port split path without panicking.
        assert!(classifier.in_local_region("example.com:443").await);
    }
}
