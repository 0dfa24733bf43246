//! DNS cache (component C): once-only insertion, process-lifetime memoisation.

use std::collections::HashMap;
use std::net::IpAddr;

use tokio::sync::Mutex;

/// Resolves a hostname to a single IP, memoising the first successful
/// answer forever. Hostnames are used verbatim — callers must strip the
/// port before calling [`DnsCache::query`].
pub struct DnsCache {
    entries: Mutex<HashMap<String, IpAddr>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `hostname`, returning `(ip, true)` on success. A literal IP
    /// address resolves to itself without a network lookup. On failure
    /// returns `(Ipv4Addr::UNSPECIFIED, false)` and stores nothing.
    pub async fn query(&self, hostname: &str) -> (IpAddr, bool) {
        let mut entries = self.entries.lock().await;
        if let Some(ip) = entries.get(hostname) {
            return (*ip, true);
        }

        if let Ok(ip) = hostname.parse::<IpAddr>() {
            entries.insert(hostname.to_string(), ip);
            return (ip, true);
        }

        match tokio::net::lookup_host((hostname, 0)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => {
                    let ip = addr.ip();
                    entries.insert(hostname.to_string(), ip);
                    (ip, true)
                }
                None => (std::net::Ipv4Addr::UNSPECIFIED.into(), false),
            },
            Err(_) => (std::net::Ipv4Addr::UNSPECIFIED.into(), false),
        }
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ip_resolves_to_identity_mapping() {
        let cache = DnsCache::new();
        let (ip, ok) = cache.query("203.0.113.5").await;
        assert!(ok);
        assert_eq!(ip.to_string(), "203.0.113.5");
    }

    #[tokio::test]
    async fn repeated_query_returns_same_answer() {
        let cache = DnsCache::new();
        let (first, ok1) = cache.query("8.8.8.8").await;
        let (second, ok2) = cache.query("8.8.8.8").await;
        assert!(ok1 && ok2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn bad_hostname_fails_without_caching() {
        let cache = DnsCache::new();
        let (_, ok) = cache.query("this.host.does.not.exist.invalid").await;
        assert!(!ok);
        assert!(!cache.entries.lock().await.contains_key("this.host.does.not.exist.invalid"));
    }
}
