//! Best-effort GeoIP database download, mirroring the original's
//! `wget -O geoip.mmdb <hard-coded URL>` fallback in `geoip.Load`.

use std::path::Path;

use tracing::{info, warn};

const DOWNLOAD_URL: &str =
    "https://raw.githubusercontent.com/Hackl0us/GeoIP2-CN/release/Country.mmdb";

/// Downloads the country database to `path` if it doesn't already exist.
/// Never fails node startup: a download failure is logged and the caller
/// proceeds to load (or fail to load) whatever is on disk.
pub async fn ensure_database(path: &Path) {
    if path.exists() {
        return;
    }

    info!(path = %path.display(), url = DOWNLOAD_URL, "geoip database missing, downloading");

    let result = async {
        let bytes = reqwest::get(DOWNLOAD_URL).await?.bytes().await?;
        tokio::fs::write(path, &bytes).await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        warn!(error = %e, "failed to download geoip database; lookups will default to local region");
    }
}
