use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use nibble_core::sync::{PeerTransport, SyncMessage};

use crate::config::PeerConfig;

/// The paired device's host, reached over HTTP.
pub struct HttpPeer {
    client: reqwest::Client,
    base_url: String,
    key: Option<String>,
    probe_timeout: Duration,
}

impl HttpPeer {
    pub fn new(peer: &PeerConfig, probe_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("nibble/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .connect_timeout(probe_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: peer.url.clone(),
            key: peer.key.clone(),
            probe_timeout,
        })
    }
}

#[async_trait]
impl PeerTransport for HttpPeer {
    async fn is_reachable(&self) -> bool {
        let result = self
            .client
            .get(format!("{}/api/health", self.base_url))
            .timeout(self.probe_timeout)
            .send()
            .await;
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(peer = %self.base_url, "reachability probe failed: {err}");
                false
            }
        }
    }

    async fn send(&self, message: &SyncMessage) -> Result<()> {
        let mut request = self
            .client
            .post(format!("{}/api/sync", self.base_url))
            .json(message);
        if let Some(key) = &self.key {
            request = request.bearer_auth(key);
        }
        request
            .send()
            .await
            .context("Failed to reach peer")?
            .error_for_status()
            .context("Peer rejected sync message")?;
        Ok(())
    }
}
