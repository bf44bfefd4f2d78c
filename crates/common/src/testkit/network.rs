use super::peer::TestPeer;
use crate::config::SyncConfig;
use crate::dht::MemoryDht;
use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;

/// A set of test peers sharing one in-memory DHT
///
/// Peers are keyed by a local name. A peer is either a freshly registered
/// user or another device of a user that is already registered.
pub struct TestNetwork {
    dht: MemoryDht,
    config: SyncConfig,
    peers: HashMap<String, TestPeer>,
}

impl TestNetwork {
    /// A network with small chunks and short backoffs
    pub fn new() -> Self {
        Self::with_config(SyncConfig {
            chunk_size: 1024,
            commit_backoff_ms: 1,
            io_backoff_ms: 1,
            max_commit_attempts: 20,
            ..SyncConfig::default()
        })
    }

    pub fn with_config(config: SyncConfig) -> Self {
        Self {
            dht: MemoryDht::new(),
            config,
            peers: HashMap::new(),
        }
    }

    /// The shared DHT, for fault injection and inspection
    pub fn dht(&self) -> &MemoryDht {
        &self.dht
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register user `name` and add a peer for them under the same name
    pub async fn add_peer(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.peers.contains_key(&name) {
            return Err(anyhow::anyhow!("Peer '{}' already exists", name));
        }
        let peer = TestPeer::register(&name, &name, &self.dht, self.config.clone()).await?;
        self.peers.insert(name, peer);
        Ok(())
    }

    /// Add a second device for an already registered `user`
    pub async fn add_device(
        &mut self,
        name: impl Into<String>,
        user: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        if self.peers.contains_key(&name) {
            return Err(anyhow::anyhow!("Peer '{}' already exists", name));
        }
        let peer = TestPeer::login(&name, &user.into(), &self.dht, self.config.clone()).await?;
        self.peers.insert(name, peer);
        Ok(())
    }

    pub fn peer(&self, name: &str) -> Option<&TestPeer> {
        self.peers.get(name)
    }

    pub fn peer_names(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn remove_peer(&mut self, name: &str) -> Option<TestPeer> {
        self.peers.remove(name)
    }

    /// Poll a condition until it succeeds or times out
    ///
    /// Errors from the condition count as "not yet".
    pub async fn eventually<F, Fut>(&self, timeout: Duration, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let start = std::time::Instant::now();
        let poll_interval = Duration::from_millis(20);

        loop {
            match condition().await {
                Ok(true) => {
                    tracing::debug!("Eventual condition met after {:?}", start.elapsed());
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!("Eventual condition check error: {}", e);
                }
            }

            if start.elapsed() > timeout {
                return Err(anyhow::anyhow!(
                    "Condition not met within timeout ({:?})",
                    timeout
                ));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}
