/// Lightweight test harness for multi-peer integration tests
///
/// Every peer in a [`TestNetwork`] talks to the same in-memory DHT, so a
/// test can register several users (or log one user in on several
/// devices), let them race each other and inspect what landed.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::TestNetwork;
///
/// #[tokio::test]
/// async fn test_share_and_read() -> anyhow::Result<()> {
///     let mut net = TestNetwork::new();
///     net.add_peer("alice").await?;
///     net.add_peer("bob").await?;
///
///     let alice = net.peer("alice").unwrap();
///     alice.upload_folder("photos").await?;
///     alice.share("photos", "bob", PermissionType::Read).await?;
///
///     let bob = net.peer("bob").unwrap();
///     bob.accept_shares().await?;
///     Ok(())
/// }
/// ```
mod listener;
mod network;
mod peer;

pub use listener::TestListener;
pub use network::TestNetwork;
pub use peer::TestPeer;
