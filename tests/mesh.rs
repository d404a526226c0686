use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rendezvous_mesh::{
    ClientConfig, ConnectOutcome, Error, NodeConfig, PeerAddress, PeerIncoming, PeerNode,
    RegistryClient, RegistryConfig, RegistryHandle, RegistryServer, Rendezvous,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};

fn local_config() -> NodeConfig {
    NodeConfig::default()
        .listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
        .advertise_host("127.0.0.1")
        .connect_timeout(Duration::from_secs(2))
        .write_timeout(Duration::from_secs(2))
}

async fn spawn_registry() -> RegistryHandle {
    RegistryServer::bind("127.0.0.1:0", RegistryConfig::default())
        .await
        .unwrap()
        .spawn()
        .unwrap()
}

fn client_for(registry: &RegistryHandle) -> RegistryClient {
    RegistryClient::with_config(
        PeerAddress::from(registry.local_addr()),
        ClientConfig::default().io_timeout(Duration::from_secs(2)),
    )
}

/// An address nothing is listening on.
async fn dead_address() -> PeerAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = PeerAddress::from(listener.local_addr().unwrap());
    drop(listener);
    addr
}

async fn next_payload(incoming: &mut PeerIncoming) -> String {
    timeout(Duration::from_secs(5), incoming.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("incoming stream ended")
        .payload
}

async fn assert_silent(incoming: &mut PeerIncoming) {
    let res = timeout(Duration::from_millis(200), incoming.recv()).await;
    assert!(res.is_err(), "unexpected frame: {:?}", res);
}

/// Poll `check` until it holds or a few seconds pass.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// In-memory rendezvous for exercising the node without a registry service.
#[derive(Clone, Default)]
struct StaticRendezvous {
    peers: Arc<Mutex<Vec<PeerAddress>>>,
}

#[async_trait]
impl Rendezvous for StaticRendezvous {
    async fn register(&self, addr: &PeerAddress) -> rendezvous_mesh::Result<()> {
        let mut peers = self.peers.lock().await;
        if !peers.contains(addr) {
            peers.push(addr.clone());
        }
        Ok(())
    }

    async fn unregister(&self, addr: &PeerAddress) -> rendezvous_mesh::Result<()> {
        self.peers.lock().await.retain(|p| p != addr);
        Ok(())
    }

    async fn peers(&self) -> rendezvous_mesh::Result<Vec<PeerAddress>> {
        Ok(self.peers.lock().await.clone())
    }
}

/// Delays every registration before handing it to the wrapped rendezvous.
struct SlowRegister<R> {
    inner: R,
    delay: Duration,
}

#[async_trait]
impl<R: Rendezvous> Rendezvous for SlowRegister<R> {
    async fn register(&self, addr: &PeerAddress) -> rendezvous_mesh::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.register(addr).await
    }

    async fn unregister(&self, addr: &PeerAddress) -> rendezvous_mesh::Result<()> {
        self.inner.unregister(addr).await
    }

    async fn peers(&self) -> rendezvous_mesh::Result<Vec<PeerAddress>> {
        self.inner.peers().await
    }
}

#[test_log::test(tokio::test)]
async fn test_broadcast_reaches_every_peer_but_sender() {
    let registry = spawn_registry().await;
    let client = client_for(&registry);

    let (node1, mut in1) = PeerNode::start_with_rendezvous(local_config(), client.clone())
        .await
        .unwrap();
    let (node2, mut in2) = PeerNode::start_with_rendezvous(local_config(), client.clone())
        .await
        .unwrap();
    let (node3, mut in3) = PeerNode::start_with_rendezvous(local_config(), client.clone())
        .await
        .unwrap();

    let store = registry.store().clone();
    let s = &store;
    assert!(eventually(|| async move { s.len().await == 3 }).await);

    let report = node1.discover().await.unwrap();
    assert_eq!(report.connected.len(), 2, "{report:?}");
    assert_eq!(report.skipped, vec![node1.advertised_addr().clone()]);
    assert!(report.failed.is_empty());

    assert_eq!(
        node2.connect(node3.advertised_addr()).await.unwrap(),
        ConnectOutcome::Connected
    );

    let sent = node1.broadcast("hello mesh").await;
    assert_eq!(sent.delivered, 2);
    assert!(sent.evicted.is_empty());

    assert_eq!(next_payload(&mut in2).await, "hello mesh");
    assert_eq!(next_payload(&mut in3).await, "hello mesh");
    assert_silent(&mut in1).await;

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
    node3.shutdown().await.unwrap();

    // every node unregistered on the way out
    assert!(eventually(|| async move { s.is_empty().await }).await);
    registry.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_closed_peer_is_dropped_from_table() {
    let (node1, _in1) = PeerNode::start(local_config()).await.unwrap();
    let (node2, _in2) = PeerNode::start(local_config()).await.unwrap();
    let (node3, mut in3) = PeerNode::start(local_config()).await.unwrap();

    let addr2 = node2.advertised_addr().clone();
    let addr3 = node3.advertised_addr().clone();
    node1.connect(&addr2).await.unwrap();
    node1.connect(&addr3).await.unwrap();
    assert_eq!(node1.connected_peers().await.len(), 2);

    node2.shutdown().await.unwrap();

    let n1 = &node1;
    let a2 = &addr2;
    assert!(eventually(|| async move { !n1.connected_peers().await.contains(a2) }).await);

    let report = node1.broadcast("still here").await;
    assert_eq!(report.delivered, 1);
    assert!(report.evicted.is_empty());
    assert_eq!(next_payload(&mut in3).await, "still here");

    node1.shutdown().await.unwrap();
    node3.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_inbound_connections_are_tracked() {
    let (node1, _in1) = PeerNode::start(local_config()).await.unwrap();
    let (node2, mut in2) = PeerNode::start(local_config()).await.unwrap();

    node1.connect(node2.advertised_addr()).await.unwrap();

    let n2 = &node2;
    assert!(eventually(|| async move { n2.connected_peers().await.len() == 1 }).await);

    // node2 knows node1 by the ephemeral address of the inbound socket
    let inbound = node2.connected_peers().await.remove(0);
    assert_eq!(inbound.host(), "127.0.0.1");
    assert_ne!(&inbound, node1.advertised_addr());

    node1.broadcast("ping").await;
    let msg = timeout(Duration::from_secs(5), in2.recv()).await.unwrap().unwrap();
    assert_eq!(msg.from, inbound);

    // replies go back over the same connection
    node2.unicast("pong", &inbound).await.unwrap();

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_redundant_connects_are_rejected() {
    let (node1, _in1) = PeerNode::start(local_config()).await.unwrap();
    let (node2, _in2) = PeerNode::start(local_config()).await.unwrap();
    let target = node2.advertised_addr().clone();

    let (a, b) = tokio::join!(node1.connect(&target), node1.connect(&target));
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o != ConnectOutcome::Connected);
    assert_eq!(
        outcomes,
        vec![ConnectOutcome::Connected, ConnectOutcome::AlreadyConnected]
    );

    assert_eq!(
        node1.connect(&target).await.unwrap(),
        ConnectOutcome::AlreadyConnected
    );
    assert_eq!(node1.connected_peers().await, vec![target]);

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_self_connect_is_skipped() {
    let (node, _incoming) = PeerNode::start(local_config()).await.unwrap();
    let own = node.advertised_addr().clone();

    assert_eq!(node.connect(&own).await.unwrap(), ConnectOutcome::SelfAddress);
    assert!(node.connected_peers().await.is_empty());

    node.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_connect_all_tolerates_failures() {
    let (node1, _in1) = PeerNode::start(local_config()).await.unwrap();
    let (node2, _in2) = PeerNode::start(local_config()).await.unwrap();
    let dead = dead_address().await;
    let live = node2.advertised_addr().clone();

    let report = node1.connect_all([dead.clone(), live.clone()]).await;
    assert_eq!(report.connected, vec![live.clone()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, dead);
    assert!(matches!(report.failed[0].1, Error::Io(_)));

    assert!(node1.connect(&dead).await.is_err());
    assert_eq!(node1.connected_peers().await, vec![live]);

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_unicast_targets_one_peer() {
    let (node1, _in1) = PeerNode::start(local_config()).await.unwrap();
    let (node2, mut in2) = PeerNode::start(local_config()).await.unwrap();
    let (node3, mut in3) = PeerNode::start(local_config()).await.unwrap();

    node1
        .connect_all([node2.advertised_addr().clone(), node3.advertised_addr().clone()])
        .await;

    node1.unicast("just you", node3.advertised_addr()).await.unwrap();
    assert_eq!(next_payload(&mut in3).await, "just you");
    assert_silent(&mut in2).await;

    let stranger = PeerAddress::new("192.0.2.10", 9);
    let err = node1.unicast("hello?", &stranger).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected(ref a) if *a == stranger));

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
    node3.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_unreachable_registry_does_not_block_startup() {
    let client = RegistryClient::with_config(
        dead_address().await,
        ClientConfig::default().io_timeout(Duration::from_secs(1)),
    );
    let (node, _incoming) = PeerNode::start_with_rendezvous(local_config(), client)
        .await
        .unwrap();

    assert!(node.discover().await.is_err());
    node.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_discover_through_custom_rendezvous() {
    let rendezvous = StaticRendezvous::default();
    let (node1, _in1) = PeerNode::start_with_rendezvous(local_config(), rendezvous.clone())
        .await
        .unwrap();
    let (node2, _in2) = PeerNode::start_with_rendezvous(local_config(), rendezvous.clone())
        .await
        .unwrap();

    let r = &rendezvous;
    assert!(eventually(|| async move { r.peers().await.unwrap().len() == 2 }).await);

    let report = node1.discover().await.unwrap();
    assert_eq!(report.connected, vec![node2.advertised_addr().clone()]);

    node2.shutdown().await.unwrap();
    assert_eq!(
        rendezvous.peers().await.unwrap(),
        vec![node1.advertised_addr().clone()]
    );
    node1.shutdown().await.unwrap();
    assert!(rendezvous.peers().await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_shutdown_closes_every_connection() {
    let (node1, mut in1) = PeerNode::start(local_config()).await.unwrap();
    let (node2, _in2) = PeerNode::start(local_config()).await.unwrap();
    let (node3, _in3) = PeerNode::start(local_config()).await.unwrap();

    node1
        .connect_all([node2.advertised_addr().clone(), node3.advertised_addr().clone()])
        .await;
    let n2 = &node2;
    let n3 = &node3;
    assert!(eventually(|| async move { n2.connected_peers().await.len() == 1 }).await);
    assert!(eventually(|| async move { n3.connected_peers().await.len() == 1 }).await);

    node1.shutdown().await.unwrap();

    assert!(eventually(|| async move { n2.connected_peers().await.is_empty() }).await);
    assert!(eventually(|| async move { n3.connected_peers().await.is_empty() }).await);

    // with the node gone and its loops aborted, the inbound stream ends
    let ended = timeout(Duration::from_secs(5), in1.recv()).await.unwrap();
    assert!(ended.is_none());

    node2.shutdown().await.unwrap();
    node3.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_idle_connections_are_closed() {
    let idle = local_config().idle_timeout(Duration::from_millis(150));
    let (node1, _in1) = PeerNode::start(idle).await.unwrap();
    let (node2, _in2) = PeerNode::start(local_config()).await.unwrap();

    node1.connect(node2.advertised_addr()).await.unwrap();
    assert_eq!(node1.connected_peers().await.len(), 1);

    let n1 = &node1;
    let n2 = &node2;
    assert!(eventually(|| async move { n1.connected_peers().await.is_empty() }).await);
    // node2 sees the close as end-of-stream
    assert!(eventually(|| async move { n2.connected_peers().await.is_empty() }).await);

    node1.shutdown().await.unwrap();
    node2.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_shutdown_after_slow_registration_leaves_no_entry() {
    let registry = spawn_registry().await;
    let slow = SlowRegister {
        inner: client_for(&registry),
        delay: Duration::from_millis(100),
    };
    let (node, _incoming) = PeerNode::start_with_rendezvous(local_config(), slow)
        .await
        .unwrap();

    // shut down before the registration has had a chance to land
    node.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(registry.store().is_empty().await);
    registry.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_shutdown_completes_against_silent_registry() {
    // accepts and holds connections without ever answering
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = PeerAddress::from(listener.local_addr().unwrap());
    let holder = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            open.push(stream);
        }
    });

    let config = local_config().shutdown_timeout(Duration::from_millis(200));
    let (node, _incoming) = PeerNode::start_with_rendezvous(config, RegistryClient::new(endpoint))
        .await
        .unwrap();

    let finished = timeout(Duration::from_secs(3), node.shutdown()).await;
    assert!(finished.is_ok(), "shutdown hung on an unresponsive registry");
    finished.unwrap().unwrap();

    holder.abort();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_inbound_frames_use_runtime_clock() {
    let config = NodeConfig::default().listen_addr(SocketAddr::from(([127, 0, 0, 1], 0)));
    let (node, mut incoming) = PeerNode::start(config).await.unwrap();
    let mut stream = TcpStream::connect(node.local_addr()).await.unwrap();

    let start = Instant::now();
    tokio::time::advance(Duration::from_secs(60)).await;
    stream.write_all(b"late").await.unwrap();

    let msg = incoming.recv().await.expect("incoming stream ended");
    assert_eq!(msg.payload, "late");
    assert!(msg.received_at >= start + Duration::from_secs(60));

    node.shutdown().await.unwrap();
}
