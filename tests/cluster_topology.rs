use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use rudder::protocol::redis::{RespCodec, RespValue};
use rudder::{hash_slot, Client, Cluster, ClusterConfig, NodeRef, ReconfigStatus, Request, SeedAddr};

const NAME_A: &str = "07c37dfeb235213a872192d90877d0cd55635b91";
const NAME_B: &str = "e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca";

/// Minimal in-process stand-in for a cluster node: answers `CLUSTER NODES`
/// with a canned topology and `AUTH` against an optional secret.
struct FakeNode {
    addr: SocketAddr,
    topology: Arc<Mutex<String>>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeNode {
    async fn start(secret: Option<String>) -> Result<FakeNode> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let topology = Arc::new(Mutex::new(String::new()));

        let served = topology.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let topology = served.clone();
                let secret = secret.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, topology, secret).await;
                });
            }
        });

        Ok(FakeNode {
            addr,
            topology,
            task,
        })
    }

    fn set_topology(&self, text: String) {
        *self.topology.lock().unwrap() = text;
    }

    fn seed(&self) -> SeedAddr {
        SeedAddr::Tcp {
            ip: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }

    fn addr_string(&self) -> String {
        format!("{}:{}", self.addr.ip(), self.addr.port())
    }

    async fn shut_down(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    topology: Arc<Mutex<String>>,
    secret: Option<String>,
) -> Result<()> {
    let mut framed = Framed::new(stream, RespCodec::default());
    let mut authenticated = secret.is_none();
    while let Some(frame) = framed.next().await {
        let reply = respond(frame?, &topology, secret.as_deref(), &mut authenticated);
        framed.send(reply).await?;
    }
    Ok(())
}

fn respond(
    cmd: RespValue,
    topology: &Mutex<String>,
    secret: Option<&str>,
    authenticated: &mut bool,
) -> RespValue {
    let parts = match cmd {
        RespValue::Array(parts) => parts,
        _ => return RespValue::error("ERR protocol error"),
    };
    let mut words = parts.iter().filter_map(|part| part.as_text());
    let command = words.next().unwrap_or_default().to_ascii_uppercase();

    if command == "AUTH" {
        return match (secret, words.next()) {
            (Some(expected), Some(given)) if given == expected => {
                *authenticated = true;
                RespValue::simple("OK")
            }
            (Some(_), _) => RespValue::error("ERR invalid password"),
            (None, _) => {
                RespValue::error("ERR Client sent AUTH, but no password is set")
            }
        };
    }
    if !*authenticated {
        return RespValue::error("NOAUTH Authentication required.");
    }
    if command == "CLUSTER" && words.next().unwrap_or_default().to_ascii_uppercase() == "NODES" {
        return RespValue::bulk(topology.lock().unwrap().as_bytes());
    }
    RespValue::error("ERR unknown command")
}

/// Start a two-primary cluster: A owns 0-8191, B owns 8192-16383.
async fn start_two_primaries(secret: Option<&str>) -> Result<(FakeNode, FakeNode)> {
    let a = FakeNode::start(secret.map(str::to_string)).await?;
    let b = FakeNode::start(secret.map(str::to_string)).await?;

    let line = |name: &str, addr: &SocketAddr, myself: bool, slots: &str, epoch: u32| {
        let flags = if myself { "myself,master" } else { "master" };
        format!(
            "{name} {ip}:{port}@{bus} {flags} - 0 0 {epoch} connected {slots}\n",
            ip = addr.ip(),
            port = addr.port(),
            bus = addr.port() as u32 + 10_000,
        )
    };

    a.set_topology(format!(
        "{}{}",
        line(NAME_A, &a.addr, true, "0-8191", 1),
        line(NAME_B, &b.addr, false, "8192-16383", 2),
    ));
    b.set_topology(format!(
        "{}{}",
        line(NAME_A, &a.addr, false, "0-8191", 1),
        line(NAME_B, &b.addr, true, "8192-16383", 2),
    ));
    Ok((a, b))
}

fn test_config(auth: Option<&str>) -> ClusterConfig {
    ClusterConfig {
        name: "test".to_string(),
        auth: auth.map(str::to_string),
        connect_timeout: Some(1_000),
        ..ClusterConfig::default()
    }
}

#[tokio::test]
async fn fetch_builds_topology_and_routes_keys() -> Result<()> {
    let (a, b) = start_two_primaries(None).await?;
    let cluster = Cluster::new(0, &test_config(None));
    cluster.fetch_configuration(&a.seed()).await?;

    assert_eq!(cluster.node_count(), 2);
    let nodes = cluster.nodes();
    assert_eq!(nodes[0].borrow().name.as_deref(), Some(NAME_A));
    assert_eq!(nodes[1].borrow().name.as_deref(), Some(NAME_B));
    assert!(nodes[0].borrow().connection.connected);

    for (slot, want) in [
        (0u16, a.addr_string()),
        (8191, a.addr_string()),
        (8192, b.addr_string()),
        (16383, b.addr_string()),
    ] {
        assert_eq!(cluster.node_for_slot(slot).unwrap().addr(), want);
    }

    let (node, slot) = cluster.node_for_key(b"foo").unwrap();
    assert_eq!(slot, 12182);
    assert_eq!(slot, hash_slot(b"foo"));
    assert_eq!(node.addr(), b.addr_string());

    let (tagged, tagged_slot) = cluster.node_for_key(b"{foo}suffix").unwrap();
    assert_eq!(tagged_slot, 12182);
    assert_eq!(tagged.addr(), b.addr_string());

    assert_eq!(cluster.first_mapped_node().unwrap().addr(), a.addr_string());
    Ok(())
}

#[tokio::test]
async fn auth_secret_is_sent_before_commands() -> Result<()> {
    let (a, _b) = start_two_primaries(Some("sekrit")).await?;

    // Without the secret the nodes refuse to describe the topology.
    let unauthenticated = Cluster::new(0, &test_config(None));
    assert!(unauthenticated.fetch_configuration(&a.seed()).await.is_err());

    let cluster = Cluster::new(0, &test_config(Some("sekrit")));
    cluster.fetch_configuration(&a.seed()).await?;
    assert_eq!(cluster.node_count(), 2);
    for node in cluster.nodes() {
        assert!(node.borrow().connection.authenticated);
    }
    Ok(())
}

#[tokio::test]
async fn node_auth_succeeds_on_a_live_connection() -> Result<()> {
    let (a, _b) = start_two_primaries(Some("sekrit")).await?;
    let cluster = Cluster::new(0, &test_config(Some("sekrit")));
    cluster.fetch_configuration(&a.seed()).await?;

    let node = cluster.first_mapped_node().unwrap();
    node.authenticate("sekrit").await?;
    assert!(node.borrow().connection.authenticated);

    let err = node.authenticate("wrong").await.unwrap_err();
    assert!(err.to_string().contains("invalid password"));

    node.disconnect();
    assert!(node.borrow().connection.context.is_none());
    let err = node.authenticate("sekrit").await.unwrap_err();
    assert!(err.to_string().contains("no connection"));
    Ok(())
}

#[tokio::test]
async fn reconfiguration_parks_and_replays_requests() -> Result<()> {
    let (a, _b) = start_two_primaries(None).await?;
    let cluster = Cluster::new(0, &test_config(None));
    cluster.fetch_configuration(&a.seed()).await?;

    let node_a = cluster.node_for_slot(0).unwrap();
    let client = Client::new(7);

    let awaiting_reply = Request::new(&client, 1, "bar");
    let queued = Request::new(&client, 42, "foo");
    {
        let mut r = queued.borrow_mut();
        r.node = Some(node_a.clone());
        r.slot = hash_slot(b"foo") as i32;
        r.written = 17;
    }
    {
        let mut node = node_a.borrow_mut();
        node.connection
            .requests_pending
            .push_back(awaiting_reply.clone());
        node.connection.requests_to_send.push_back(queued.clone());
    }

    cluster.set_update_required(true);
    let mut replayed: Vec<(u64, u64)> = Vec::new();
    let status = cluster
        .update(&mut |req| {
            let r = req.borrow();
            replayed.push((r.client.id(), r.id));
        })
        .await;
    assert_eq!(status, ReconfigStatus::Wait);
    assert!(replayed.is_empty());
    assert!(cluster.is_updating());
    assert!(cluster.update_required());
    {
        let r = queued.borrow();
        assert!(r.need_reprocessing);
        assert!(r.node.is_none());
        assert_eq!(r.slot, -1);
        assert_eq!(r.written, 0);
    }

    // The pending reply arrives; the cluster is quiescent now.
    node_a.borrow_mut().connection.requests_pending.pop_front();

    let status = cluster
        .update(&mut |req| {
            let r = req.borrow();
            assert!(!r.need_reprocessing);
            assert!(r.node.is_none());
            assert_eq!(r.slot, -1);
            assert_eq!(r.written, 0);
            replayed.push((r.client.id(), r.id));
        })
        .await;
    assert_eq!(status, ReconfigStatus::Ended);
    assert_eq!(replayed, vec![(7, 42)]);
    assert_eq!(cluster.parked_request_count(), 0);
    assert!(client.borrow().requests_to_reprocess.is_empty());
    assert!(!cluster.is_updating());
    assert!(!cluster.update_required());

    // The topology was re-fetched and routing still works.
    assert_eq!(cluster.node_count(), 2);
    assert_eq!(
        cluster.node_for_slot(0).unwrap().addr(),
        a.addr_string()
    );
    Ok(())
}

#[tokio::test]
async fn reconfiguration_nulls_node_pointers_of_relatives() -> Result<()> {
    let (a, _b) = start_two_primaries(None).await?;
    let cluster = Cluster::new(0, &test_config(None));
    cluster.fetch_configuration(&a.seed()).await?;
    let node_a = cluster.node_for_slot(0).unwrap();

    let client = Client::new(9);
    let parent = Request::new(&client, 1, "k1");
    let child = Request::new(&client, 2, "k2");
    let sibling = Request::new(&client, 3, "k3");
    Request::link_child(&parent, &child);
    Request::link_child(&parent, &sibling);
    parent.borrow_mut().node = Some(node_a.clone());
    sibling.borrow_mut().node = Some(node_a.clone());

    cluster.add_request_to_reprocess(&child);
    drop(node_a);

    let status = cluster.update(&mut |_req| {}).await;
    assert_eq!(status, ReconfigStatus::Ended);
    assert!(parent.borrow().node.is_none());
    assert!(sibling.borrow().node.is_none());
    Ok(())
}

#[tokio::test]
async fn fetch_failure_during_update_breaks_the_cluster() -> Result<()> {
    let (a, b) = start_two_primaries(None).await?;
    let cluster = Cluster::new(0, &test_config(None));
    cluster.fetch_configuration(&a.seed()).await?;

    let client = Client::new(1);
    let parked = Request::new(&client, 5, "foo");
    cluster.add_request_to_reprocess(&parked);

    a.shut_down().await;
    b.shut_down().await;

    cluster.set_update_required(true);
    let mut replayed = 0usize;
    let status = cluster.update(&mut |_req| replayed += 1).await;
    assert_eq!(status, ReconfigStatus::Err);
    assert!(cluster.is_broken());
    // Broken cancels parked requests: they are not replayed.
    assert_eq!(replayed, 0);

    // Broken is sticky.
    let status = cluster.update(&mut |_req| {}).await;
    assert_eq!(status, ReconfigStatus::Err);
    Ok(())
}

#[tokio::test]
async fn reset_then_refetch_restores_the_same_mapping() -> Result<()> {
    let (a, _b) = start_two_primaries(None).await?;
    let cluster = Cluster::new(0, &test_config(None));
    cluster.fetch_configuration(&a.seed()).await?;

    let sample = [0u16, 4096, 8191, 8192, 12182, 16383];
    let before: Vec<String> = sample
        .iter()
        .map(|&slot| cluster.node_for_slot(slot).unwrap().addr())
        .collect();

    cluster.reset();
    assert_eq!(cluster.node_count(), 0);
    assert!(cluster.node_for_slot(0).is_none());

    cluster.fetch_configuration(&a.seed()).await?;
    let after: Vec<String> = sample
        .iter()
        .map(|&slot| cluster.node_for_slot(slot).unwrap().addr())
        .collect();
    assert_eq!(before, after);
    Ok(())
}

#[tokio::test]
async fn duplicated_cluster_routes_like_its_source_without_shared_state() -> Result<()> {
    let (a, _b) = start_two_primaries(None).await?;
    let cluster = Cluster::new(0, &test_config(None));
    cluster.fetch_configuration(&a.seed()).await?;

    let dup = cluster.duplicate()?;
    assert!(dup.is_duplicate());
    assert_eq!(dup.node_count(), cluster.node_count());

    for key in [&b"foo"[..], b"bar", b"hello", b"{user}:1"] {
        let (src, src_slot) = cluster.node_for_key(key).unwrap();
        let (copy, copy_slot) = dup.node_for_key(key).unwrap();
        assert_eq!(src_slot, copy_slot);
        assert_eq!(src.addr(), copy.addr());
        assert!(!NodeRef::ptr_eq(&src, &copy));
    }

    // A duplicate copies no connection state and its queues are private.
    let client = Client::new(3);
    let (copy, _) = dup.node_for_key(b"foo").unwrap();
    assert!(copy.borrow().connection.context.is_none());
    copy.borrow_mut()
        .connection
        .requests_to_send
        .push_back(Request::new(&client, 1, "foo"));
    let (src, _) = cluster.node_for_key(b"foo").unwrap();
    assert!(src.borrow().connection.requests_to_send.is_empty());

    // Freeing the source severs the duplicate but leaves it usable.
    drop(cluster);
    assert!(!dup.is_duplicate());
    for node in dup.nodes() {
        assert!(node.borrow().duplicated_from.is_none());
    }
    assert!(dup.node_for_key(b"foo").is_some());
    Ok(())
}
