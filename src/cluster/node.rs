use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use super::SLOT_COUNT;
use crate::protocol::redis::{new_auth_cmd, RespCodec, RespValue};
use crate::request::Request;

/// Keep-alive probing interval for node sockets. Short enough that a dead
/// peer is noticed while a long-running command is still in flight.
const NODE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Hook fired before a node's transport is released, so the event loop can
/// unregister its handlers. The hook receives the node itself and must not
/// reach back through the shared handle.
pub type DisconnectHook = Rc<dyn Fn(&Node)>;

/// Address of a node used to seed a topology fetch.
#[derive(Debug, Clone)]
pub enum SeedAddr {
    Tcp { ip: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

impl SeedAddr {
    /// The `(ip, port)` recorded on the node created for this seed.
    pub(crate) fn node_endpoint(&self) -> (String, u16) {
        match self {
            SeedAddr::Tcp { ip, port } => (ip.clone(), *port),
            #[cfg(unix)]
            SeedAddr::Unix(path) => (path.display().to_string(), 0),
        }
    }
}

impl fmt::Display for SeedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedAddr::Tcp { ip, port } => write!(f, "{ip}:{port}"),
            #[cfg(unix)]
            SeedAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Framed stream to a cluster node.
pub enum NodeTransport {
    Tcp(Framed<TcpStream, RespCodec>),
    #[cfg(unix)]
    Unix(Framed<UnixStream, RespCodec>),
}

impl NodeTransport {
    pub async fn connect(seed: &SeedAddr, connect_timeout: Duration) -> Result<NodeTransport> {
        match seed {
            SeedAddr::Tcp { ip, port } => Self::connect_tcp(ip, *port, connect_timeout).await,
            #[cfg(unix)]
            SeedAddr::Unix(path) => {
                let stream = timeout(connect_timeout, UnixStream::connect(path))
                    .await
                    .with_context(|| format!("connect to {} timed out", path.display()))??;
                Ok(NodeTransport::Unix(Framed::new(stream, RespCodec)))
            }
        }
    }

    pub async fn connect_tcp(ip: &str, port: u16, connect_timeout: Duration) -> Result<NodeTransport> {
        let addr = format!("{ip}:{port}");
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .with_context(|| format!("connect to {addr} timed out"))??;
        #[cfg(any(unix, windows))]
        {
            use socket2::{SockRef, TcpKeepalive};
            let keepalive = TcpKeepalive::new()
                .with_time(NODE_KEEPALIVE_INTERVAL)
                .with_interval(NODE_KEEPALIVE_INTERVAL);
            if let Err(err) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                warn!(node = %addr, error = %err, "failed to set TCP keepalive");
            }
        }
        Ok(NodeTransport::Tcp(Framed::new(stream, RespCodec)))
    }

    /// Send one command and wait for its reply.
    pub async fn exchange(&mut self, cmd: RespValue) -> Result<RespValue> {
        match self {
            NodeTransport::Tcp(framed) => exchange_on(framed, cmd).await,
            #[cfg(unix)]
            NodeTransport::Unix(framed) => exchange_on(framed, cmd).await,
        }
    }
}

async fn exchange_on<S>(framed: &mut Framed<S, RespCodec>, cmd: RespValue) -> Result<RespValue>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(cmd).await?;
    match framed.next().await {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(err)) => Err(err),
        None => Err(anyhow!("node closed the connection")),
    }
}

/// Issue `AUTH <secret>` on an open transport. An error reply surfaces the
/// server's message verbatim.
pub(crate) async fn auth_exchange(transport: &mut NodeTransport, secret: &str) -> Result<()> {
    let reply = transport.exchange(new_auth_cmd(secret)).await?;
    match reply {
        RespValue::Error(msg) => bail!("{}", String::from_utf8_lossy(&msg)),
        _ => Ok(()),
    }
}

/// Outbound connection state of a node.
///
/// Requests only ever move pending <- to_send <- (external); the two queues
/// preserve arrival order.
pub struct Connection {
    pub context: Option<NodeTransport>,
    pub connected: bool,
    pub authenticating: bool,
    pub authenticated: bool,
    pub has_read_handler: bool,
    /// Sent to the node, awaiting a reply.
    pub requests_pending: VecDeque<Request>,
    /// Queued for writing; the front may be mid-write.
    pub requests_to_send: VecDeque<Request>,
}

impl Connection {
    fn new() -> Connection {
        Connection {
            context: None,
            connected: false,
            authenticating: false,
            authenticated: false,
            has_read_handler: false,
            requests_pending: VecDeque::new(),
            requests_to_send: VecDeque::new(),
        }
    }
}

/// Per-server record: identity, role, owned slots and the outbound
/// connection. Created by the topology parser or by cluster duplication,
/// destroyed only through the owning cluster.
pub struct Node {
    pub ip: String,
    pub port: u16,
    /// Stable cluster-assigned name; unknown until the node's own record has
    /// been parsed.
    pub name: Option<String>,
    pub is_replica: bool,
    /// Name of the primary this node replicates, if any.
    pub replicate: Option<String>,
    /// Owned slots, in announcement order.
    pub slots: Vec<u16>,
    /// `(slot, destination-name)` pairs this node is handing off.
    pub migrating: Vec<(String, String)>,
    /// `(slot, source-name)` pairs this node is receiving.
    pub importing: Vec<(String, String)>,
    pub connection: Connection,
    /// Source node when this record was produced by cluster duplication;
    /// severed when the source cluster is freed.
    pub duplicated_from: Option<WeakNodeRef>,
    on_disconnect: Option<DisconnectHook>,
}

impl Node {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    fn fire_disconnect_hook(&self) {
        if let Some(hook) = &self.on_disconnect {
            hook(self);
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.connection.context.is_some() {
            if let Some(hook) = self.on_disconnect.clone() {
                hook(self);
            }
            self.connection.context = None;
        }
    }
}

/// Shared handle to a node owned by a cluster.
#[derive(Clone)]
pub struct NodeRef {
    inner: Rc<RefCell<Node>>,
}

impl NodeRef {
    pub(crate) fn new(
        ip: impl Into<String>,
        port: u16,
        on_disconnect: Option<DisconnectHook>,
    ) -> NodeRef {
        NodeRef {
            inner: Rc::new(RefCell::new(Node {
                ip: ip.into(),
                port,
                name: None,
                is_replica: false,
                replicate: None,
                slots: Vec::with_capacity(SLOT_COUNT),
                migrating: Vec::new(),
                importing: Vec::new(),
                connection: Connection::new(),
                duplicated_from: None,
                on_disconnect,
            })),
        }
    }

    pub fn borrow(&self) -> Ref<'_, Node> {
        self.inner.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Node> {
        self.inner.borrow_mut()
    }

    pub fn downgrade(&self) -> WeakNodeRef {
        WeakNodeRef {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(a: &NodeRef, b: &NodeRef) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn addr(&self) -> String {
        self.borrow().addr()
    }

    /// Open a fresh connection to the node, tearing down any prior transport
    /// first. On failure the node keeps no transport and stays usable for a
    /// later retry.
    pub async fn connect(&self, connect_timeout: Duration) -> Result<()> {
        self.disconnect();
        let (ip, port) = {
            let node = self.borrow();
            (node.ip.clone(), node.port)
        };
        let addr = format!("{ip}:{port}");
        debug!(node = %addr, "connecting to node");
        let transport = NodeTransport::connect_tcp(&ip, port, connect_timeout)
            .await
            .map_err(|err| {
                error!(node = %addr, error = %err, "could not connect to node");
                err
            })?;
        let mut node = self.borrow_mut();
        node.connection.context = Some(transport);
        node.connection.connected = true;
        Ok(())
    }

    /// Release the transport if one exists, firing the disconnect hook
    /// first. Queues are preserved.
    pub fn disconnect(&self) {
        let mut node = self.borrow_mut();
        if node.connection.context.is_none() {
            return;
        }
        debug!(node = %node.addr(), "disconnecting from node");
        node.fire_disconnect_hook();
        node.connection.context = None;
        node.connection.connected = false;
    }

    /// Authenticate against the node on its current transport. The server's
    /// error message is preserved in the returned error.
    pub async fn authenticate(&self, secret: &str) -> Result<()> {
        let addr = self.addr();
        debug!(node = %addr, "authenticating to node");
        let mut transport = match self.borrow_mut().connection.context.take() {
            Some(transport) => transport,
            None => bail!("AUTH failed: no connection"),
        };
        let outcome = auth_exchange(&mut transport, secret).await;
        let mut node = self.borrow_mut();
        node.connection.context = Some(transport);
        match outcome {
            Ok(()) => {
                node.connection.authenticating = false;
                node.connection.authenticated = true;
                Ok(())
            }
            Err(err) => {
                error!(node = %addr, error = %err, "failed to authenticate to node");
                Err(err)
            }
        }
    }
}

#[derive(Clone)]
pub struct WeakNodeRef {
    inner: Weak<RefCell<Node>>,
}

impl WeakNodeRef {
    pub fn upgrade(&self) -> Option<NodeRef> {
        self.inner.upgrade().map(|inner| NodeRef { inner })
    }
}

/// Deep copy of a node for cluster duplication: identity, role and slot
/// bookkeeping are copied, the connection starts fresh and unconnected.
pub(crate) fn duplicate_node(source: &NodeRef, hook: Option<DisconnectHook>) -> NodeRef {
    let src = source.borrow();
    let node = NodeRef::new(src.ip.clone(), src.port, hook);
    {
        let mut copy = node.borrow_mut();
        copy.name = src.name.clone();
        copy.is_replica = src.is_replica;
        copy.replicate = src.replicate.clone();
        copy.slots.extend_from_slice(&src.slots);
        copy.migrating = src.migrating.clone();
        copy.importing = src.importing.clone();
        copy.duplicated_from = Some(source.downgrade());
    }
    node
}
