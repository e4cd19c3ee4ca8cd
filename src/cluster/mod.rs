//! The per-worker cluster view: node list, slot index, reprocess queue and
//! the reconfiguration controller.
//!
//! A `Cluster` and everything it owns is accessed by exactly one worker
//! thread; handles are `Rc`-based and nothing here takes a lock. The only
//! cross-cluster writes are the duplication back-links, severed when a
//! source cluster is freed.

pub mod node;
pub mod slots;
mod topology;

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use tracing::{debug, error};

use crate::config::ClusterConfig;
use crate::request::{Request, SLOT_UNASSIGNED};
use crate::utils::hash_slot;

pub use node::{
    Connection, DisconnectHook, Node, NodeRef, NodeTransport, SeedAddr, WeakNodeRef,
};
pub use slots::SlotIndex;

/// Number of hash slots partitioning the key space.
pub const SLOT_COUNT: usize = 16384;

/// Outcome of a reconfiguration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigStatus {
    /// In-flight requests still pending or mid-write; retry later.
    Wait,
    /// Reconfiguration has started.
    Started,
    /// Reconfiguration finished and parked requests were replayed.
    Ended,
    /// Reconfiguration failed; the cluster is now broken.
    Err,
}

pub(crate) struct ClusterState {
    thread_id: usize,
    auth: Option<String>,
    connect_timeout: Duration,
    pub(crate) nodes: Vec<NodeRef>,
    pub(crate) slots_map: SlotIndex,
    requests_to_reprocess: BTreeMap<String, Request>,
    is_updating: bool,
    update_required: bool,
    broken: bool,
    duplicated_from: Option<Weak<RefCell<ClusterState>>>,
    duplicates: Vec<Weak<RefCell<ClusterState>>>,
    on_node_disconnect: Option<DisconnectHook>,
}

impl Drop for ClusterState {
    fn drop(&mut self) {
        debug!(thread = self.thread_id, "freeing cluster");
        // Sever every duplicate: their back-links would otherwise point at a
        // freed source. The duplicates themselves stay valid.
        for duplicate in &self.duplicates {
            if let Some(duplicate) = duplicate.upgrade() {
                let mut dup = duplicate.borrow_mut();
                dup.duplicated_from = None;
                for node in &dup.nodes {
                    node.borrow_mut().duplicated_from = None;
                }
            }
        }
        if let Some(parent) = self.duplicated_from.as_ref().and_then(Weak::upgrade) {
            parent
                .borrow_mut()
                .duplicates
                .retain(|dup| dup.upgrade().is_some());
        }
    }
}

/// Shared handle to a worker's cluster view.
#[derive(Clone)]
pub struct Cluster {
    pub(crate) state: Rc<RefCell<ClusterState>>,
}

impl Cluster {
    pub fn new(thread_id: usize, config: &ClusterConfig) -> Cluster {
        Cluster::with_settings(
            thread_id,
            config.auth.clone(),
            config.connect_timeout(),
            None,
        )
    }

    fn with_settings(
        thread_id: usize,
        auth: Option<String>,
        connect_timeout: Duration,
        on_node_disconnect: Option<DisconnectHook>,
    ) -> Cluster {
        Cluster {
            state: Rc::new(RefCell::new(ClusterState {
                thread_id,
                auth,
                connect_timeout,
                nodes: Vec::new(),
                slots_map: SlotIndex::default(),
                requests_to_reprocess: BTreeMap::new(),
                is_updating: false,
                update_required: false,
                broken: false,
                duplicated_from: None,
                duplicates: Vec::new(),
                on_node_disconnect,
            })),
        }
    }

    /// Install the hook fired before any node transport is released. Must be
    /// installed before the first topology fetch so every node carries it.
    pub fn set_disconnect_hook(&self, hook: DisconnectHook) {
        self.state.borrow_mut().on_node_disconnect = Some(hook);
    }

    pub fn thread_id(&self) -> usize {
        self.state.borrow().thread_id
    }

    pub fn is_broken(&self) -> bool {
        self.state.borrow().broken
    }

    pub fn is_updating(&self) -> bool {
        self.state.borrow().is_updating
    }

    pub fn update_required(&self) -> bool {
        self.state.borrow().update_required
    }

    /// Arm the reconfiguration controller; the worker calls [`update`] at
    /// its next safe point.
    ///
    /// [`update`]: Cluster::update
    pub fn set_update_required(&self, required: bool) {
        self.state.borrow_mut().update_required = required;
    }

    pub fn node_count(&self) -> usize {
        self.state.borrow().nodes.len()
    }

    pub fn nodes(&self) -> Vec<NodeRef> {
        self.state.borrow().nodes.clone()
    }

    pub fn parked_request_count(&self) -> usize {
        self.state.borrow().requests_to_reprocess.len()
    }

    /// True while this cluster is a duplicate whose source is still alive.
    pub fn is_duplicate(&self) -> bool {
        self.state.borrow().duplicated_from.is_some()
    }

    pub fn duplicate_count(&self) -> usize {
        self.state.borrow().duplicates.len()
    }

    pub(crate) fn create_node(&self, ip: &str, port: u16) -> NodeRef {
        let hook = self.state.borrow().on_node_disconnect.clone();
        NodeRef::new(ip, port, hook)
    }

    /// Owning node for `slot`, if the slot is assigned.
    pub fn node_for_slot(&self, slot: u16) -> Option<NodeRef> {
        self.state.borrow().slots_map.node_for_slot(slot)
    }

    /// Route a key: its hash slot plus the owning node.
    pub fn node_for_key(&self, key: &[u8]) -> Option<(NodeRef, u16)> {
        let slot = hash_slot(key);
        self.node_for_slot(slot).map(|node| (node, slot))
    }

    /// Node of the smallest mapped slot; the reconfiguration controller's
    /// contact of last resort.
    pub fn first_mapped_node(&self) -> Option<NodeRef> {
        self.state.borrow().slots_map.first_node()
    }

    /// Drop the slot index and every node (closing connections through the
    /// disconnect hook). The reprocess queue and duplication links survive.
    pub fn reset(&self) {
        let mut state = self.state.borrow_mut();
        state.slots_map.clear();
        state.nodes.clear();
    }

    /// Park a request for replay after the next reconfiguration: its routing
    /// state is wiped and it is indexed by `"<client>:<request>"` both here
    /// and on its client. A broken cluster accepts no new work.
    pub fn add_request_to_reprocess(&self, req: &Request) {
        let mut state = self.state.borrow_mut();
        if state.broken {
            debug!(thread = state.thread_id, "broken cluster refuses new request");
            return;
        }
        park_request(&mut state, req);
    }

    /// Reverse the reprocess indexing for a request (the client list entry is
    /// left to the request layer's own cleanup).
    pub fn remove_request_to_reprocess(&self, req: &Request) {
        req.borrow_mut().need_reprocessing = false;
        let key = req.reprocess_key();
        self.state.borrow_mut().requests_to_reprocess.remove(&key);
    }

    /// Deep-copy this cluster into a sibling for the same worker.
    ///
    /// Node copies share no runtime state with their sources; every copy's
    /// connection starts fresh and unconnected. The slot index is rebuilt by
    /// resolving each entry's node through its cluster-assigned name, so a
    /// source node without a name is a fatal error.
    pub fn duplicate(&self) -> Result<Cluster> {
        let copy = {
            let state = self.state.borrow();
            Cluster::with_settings(
                state.thread_id,
                state.auth.clone(),
                state.connect_timeout,
                state.on_node_disconnect.clone(),
            )
        };
        copy.state.borrow_mut().duplicated_from = Some(Rc::downgrade(&self.state));

        {
            let state = self.state.borrow();
            let mut copy_state = copy.state.borrow_mut();

            let mut nodes_by_name: HashMap<String, NodeRef> =
                HashMap::with_capacity(state.nodes.len());
            for source in &state.nodes {
                let node = node::duplicate_node(source, state.on_node_disconnect.clone());
                if let Some(name) = node.borrow().name.clone() {
                    nodes_by_name.insert(name, node.clone());
                }
                copy_state.nodes.push(node);
            }

            for (key, source) in state.slots_map.iter() {
                let name = source.borrow().name.clone().ok_or_else(|| {
                    anyhow!("cannot duplicate cluster: node {} has no name", source.addr())
                })?;
                let node = nodes_by_name
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| anyhow!("cannot duplicate cluster: no copy of node {name}"))?;
                copy_state.slots_map.insert_key(*key, node);
            }
        }

        self.state
            .borrow_mut()
            .duplicates
            .push(Rc::downgrade(&copy.state));
        Ok(copy)
    }

    /// Reconfigure the cluster once it is quiescent.
    ///
    /// Requests already queued but not yet being written are parked for
    /// replay immediately; requests awaiting a reply or mid-write must drain
    /// first, in which case [`ReconfigStatus::Wait`] asks the worker to
    /// retry. Once quiescent the routing state is reset, the topology is
    /// re-fetched from the first primary remembered during the drain walk,
    /// and every parked request is handed back to `process_request` exactly
    /// once with no pre-bound node. Any failure marks the cluster broken.
    pub async fn update(&self, process_request: &mut dyn FnMut(Request)) -> ReconfigStatus {
        let contact = {
            let mut state = self.state.borrow_mut();
            if state.broken {
                return ReconfigStatus::Err;
            }

            let mut requests_to_wait = 0usize;
            let mut contact: Option<(String, u16)> = None;
            let nodes = state.nodes.clone();
            for node_ref in &nodes {
                let mut node = node_ref.borrow_mut();
                if node.is_replica {
                    continue;
                }
                if contact.is_none() {
                    contact = Some((node.ip.clone(), node.port));
                }
                let conn = &mut node.connection;
                requests_to_wait += conn.requests_pending.len();

                // Requests not yet being written are cheap to re-route and
                // are diverted on this first pass; a request with a write
                // handler is mid-write and must finish on its socket.
                let mut still_writing = VecDeque::with_capacity(conn.requests_to_send.len());
                while let Some(req) = conn.requests_to_send.pop_front() {
                    if req.borrow().has_write_handler {
                        requests_to_wait += 1;
                        still_writing.push_back(req);
                    } else {
                        park_request(&mut state, &req);
                    }
                }
                conn.requests_to_send = still_writing;
            }

            debug!(
                thread = state.thread_id,
                waiting = requests_to_wait,
                "cluster reconfiguration: checking in-flight requests"
            );
            state.is_updating = true;
            if requests_to_wait > 0 {
                return ReconfigStatus::Wait;
            }

            contact.or_else(|| {
                state.slots_map.first_node().map(|node| {
                    let node = node.borrow();
                    (node.ip.clone(), node.port)
                })
            })
        };

        let contact = match contact {
            Some((ip, port)) => SeedAddr::Tcp { ip, port },
            None => {
                error!(
                    thread = self.thread_id(),
                    "no surviving node to refetch the configuration from"
                );
                self.state.borrow_mut().broken = true;
                return ReconfigStatus::Err;
            }
        };

        debug!(thread = self.thread_id(), node = %contact, "reconfiguring cluster");
        self.reset();
        if let Err(err) = self.fetch_configuration(&contact).await {
            error!(
                thread = self.thread_id(),
                error = %err,
                "failed to fetch cluster configuration"
            );
            self.state.borrow_mut().broken = true;
            return ReconfigStatus::Err;
        }

        debug!(thread = self.thread_id(), "reprocessing parked requests");
        loop {
            // Popping the smallest key is the erase-then-reseek iteration:
            // safe under the mutations done by the request processor.
            let req = match self.state.borrow_mut().requests_to_reprocess.pop_first() {
                Some((_, req)) => req,
                None => break,
            };
            req.borrow_mut().need_reprocessing = false;

            let client = req.borrow().client.clone();
            client
                .borrow_mut()
                .requests_to_reprocess
                .retain(|other| !Request::ptr_eq(other, &req));

            // Relatives of the request (parent, siblings, children) may still
            // point at nodes freed by the reset; null them all.
            let mut relatives: Vec<Request> = Vec::new();
            let parent = {
                let r = req.borrow();
                if !r.children.is_empty() {
                    relatives = r.children.clone();
                    None
                } else {
                    r.parent.as_ref().and_then(|weak| weak.upgrade())
                }
            };
            if let Some(parent) = parent {
                parent.borrow_mut().node = None;
                relatives = parent.borrow().children.clone();
            }
            for relative in &relatives {
                relative.borrow_mut().node = None;
            }

            process_request(req);
        }

        {
            let mut state = self.state.borrow_mut();
            state.is_updating = false;
            state.update_required = false;
        }
        debug!(thread = self.thread_id(), "cluster reconfiguration ended");
        ReconfigStatus::Ended
    }
}

fn park_request(state: &mut ClusterState, req: &Request) {
    {
        let mut r = req.borrow_mut();
        r.need_reprocessing = true;
        r.node = None;
        r.slot = SLOT_UNASSIGNED;
        r.written = 0;
    }
    let key = req.reprocess_key();
    let client = req.borrow().client.clone();
    client.borrow_mut().requests_to_reprocess.push(req.clone());
    state.requests_to_reprocess.insert(key, req.clone());
}
