//! `CLUSTER NODES` parsing and topology fetch.
//!
//! The reply is a sequence of newline-terminated records with space-separated
//! fields; only the name, address, flags and primary-id fields plus the slot
//! specifiers from field 8 onward are interpreted here.

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, error};

use super::node::{auth_exchange, NodeRef, NodeTransport, SeedAddr};
use super::slots::SlotIndex;
use super::Cluster;
use crate::protocol::redis::{new_cluster_nodes_cmd, RespValue};

struct NodeRecord<'a> {
    name: &'a str,
    ip: String,
    port: u16,
    myself: bool,
    is_replica: bool,
    master_id: Option<&'a str>,
    slots: Option<&'a str>,
}

fn parse_record(line: &str) -> Result<NodeRecord<'_>> {
    let fields: Vec<&str> = line.splitn(9, ' ').collect();
    let flags = *fields
        .get(2)
        .ok_or_else(|| anyhow!("invalid CLUSTER NODES reply: missing flags"))?;
    let addr = *fields
        .get(1)
        .ok_or_else(|| anyhow!("invalid CLUSTER NODES reply: missing address"))?;

    // The cluster bus port suffix carries no routing information.
    let addr = addr.split_once('@').map(|(a, _)| a).unwrap_or(addr);
    let (ip, port_str) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid CLUSTER NODES reply: bad address {addr}"))?;
    let port = port_str
        .parse::<u16>()
        .with_context(|| format!("invalid node port in address {addr}"))?;

    let myself = flags.split(',').any(|flag| flag == "myself");
    let master_id = fields.get(3).copied().filter(|id| *id != "-");
    let is_replica = flags.split(',').any(|flag| flag == "slave") || master_id.is_some();

    Ok(NodeRecord {
        name: fields[0],
        ip: ip.to_string(),
        port,
        myself,
        is_replica,
        master_id,
        slots: fields.get(8).copied(),
    })
}

/// Ingest the slot specifiers of one record into the node and the cluster's
/// slot index. Ranges insert index entries at both endpoints only.
fn ingest_slot_specs(tail: &str, node: &NodeRef, slots_map: &mut SlotIndex) -> Result<()> {
    let mut owner = node.borrow_mut();
    for token in tail.split(' ') {
        if token.is_empty() {
            continue;
        }
        if let Some(body) = token.strip_prefix('[') {
            let body = body.strip_suffix(']').unwrap_or(body);
            if let Some((slot, peer)) = body.split_once("->-") {
                owner.migrating.push((slot.to_string(), peer.to_string()));
            } else if let Some((slot, peer)) = body.split_once("-<-") {
                owner.importing.push((slot.to_string(), peer.to_string()));
            }
            continue;
        }
        if let Some((start, stop)) = token.split_once('-') {
            let start = start
                .parse::<u16>()
                .with_context(|| format!("invalid slot range {token}"))?;
            let stop = stop
                .parse::<u16>()
                .with_context(|| format!("invalid slot range {token}"))?;
            slots_map.map_slot(start, node.clone());
            slots_map.map_slot(stop, node.clone());
            for slot in start..=stop {
                owner.slots.push(slot);
            }
        } else {
            let slot = token
                .parse::<u16>()
                .with_context(|| format!("invalid slot {token}"))?;
            owner.slots.push(slot);
            slots_map.map_slot(slot, node.clone());
        }
    }
    Ok(())
}

impl Cluster {
    /// Parse a `CLUSTER NODES` reply from `node`'s point of view.
    ///
    /// The record flagged `myself` updates `node` in place and its slot
    /// ownership lands in the slot index. Every other record becomes a fresh
    /// node appended to `friends` when a collector is supplied; without one
    /// the record is discarded, so a second pass against a friend only
    /// learns that friend's own slots.
    pub(crate) fn ingest_cluster_nodes(
        &self,
        text: &str,
        node: &NodeRef,
        mut friends: Option<&mut Vec<NodeRef>>,
    ) -> Result<()> {
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let record = parse_record(line)?;

            if !record.myself {
                if let Some(collector) = friends.as_deref_mut() {
                    collector.push(self.create_node(&record.ip, record.port));
                }
                continue;
            }

            {
                let mut this = node.borrow_mut();
                if this.name.is_none() && !record.name.is_empty() {
                    this.name = Some(record.name.to_string());
                }
                this.is_replica = record.is_replica;
                if this.replicate.is_none() {
                    this.replicate = record.master_id.map(str::to_string);
                }
            }
            if let Some(tail) = record.slots {
                let mut state = self.state.borrow_mut();
                ingest_slot_specs(tail, node, &mut state.slots_map)?;
            }
        }
        Ok(())
    }

    /// Load one node's view of the topology: connect (unless a transport is
    /// supplied), authenticate when a secret is configured, run
    /// `CLUSTER NODES` and ingest the reply.
    async fn load_node_info(
        &self,
        node: &NodeRef,
        friends: Option<&mut Vec<NodeRef>>,
        transport: Option<NodeTransport>,
    ) -> Result<()> {
        let addr = node.addr();
        let (auth, connect_timeout) = {
            let state = self.state.borrow();
            (state.auth.clone(), state.connect_timeout)
        };

        let mut transport = match transport {
            Some(transport) => transport,
            None => {
                let (ip, port) = {
                    let n = node.borrow();
                    (n.ip.clone(), n.port)
                };
                NodeTransport::connect_tcp(&ip, port, connect_timeout)
                    .await
                    .map_err(|err| {
                        error!(node = %addr, error = %err, "could not connect to node");
                        err
                    })?
            }
        };

        if let Some(secret) = auth.as_deref() {
            match auth_exchange(&mut transport, secret).await {
                Ok(()) => {
                    let mut n = node.borrow_mut();
                    n.connection.authenticated = true;
                    n.connection.authenticating = false;
                }
                // An unauthenticated node can still describe the topology;
                // commands against it will fail loudly later.
                Err(err) => {
                    error!(node = %addr, error = %err, "failed to authenticate to node");
                }
            }
        }

        let reply = transport
            .exchange(new_cluster_nodes_cmd())
            .await
            .with_context(|| format!("failed to retrieve cluster configuration from {addr}"))?;
        let text = match reply {
            RespValue::BulkString(data) | RespValue::SimpleString(data) => {
                String::from_utf8(data.to_vec())
                    .context("CLUSTER NODES reply is not valid UTF-8")?
            }
            RespValue::Error(msg) => {
                error!(node = %addr, error = %String::from_utf8_lossy(&msg), "node replied with error");
                bail!("cluster node {addr} replied with error");
            }
            other => bail!("unexpected CLUSTER NODES reply from {addr}: {other:?}"),
        };

        {
            let mut n = node.borrow_mut();
            n.connection.context = Some(transport);
            n.connection.connected = true;
        }
        self.ingest_cluster_nodes(&text, node, friends)
    }

    /// Discover the whole topology starting from a seed: load the seed's
    /// view with a friends collector, then load each friend's own view.
    /// Failure at any node is fatal to the fetch.
    pub async fn fetch_configuration(&self, seed: &SeedAddr) -> Result<()> {
        let connect_timeout = self.state.borrow().connect_timeout;
        debug!(seed = %seed, thread = self.thread_id(), "fetching cluster configuration");
        let transport = NodeTransport::connect(seed, connect_timeout)
            .await
            .map_err(|err| {
                error!(seed = %seed, error = %err, "could not connect to seed node");
                err
            })?;

        let first = {
            let (ip, port) = seed.node_endpoint();
            let node = self.create_node(&ip, port);
            self.state.borrow_mut().nodes.push(node.clone());
            node
        };

        let mut friends = Vec::new();
        self.load_node_info(&first, Some(&mut friends), Some(transport))
            .await?;

        for friend in friends {
            match self.load_node_info(&friend, None, None).await {
                Ok(()) => self.state.borrow_mut().nodes.push(friend),
                Err(err) => {
                    let addr = friend.addr();
                    error!(node = %addr, error = %err, "failed to load cluster node");
                    return Err(err.context(format!("failed to load cluster node {addr}")));
                }
            }
        }
        Ok(())
    }
}
