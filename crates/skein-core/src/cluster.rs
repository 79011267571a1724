//! An in-process cluster: nodes on a shared [`LocalNetwork`] driven by a
//! membership service that numbers views from 1.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use skein_cluster::{Key, MembershipEvent, NodeId, TopologyId};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::ClusterConfig;
use crate::error::ConfigError;
use crate::node::Node;
use crate::rpc::LocalNetwork;

/// Numbers membership views and delivers them to every member.
///
/// A joining node first receives the view from before it joined, so it
/// knows who held the data it is about to pull.
#[derive(Debug, Default)]
pub struct MembershipService {
    last: Option<MembershipEvent>,
    feeds: BTreeMap<NodeId, mpsc::UnboundedSender<MembershipEvent>>,
}

impl MembershipService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_id(&self) -> TopologyId {
        self.last.as_ref().map_or(0, |e| e.topology_id)
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.feeds.keys().copied().collect()
    }

    /// Adds several nodes in a single view.
    pub fn bootstrap(
        &mut self,
        nodes: impl IntoIterator<Item = (NodeId, mpsc::UnboundedSender<MembershipEvent>)>,
    ) -> TopologyId {
        self.feeds.extend(nodes);
        self.publish()
    }

    pub fn join(&mut self, node: NodeId, feed: mpsc::UnboundedSender<MembershipEvent>) -> TopologyId {
        if let Some(previous) = &self.last {
            let _ = feed.send(previous.clone());
        }
        self.feeds.insert(node, feed);
        self.publish()
    }

    /// Removes a node, whether it left or crashed. Returns `None` if it was
    /// not a member.
    pub fn leave(&mut self, node: &NodeId) -> Option<TopologyId> {
        self.feeds.remove(node)?;
        Some(self.publish())
    }

    fn publish(&mut self) -> TopologyId {
        let event = MembershipEvent::new(self.current_id() + 1, self.members());
        info!(topology_id = event.topology_id, members = event.members.len(), "new membership view");
        // a closed feed belongs to a stopped node awaiting removal
        self.feeds.retain(|_, feed| feed.send(event.clone()).is_ok());
        let id = event.topology_id;
        self.last = Some(event);
        id
    }
}

/// A set of nodes on one [`LocalNetwork`].
#[derive(Debug)]
pub struct LocalCluster {
    config: ClusterConfig,
    network: LocalNetwork,
    membership: MembershipService,
    nodes: Vec<Arc<Node>>,
}

impl LocalCluster {
    /// Starts `size` nodes in a single initial view. Call
    /// [`await_stable`](Self::await_stable) before relying on the data
    /// placement.
    pub fn start(size: usize, config: ClusterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let network = LocalNetwork::new();
        let nodes = (0..size)
            .map(|_| Node::start(config.clone(), network.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut membership = MembershipService::new();
        if !nodes.is_empty() {
            membership.bootstrap(nodes.iter().map(|n| (n.id(), n.membership_feed())));
        }
        Ok(Self {
            config,
            network,
            membership,
            nodes,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn topology_id(&self) -> TopologyId {
        self.membership.current_id()
    }

    /// Running nodes, in the order they joined.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Arc<Node>> {
        self.nodes.get(index)
    }

    pub fn find(&self, id: &NodeId) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.id() == *id)
    }

    pub fn add_node(&mut self) -> Result<Arc<Node>, ConfigError> {
        let node = Node::start(self.config.clone(), self.network.clone())?;
        self.membership.join(node.id(), node.membership_feed());
        self.nodes.push(node.clone());
        Ok(node)
    }

    /// Crashes a node and removes it from the membership. Returns false if
    /// no such node was running.
    pub fn stop_node(&mut self, id: &NodeId) -> bool {
        let Some(pos) = self.nodes.iter().position(|n| n.id() == *id) else {
            return false;
        };
        let node = self.nodes.remove(pos);
        node.stop();
        self.membership.leave(id);
        true
    }

    /// Waits until every node runs the latest view and has no segment
    /// transfer in progress.
    pub async fn await_stable(&self, timeout: Duration) -> bool {
        let target = self.topology_id();
        let deadline = tokio::time::Instant::now() + timeout;
        for node in &self.nodes {
            let mut status = node.view().subscribe();
            let settled = tokio::time::timeout_at(
                deadline,
                status.wait_for(|s| s.topology_id >= target && s.is_stable()),
            )
            .await;
            if !matches!(settled, Ok(Ok(_))) {
                return false;
            }
        }
        true
    }

    /// A key whose primary owner is `node` in the current view.
    pub fn key_owned_by(&self, node: &NodeId) -> Option<Key> {
        let topology = self.nodes.first()?.view().topology();
        (0..100_000u32)
            .map(|i| Key::from(format!("key-{i}")))
            .find(|k| topology.primary_of(topology.segment_of(k)) == Some(*node))
    }
}
