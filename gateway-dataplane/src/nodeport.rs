//! Return path routing for NodePort traffic
//!
//! Traffic forwarded from a gateway node's tunnel device gets that node's
//! mark stored in conntrack. Replies have the mark restored into the packet
//! mark, and a per-node policy table routes them back to the node they came
//! from.

use crate::crd::{
    Chain, ChainHook, ChainPolicy, ChainType, DevPosition, FilterAction, FilterRule,
    FirewallTable, Match, MatchDev, MatchOperation, Route, Rule, Table, TableFamily,
};
use crate::firewall::FirewallReconciler;
use crate::marks::MarkAllocator;
use crate::reconciler::NetworkStateReconciler;
use crate::Result;
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};

pub const MARK_TO_CONNTRACK_CHAIN: &str = "mark-to-conntrack";
pub const CONNTRACK_TO_META_CHAIN: &str = "conntrack-mark-to-meta-mark";
const RESTORE_RULE: &str = "restore-mark";
/// Mangle priority, so marks are set before routing decisions
const CHAIN_PRIORITY: i32 = -150;

/// A gateway node reachable over the fabric
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayNode {
    pub name: String,
    /// Tunnel device towards the node
    pub dev: String,
    /// Address of the node on the fabric network
    pub fabric_ip: IpAddr,
}

pub fn node_table_name(node: &str) -> String {
    format!("nodeport-{}", node)
}

/// Routing table sending packets marked `mark` back to `node`
pub fn forge_node_table(node: &GatewayNode, mark: u32) -> Table {
    Table {
        name: node_table_name(&node.name),
        rules: vec![Rule {
            fwmark: Some(mark),
            routes: vec![Route {
                gw: Some(node.fabric_ip.to_string()),
                dev: Some(node.dev.clone()),
                onlink: Some(true),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// Name of the rule tagging traffic from `node`. Carries everything the
/// rule matches on, so a changed device or mark yields a new rule.
pub fn tag_rule_name(node: &GatewayNode, mark: u32) -> String {
    format!("{}-{}-{}", node.name, node.dev, mark)
}

/// Firewall table tagging and restoring the marks of `nodes`
pub fn forge_firewall_table(name: &str, nodes: &[(GatewayNode, u32)]) -> FirewallTable {
    let tag_rules = nodes
        .iter()
        .map(|(node, mark)| FilterRule {
            name: tag_rule_name(node, *mark),
            matches: vec![Match {
                op: MatchOperation::Eq,
                ip: None,
                dev: Some(MatchDev {
                    value: node.dev.clone(),
                    position: DevPosition::In,
                }),
            }],
            action: FilterAction::CtMark,
            value: Some(mark.to_string()),
        })
        .collect();

    FirewallTable {
        name: name.to_string(),
        family: TableFamily::Inet,
        chains: vec![
            Chain {
                name: MARK_TO_CONNTRACK_CHAIN.to_string(),
                hook: ChainHook::Forward,
                chain_type: ChainType::Filter,
                priority: CHAIN_PRIORITY,
                policy: ChainPolicy::Accept,
                rules: tag_rules,
            },
            Chain {
                name: CONNTRACK_TO_META_CHAIN.to_string(),
                hook: ChainHook::Prerouting,
                chain_type: ChainType::Filter,
                priority: CHAIN_PRIORITY,
                policy: ChainPolicy::Accept,
                rules: vec![FilterRule {
                    name: RESTORE_RULE.to_string(),
                    matches: vec![],
                    action: FilterAction::MetaMarkFromCtMark,
                    value: None,
                }],
            },
        ],
    }
}

/// Keeps the NodePort tables and marks in line with the set of gateway nodes
pub struct NodePortRouting {
    marks: Arc<MarkAllocator>,
    routes: Arc<NetworkStateReconciler>,
    firewall: Arc<FirewallReconciler>,
    firewall_table: String,
    /// Nodes applied so far, by name; the lock serializes passes
    nodes: Mutex<BTreeMap<String, GatewayNode>>,
}

impl std::fmt::Debug for NodePortRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePortRouting")
            .field("firewall_table", &self.firewall_table)
            .field("nodes", &self.nodes)
            .finish()
    }
}

impl NodePortRouting {
    pub fn new(
        marks: Arc<MarkAllocator>,
        routes: Arc<NetworkStateReconciler>,
        firewall: Arc<FirewallReconciler>,
        firewall_table: impl Into<String>,
    ) -> Self {
        Self {
            marks,
            routes,
            firewall,
            firewall_table: firewall_table.into(),
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Make `nodes` the complete set of routed gateway nodes.
    ///
    /// Nodes applied by an earlier call and missing from `nodes` are
    /// removed.
    #[instrument(skip_all, fields(nodes = nodes.len()))]
    pub async fn apply(&self, nodes: &[GatewayNode]) -> Result<()> {
        let mut applied = self.nodes.lock().await;

        let stale: Vec<String> = applied
            .keys()
            .filter(|name| !nodes.iter().any(|n| &n.name == *name))
            .cloned()
            .collect();
        for name in stale {
            self.remove_node_state(&name).await?;
            applied.remove(&name);
        }

        let marked = {
            let mut tx = self.marks.transaction().await;
            nodes
                .iter()
                .map(|node| Ok((node.clone(), tx.assign_mark(&node.name)?)))
                .collect::<Result<Vec<_>>>()?
        };
        // Tracked as soon as they hold a mark, so a failed pass is cleaned
        // up by the next one
        for node in nodes {
            applied.insert(node.name.clone(), node.clone());
        }

        let tables: Vec<Table> = marked
            .iter()
            .map(|(node, mark)| forge_node_table(node, *mark))
            .collect();
        // Distinct tables, safe to converge concurrently
        try_join_all(tables.iter().map(|t| self.routes.reconcile_table(t))).await?;

        self.firewall
            .reconcile(&forge_firewall_table(&self.firewall_table, &marked))
            .await?;

        info!(nodes = applied.len(), "NodePort routing applied");
        Ok(())
    }

    /// Stop routing `node`: delete its table, free its mark and drop its
    /// firewall rule
    #[instrument(skip(self))]
    pub async fn remove(&self, node: &str) -> Result<()> {
        let mut applied = self.nodes.lock().await;
        self.remove_node_state(node).await?;
        applied.remove(node);

        let tx = self.marks.transaction().await;
        let remaining: Vec<(GatewayNode, u32)> = applied
            .values()
            .filter_map(|n| tx.mark_of(&n.name).map(|mark| (n.clone(), mark)))
            .collect();
        drop(tx);

        self.firewall
            .reconcile(&forge_firewall_table(&self.firewall_table, &remaining))
            .await?;
        Ok(())
    }

    async fn remove_node_state(&self, node: &str) -> Result<()> {
        let table = Table {
            name: node_table_name(node),
            rules: vec![],
        };
        self.routes.remove_table(&table).await?;

        let mut tx = self.marks.transaction().await;
        if tx.mark_of(node).is_some() {
            tx.free_mark(node)?;
        }
        info!(node, "NodePort routing removed");
        Ok(())
    }

    /// Delete the shared firewall table
    pub async fn remove_firewall(&self) -> Result<()> {
        let table = FirewallTable {
            name: self.firewall_table.clone(),
            ..Default::default()
        };
        self.firewall.remove(&table).await
    }
}
