//! Conntrack mark allocation
//!
//! Every gateway node taking part in NodePort routing gets a small integer
//! mark, unique among the marks currently assigned. Marks survive restarts
//! because they are encoded in the applied configurations: [`MarkAllocator::initialize`]
//! reads them back before the first assignment.

use crate::crd::{FirewallConfiguration, RouteConfiguration};
use crate::{Error, Result, NODE_NAME_LABEL};
use async_trait::async_trait;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::collections::{HashMap, HashSet};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// A mark found in already applied state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredMark {
    /// Node the mark was assigned to, if known
    pub owner: Option<String>,
    pub mark: u32,
}

/// Where [`MarkAllocator::initialize`] finds marks assigned by a previous run
#[async_trait]
pub trait MarkSource: Send + Sync {
    async fn restored_marks(&self) -> Result<Vec<RestoredMark>>;
}

#[async_trait]
impl MarkSource for Vec<RestoredMark> {
    async fn restored_marks(&self) -> Result<Vec<RestoredMark>> {
        Ok(self.clone())
    }
}

#[derive(Debug)]
struct MarkPool {
    in_use: HashSet<u32>,
    by_name: HashMap<String, u32>,
    /// Next candidate of the linear probe
    cursor: u32,
    max: u32,
    initialized: bool,
}

impl MarkPool {
    fn new(max: u32) -> Self {
        Self {
            in_use: HashSet::new(),
            by_name: HashMap::new(),
            cursor: 1,
            max: max.max(1),
            initialized: false,
        }
    }

    fn assign(&mut self, name: &str) -> Result<u32> {
        if let Some(mark) = self.by_name.get(name) {
            return Ok(*mark);
        }

        let max = u64::from(self.max);
        let start = u64::from(self.cursor) - 1;
        let mark = (0..max)
            .map(|offset| ((start + offset) % max + 1) as u32)
            .find(|candidate| !self.in_use.contains(candidate))
            .ok_or(Error::MarkPoolExhausted(self.max))?;

        self.in_use.insert(mark);
        self.by_name.insert(name.to_string(), mark);
        self.cursor = if mark == self.max { 1 } else { mark + 1 };
        info!(name, mark, "Assigned mark");
        Ok(mark)
    }

    fn free(&mut self, name: &str) -> Result<u32> {
        let mark = self
            .by_name
            .remove(name)
            .ok_or_else(|| Error::MarkNotFound(name.to_string()))?;
        self.in_use.remove(&mark);
        info!(name, mark, "Freed mark");
        Ok(mark)
    }

    fn restore(&mut self, restored: RestoredMark) {
        if restored.mark == 0 || restored.mark > self.max {
            warn!(mark = restored.mark, "Ignoring restored mark outside the pool");
            return;
        }
        self.in_use.insert(restored.mark);
        let Some(owner) = restored.owner else {
            return;
        };
        if let Some((holder, _)) = self
            .by_name
            .iter()
            .find(|(name, mark)| **mark == restored.mark && **name != owner)
        {
            warn!(
                mark = restored.mark,
                kept = %holder,
                ignored = %owner,
                "Restored mark claimed by several nodes"
            );
            return;
        }
        match self.by_name.get(&owner) {
            Some(existing) if *existing != restored.mark => {
                warn!(
                    owner = %owner,
                    kept = existing,
                    ignored = restored.mark,
                    "Node owns several restored marks"
                );
            }
            Some(_) => {}
            None => {
                self.by_name.insert(owner, restored.mark);
            }
        }
    }
}

/// Scoped access to the mark pool.
///
/// Holds the pool lock until dropped, so a sequence of assignments made
/// through one transaction is atomic with respect to other callers.
#[derive(Debug)]
pub struct MarkTransaction<'a> {
    pool: MutexGuard<'a, MarkPool>,
}

impl MarkTransaction<'_> {
    /// Mark of `name`, assigning a free one if it has none yet
    pub fn assign_mark(&mut self, name: &str) -> Result<u32> {
        self.pool.assign(name)
    }

    /// Release the mark of `name`, returning it
    pub fn free_mark(&mut self, name: &str) -> Result<u32> {
        self.pool.free(name)
    }

    pub fn mark_of(&self, name: &str) -> Option<u32> {
        self.pool.by_name.get(name).copied()
    }
}

/// Process-wide pool of conntrack marks in `[1, max]`
#[derive(Debug)]
pub struct MarkAllocator {
    pool: Mutex<MarkPool>,
}

impl Default for MarkAllocator {
    fn default() -> Self {
        Self::with_max(u32::MAX)
    }
}

impl MarkAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator handing out marks in `[1, max]`
    pub fn with_max(max: u32) -> Self {
        Self {
            pool: Mutex::new(MarkPool::new(max)),
        }
    }

    /// Reserve the marks recorded by `source`.
    ///
    /// Only the first successful call has an effect. On error the pool is
    /// left untouched and the call can be retried. Fails once marks were
    /// assigned on an uninitialized pool.
    pub async fn initialize(&self, source: &dyn MarkSource) -> Result<()> {
        let mut pool = self.pool.lock().await;
        if pool.initialized {
            debug!("Mark pool already initialized");
            return Ok(());
        }
        if !pool.in_use.is_empty() {
            return Err(Error::MarkPoolInUse(pool.in_use.len()));
        }

        let restored = source.restored_marks().await?;
        let count = restored.len();
        for mark in restored {
            pool.restore(mark);
        }
        pool.initialized = true;
        info!(restored = count, in_use = pool.in_use.len(), "Mark pool initialized");
        Ok(())
    }

    pub async fn transaction(&self) -> MarkTransaction<'_> {
        MarkTransaction {
            pool: self.pool.lock().await,
        }
    }

    pub async fn assign_mark(&self, name: &str) -> Result<u32> {
        self.transaction().await.assign_mark(name)
    }

    pub async fn free_mark(&self, name: &str) -> Result<u32> {
        self.transaction().await.free_mark(name)
    }

    pub async fn mark_of(&self, name: &str) -> Option<u32> {
        self.transaction().await.mark_of(name)
    }
}

/// Reads marks back from the applied RouteConfiguration and
/// FirewallConfiguration objects
#[derive(Clone)]
pub struct KubeMarkSource {
    client: Client,
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeMarkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeMarkSource")
            .field("client", &"<kube::Client>")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl KubeMarkSource {
    /// Source listing objects of `namespace`, or of every namespace
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

fn owner_of(obj: &impl ResourceExt) -> Option<String> {
    obj.labels().get(NODE_NAME_LABEL).cloned()
}

/// `fwmark` values of the rules of a route configuration
pub fn route_configuration_marks(cfg: &RouteConfiguration) -> Vec<RestoredMark> {
    let owner = owner_of(cfg);
    cfg.spec
        .table
        .rules
        .iter()
        .filter_map(|rule| rule.fwmark)
        .map(|mark| RestoredMark {
            owner: owner.clone(),
            mark,
        })
        .collect()
}

/// Marks set by the `ctmark` rules of a firewall configuration
pub fn firewall_configuration_marks(cfg: &FirewallConfiguration) -> Vec<RestoredMark> {
    // Firewall tables are shared between nodes, so the marks stay anonymous
    // unless the object is labelled with its node.
    let owner = owner_of(cfg);
    cfg.spec
        .table
        .chains
        .iter()
        .flat_map(|chain| chain.rules.iter())
        .filter_map(|rule| rule.ct_mark())
        .map(|mark| RestoredMark {
            owner: owner.clone(),
            mark,
        })
        .collect()
}

#[async_trait]
impl MarkSource for KubeMarkSource {
    async fn restored_marks(&self) -> Result<Vec<RestoredMark>> {
        let params = ListParams::default();
        let mut marks = Vec::new();

        let routes = self.api::<RouteConfiguration>().list(&params).await?;
        for cfg in &routes.items {
            marks.extend(route_configuration_marks(cfg));
        }

        let firewalls = self.api::<FirewallConfiguration>().list(&params).await?;
        for cfg in &firewalls.items {
            marks.extend(firewall_configuration_marks(cfg));
        }

        debug!(
            route_configurations = routes.items.len(),
            firewall_configurations = firewalls.items.len(),
            marks = marks.len(),
            "Collected applied marks"
        );
        Ok(marks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        Chain, ChainHook, FilterAction, FilterRule, FirewallConfigurationSpec, FirewallTable,
        RouteConfigurationSpec, Rule, Table,
    };
    use std::collections::BTreeMap;

    fn restored(owner: Option<&str>, mark: u32) -> RestoredMark {
        RestoredMark {
            owner: owner.map(str::to_string),
            mark,
        }
    }

    #[tokio::test]
    async fn test_assign_is_idempotent() {
        let allocator = MarkAllocator::new();
        let a = allocator.assign_mark("node-a").await.unwrap();
        let b = allocator.assign_mark("node-b").await.unwrap();

        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(allocator.assign_mark("node-a").await.unwrap(), a);
        assert_eq!(allocator.mark_of("node-b").await, Some(b));
    }

    #[tokio::test]
    async fn test_free_allows_reuse_after_wrap() {
        let allocator = MarkAllocator::with_max(3);
        for name in ["a", "b", "c"] {
            allocator.assign_mark(name).await.unwrap();
        }
        assert!(matches!(
            allocator.assign_mark("d").await,
            Err(Error::MarkPoolExhausted(3))
        ));

        assert_eq!(allocator.free_mark("b").await.unwrap(), 2);
        assert_eq!(allocator.assign_mark("d").await.unwrap(), 2);
        assert_eq!(allocator.mark_of("b").await, None);
    }

    #[tokio::test]
    async fn test_cursor_does_not_immediately_reuse() {
        let allocator = MarkAllocator::with_max(10);
        allocator.assign_mark("a").await.unwrap();
        allocator.free_mark("a").await.unwrap();
        // The probe continues from where it stopped.
        assert_eq!(allocator.assign_mark("b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_free_unknown_name() {
        let allocator = MarkAllocator::new();
        assert!(matches!(
            allocator.free_mark("ghost").await,
            Err(Error::MarkNotFound(name)) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_transaction_is_atomic() {
        let allocator = std::sync::Arc::new(MarkAllocator::new());
        let mut tx = allocator.transaction().await;
        let first = tx.assign_mark("a").unwrap();

        let other = {
            let allocator = allocator.clone();
            tokio::spawn(async move { allocator.assign_mark("b").await })
        };
        tokio::task::yield_now().await;
        assert!(!other.is_finished());

        let second = tx.assign_mark("c").unwrap();
        assert_eq!(second, first + 1);
        drop(tx);

        assert_eq!(other.await.unwrap().unwrap(), first + 2);
    }

    #[tokio::test]
    async fn test_initialize_restores_once() {
        let allocator = MarkAllocator::new();
        let source = vec![restored(Some("node-a"), 1), restored(None, 2)];

        allocator.initialize(&source).await.unwrap();
        allocator
            .initialize(&vec![restored(Some("node-z"), 3)])
            .await
            .unwrap();

        assert_eq!(allocator.mark_of("node-a").await, Some(1));
        assert_eq!(allocator.mark_of("node-z").await, None);
        assert_eq!(allocator.assign_mark("node-a").await.unwrap(), 1);
        // 2 is reserved without an owner
        assert_eq!(allocator.assign_mark("node-b").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_initialize_after_assign_is_rejected() {
        let allocator = MarkAllocator::new();
        allocator.assign_mark("node-a").await.unwrap();

        let source = vec![restored(Some("node-b"), 1)];
        assert!(matches!(
            allocator.initialize(&source).await,
            Err(Error::MarkPoolInUse(1))
        ));
        assert_eq!(allocator.mark_of("node-b").await, None);
        assert_eq!(allocator.assign_mark("node-b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restored_mark_keeps_single_owner() {
        let allocator = MarkAllocator::new();
        let source = vec![restored(Some("node-a"), 1), restored(Some("node-b"), 1)];
        allocator.initialize(&source).await.unwrap();

        assert_eq!(allocator.mark_of("node-a").await, Some(1));
        assert_eq!(allocator.mark_of("node-b").await, None);
        assert_eq!(allocator.assign_mark("node-b").await.unwrap(), 2);

        // Freeing the owner releases the mark for everyone
        assert_eq!(allocator.free_mark("node-a").await.unwrap(), 1);
        assert!(matches!(
            allocator.free_mark("node-a").await,
            Err(Error::MarkNotFound(_))
        ));
    }

    #[test]
    fn test_marks_from_configurations() {
        let mut route = RouteConfiguration::new(
            "nodeport-a",
            RouteConfigurationSpec {
                table: Table {
                    name: "nodeport-a".to_string(),
                    rules: vec![Rule {
                        fwmark: Some(7),
                        ..Default::default()
                    }],
                },
            },
        );
        route.metadata.labels = Some(BTreeMap::from([(
            NODE_NAME_LABEL.to_string(),
            "node-a".to_string(),
        )]));

        let firewall = FirewallConfiguration::new(
            "nodeport",
            FirewallConfigurationSpec {
                table: FirewallTable {
                    name: "nodeport".to_string(),
                    chains: vec![Chain {
                        name: "mark-to-conntrack".to_string(),
                        hook: ChainHook::Forward,
                        chain_type: Default::default(),
                        priority: 0,
                        policy: Default::default(),
                        rules: vec![
                            FilterRule {
                                name: "a".to_string(),
                                matches: vec![],
                                action: FilterAction::CtMark,
                                value: Some("0x7".to_string()),
                            },
                            FilterRule {
                                name: "restore".to_string(),
                                matches: vec![],
                                action: FilterAction::MetaMarkFromCtMark,
                                value: None,
                            },
                        ],
                    }],
                    ..Default::default()
                },
            },
        );

        assert_eq!(
            route_configuration_marks(&route),
            vec![restored(Some("node-a"), 7)]
        );
        assert_eq!(firewall_configuration_marks(&firewall), vec![restored(None, 7)]);
    }
}
