//! nftables chains from a desired [`FirewallTable`]
//!
//! Chains are compared by name and definition (hook, type, priority,
//! policy). Rules are identified by their name only, stored in the nft rule
//! comment: a rule whose content changed under the same name is left as is.

mod memory;
mod nft;

pub use memory::MemoryNftHandle;
pub use nft::NftCommand;

use crate::crd::{Chain, ChainHook, ChainPolicy, ChainType, FilterAction, FilterRule, FirewallTable, TableFamily};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A chain as listed from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    pub name: String,
    /// None for regular (non base) chains
    pub hook: Option<ChainHook>,
    pub chain_type: Option<ChainType>,
    pub priority: Option<i32>,
    pub policy: Option<ChainPolicy>,
    pub rules: Vec<RuleState>,
}

/// A rule as listed from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleState {
    pub handle: u64,
    /// Rule comment, carrying the rule name for rules added by this crate
    pub name: Option<String>,
}

impl ChainState {
    /// Empty chain with the definition of `chain`
    pub fn from_desired(chain: &Chain) -> Self {
        Self {
            name: chain.name.clone(),
            hook: Some(chain.hook),
            chain_type: Some(chain.chain_type),
            priority: Some(chain.priority),
            policy: Some(chain.policy),
            rules: Vec::new(),
        }
    }

    pub fn same_definition(&self, chain: &Chain) -> bool {
        self.hook == Some(chain.hook)
            && self.chain_type == Some(chain.chain_type)
            && self.priority == Some(chain.priority)
            && self.policy == Some(chain.policy)
    }
}

/// Access to the nftables ruleset
#[async_trait]
pub trait NftHandle: Send + Sync {
    /// Create the table if missing
    async fn ensure_table(&self, family: TableFamily, table: &str) -> Result<()>;

    /// Delete the table with its chains. Missing tables are not an error.
    async fn delete_table(&self, family: TableFamily, table: &str) -> Result<()>;

    async fn list_chains(&self, family: TableFamily, table: &str) -> Result<Vec<ChainState>>;

    async fn add_chain(&self, family: TableFamily, table: &str, chain: &Chain) -> Result<()>;

    /// Delete a chain and the rules it holds
    async fn delete_chain(&self, family: TableFamily, table: &str, chain: &str) -> Result<()>;

    async fn add_rule(
        &self,
        family: TableFamily,
        table: &str,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<()>;

    async fn delete_rule(
        &self,
        family: TableFamily,
        table: &str,
        chain: &str,
        handle: u64,
    ) -> Result<()>;
}

/// Mutations performed by one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirewallStats {
    pub chains_added: usize,
    pub chains_deleted: usize,
    pub chains_recreated: usize,
    pub rules_added: usize,
    pub rules_deleted: usize,
}

impl FirewallStats {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Reject tables the kernel could not represent unambiguously
pub fn validate(table: &FirewallTable) -> Result<()> {
    if table.name.is_empty() {
        return Err(Error::InvalidSpec("firewall table without name".to_string()));
    }
    let mut chains = HashSet::new();
    for chain in &table.chains {
        if !chains.insert(chain.name.as_str()) {
            return Err(Error::InvalidSpec(format!(
                "duplicate chain {} in table {}",
                chain.name, table.name
            )));
        }
        let mut names = HashSet::new();
        for rule in &chain.rules {
            if rule.name.is_empty() {
                return Err(Error::InvalidSpec(format!(
                    "rule without name in chain {}",
                    chain.name
                )));
            }
            if !names.insert(rule.name.as_str()) {
                return Err(Error::InvalidSpec(format!(
                    "duplicate rule {} in chain {}",
                    rule.name, chain.name
                )));
            }
            if rule.action == FilterAction::CtMark && rule.ct_mark().is_none() {
                return Err(Error::InvalidSpec(format!(
                    "rule {} sets ctmark without a valid mark: {:?}",
                    rule.name, rule.value
                )));
            }
        }
    }
    Ok(())
}

/// Applies desired firewall tables through an [`NftHandle`]
pub struct FirewallReconciler {
    handle: Arc<dyn NftHandle>,
}

impl std::fmt::Debug for FirewallReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirewallReconciler")
            .field("handle", &"<NftHandle>")
            .finish()
    }
}

impl FirewallReconciler {
    pub fn new(handle: Arc<dyn NftHandle>) -> Self {
        Self { handle }
    }

    #[instrument(skip_all, fields(table = %table.name))]
    pub async fn reconcile(&self, table: &FirewallTable) -> Result<FirewallStats> {
        validate(table)?;
        let family = table.family;
        let name = table.name.as_str();
        let mut stats = FirewallStats::default();

        self.handle.ensure_table(family, name).await?;
        let existing = self.handle.list_chains(family, name).await?;

        for chain in &existing {
            if !table.chains.iter().any(|c| c.name == chain.name) {
                info!(chain = %chain.name, "Deleting stale chain");
                self.handle.delete_chain(family, name, &chain.name).await?;
                stats.chains_deleted += 1;
            }
        }

        for chain in &table.chains {
            let current = existing.iter().find(|c| c.name == chain.name);
            let rules: &[RuleState] = match current {
                Some(state) if state.same_definition(chain) => state.rules.as_slice(),
                Some(_) => {
                    info!(chain = %chain.name, "Recreating chain with new definition");
                    self.handle.delete_chain(family, name, &chain.name).await?;
                    self.handle.add_chain(family, name, chain).await?;
                    stats.chains_recreated += 1;
                    &[]
                }
                None => {
                    info!(chain = %chain.name, hook = chain.hook.as_str(), "Adding chain");
                    self.handle.add_chain(family, name, chain).await?;
                    stats.chains_added += 1;
                    &[]
                }
            };
            self.reconcile_rules(table, chain, rules, &mut stats).await?;
        }

        if stats.is_noop() {
            debug!("Firewall table already converged");
        } else {
            info!(?stats, "Firewall table reconciled");
        }
        Ok(stats)
    }

    async fn reconcile_rules(
        &self,
        table: &FirewallTable,
        chain: &Chain,
        existing: &[RuleState],
        stats: &mut FirewallStats,
    ) -> Result<()> {
        let mut present = HashSet::new();
        for rule in existing {
            let keep = match &rule.name {
                Some(name) => {
                    chain.rules.iter().any(|r| &r.name == name) && present.insert(name.as_str())
                }
                None => false,
            };
            if !keep {
                info!(chain = %chain.name, handle = rule.handle, name = ?rule.name, "Deleting stale rule");
                self.handle
                    .delete_rule(table.family, &table.name, &chain.name, rule.handle)
                    .await?;
                stats.rules_deleted += 1;
            }
        }

        for rule in &chain.rules {
            if present.contains(rule.name.as_str()) {
                continue;
            }
            info!(chain = %chain.name, rule = %rule.name, "Adding rule");
            self.handle
                .add_rule(table.family, &table.name, &chain.name, rule)
                .await?;
            stats.rules_added += 1;
        }
        Ok(())
    }

    /// Delete the whole table
    #[instrument(skip_all, fields(table = %table.name))]
    pub async fn remove(&self, table: &FirewallTable) -> Result<()> {
        self.handle.delete_table(table.family, &table.name).await?;
        info!("Firewall table removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DevPosition, Match, MatchDev};

    fn ct_rule(name: &str, dev: &str, mark: u32) -> FilterRule {
        FilterRule {
            name: name.to_string(),
            matches: vec![Match {
                op: Default::default(),
                ip: None,
                dev: Some(MatchDev {
                    value: dev.to_string(),
                    position: DevPosition::In,
                }),
            }],
            action: FilterAction::CtMark,
            value: Some(mark.to_string()),
        }
    }

    fn chain(name: &str, hook: ChainHook, rules: Vec<FilterRule>) -> Chain {
        Chain {
            name: name.to_string(),
            hook,
            chain_type: ChainType::Filter,
            priority: 0,
            policy: ChainPolicy::Accept,
            rules,
        }
    }

    fn table(chains: Vec<Chain>) -> FirewallTable {
        FirewallTable {
            name: "nodeport".to_string(),
            family: TableFamily::Inet,
            chains,
        }
    }

    fn setup() -> (Arc<MemoryNftHandle>, FirewallReconciler) {
        let handle = Arc::new(MemoryNftHandle::new());
        (handle.clone(), FirewallReconciler::new(handle))
    }

    #[tokio::test]
    async fn test_reconcile_creates_and_converges() {
        let (handle, reconciler) = setup();
        let desired = table(vec![chain(
            "mark-to-conntrack",
            ChainHook::Forward,
            vec![ct_rule("a", "tun-a", 1), ct_rule("b", "tun-b", 2)],
        )]);

        let stats = reconciler.reconcile(&desired).await.unwrap();
        assert_eq!(stats.chains_added, 1);
        assert_eq!(stats.rules_added, 2);

        let before = handle.mutations();
        assert!(reconciler.reconcile(&desired).await.unwrap().is_noop());
        assert_eq!(handle.mutations(), before);
    }

    #[tokio::test]
    async fn test_rules_tracked_by_name() {
        let (handle, reconciler) = setup();
        let mut desired = table(vec![chain(
            "mark-to-conntrack",
            ChainHook::Forward,
            vec![ct_rule("a", "tun-a", 1), ct_rule("b", "tun-b", 2)],
        )]);
        reconciler.reconcile(&desired).await.unwrap();

        desired.chains[0].rules = vec![ct_rule("b", "tun-other", 9), ct_rule("c", "tun-c", 3)];
        let stats = reconciler.reconcile(&desired).await.unwrap();

        assert_eq!(stats.rules_deleted, 1);
        assert_eq!(stats.rules_added, 1);
        let chains = handle.list_chains(TableFamily::Inet, "nodeport").await.unwrap();
        let names: Vec<_> = chains[0]
            .rules
            .iter()
            .filter_map(|r| r.name.as_deref())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_unnamed_and_duplicate_kernel_rules_are_deleted() {
        let (handle, reconciler) = setup();
        let desired = table(vec![chain("c", ChainHook::Forward, vec![ct_rule("a", "tun-a", 1)])]);
        reconciler.reconcile(&desired).await.unwrap();
        handle.inject_rule(TableFamily::Inet, "nodeport", "c", None);
        handle.inject_rule(TableFamily::Inet, "nodeport", "c", Some("a"));

        let stats = reconciler.reconcile(&desired).await.unwrap();
        assert_eq!(stats.rules_deleted, 2);
        assert_eq!(stats.rules_added, 0);
        let chains = handle.list_chains(TableFamily::Inet, "nodeport").await.unwrap();
        assert_eq!(chains[0].rules.len(), 1);
    }

    #[tokio::test]
    async fn test_changed_chain_definition_recreates_chain() {
        let (handle, reconciler) = setup();
        let mut desired = table(vec![chain("c", ChainHook::Forward, vec![ct_rule("a", "tun-a", 1)])]);
        reconciler.reconcile(&desired).await.unwrap();

        desired.chains[0].priority = -150;
        let stats = reconciler.reconcile(&desired).await.unwrap();

        assert_eq!(stats.chains_recreated, 1);
        assert_eq!(stats.rules_added, 1);
        let chains = handle.list_chains(TableFamily::Inet, "nodeport").await.unwrap();
        assert_eq!(chains[0].priority, Some(-150));
        assert_eq!(chains[0].rules.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_chain_deleted() {
        let (handle, reconciler) = setup();
        let mut desired = table(vec![
            chain("keep", ChainHook::Forward, vec![]),
            chain("drop", ChainHook::Prerouting, vec![]),
        ]);
        reconciler.reconcile(&desired).await.unwrap();

        desired.chains.truncate(1);
        let stats = reconciler.reconcile(&desired).await.unwrap();

        assert_eq!(stats.chains_deleted, 1);
        let chains = handle.list_chains(TableFamily::Inet, "nodeport").await.unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].name, "keep");
    }

    #[tokio::test]
    async fn test_duplicate_rule_names_rejected() {
        let (handle, reconciler) = setup();
        let desired = table(vec![chain(
            "c",
            ChainHook::Forward,
            vec![ct_rule("a", "tun-a", 1), ct_rule("a", "tun-b", 2)],
        )]);

        let err = reconciler.reconcile(&desired).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
        assert_eq!(handle.mutations(), 0);
    }

    #[test]
    fn test_ctmark_requires_value() {
        let mut rule = ct_rule("a", "tun-a", 1);
        rule.value = Some("lots".to_string());
        let desired = table(vec![chain("c", ChainHook::Forward, vec![rule])]);
        assert!(matches!(validate(&desired), Err(Error::InvalidSpec(_))));
    }

    #[tokio::test]
    async fn test_remove_table() {
        let (handle, reconciler) = setup();
        let desired = table(vec![chain("c", ChainHook::Forward, vec![])]);
        reconciler.reconcile(&desired).await.unwrap();

        reconciler.remove(&desired).await.unwrap();
        reconciler.remove(&desired).await.unwrap();
        assert!(!handle.has_table(TableFamily::Inet, "nodeport"));
    }
}
