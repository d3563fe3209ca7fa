//! Convergence of kernel routing state towards a desired [`Table`]
//!
//! A pass runs in three phases: delete what the table holds but the spec does
//! not mention, register the table name, then add missing rules and add or
//! replace routes. After a successful pass the rules and routes of the
//! table ID are exactly the desired ones, and a second pass on the same spec
//! performs no mutation.
//!
//! There is no per-table lock: reconciling the same table from two tasks
//! concurrently is unsafe and callers must serialize per table. Different
//! tables can be reconciled in parallel.

use crate::crd::Table;
use crate::netlink::{RouteHandle, RouteSpec, RuleSpec};
use crate::rt_tables::{table_id, TableRegistry};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Mutations performed by one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub rules_added: usize,
    pub rules_deleted: usize,
    pub routes_added: usize,
    pub routes_replaced: usize,
    pub routes_deleted: usize,
}

impl ReconcileStats {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Outcome of [`NetworkStateReconciler::ensure_route_presence`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChange {
    Unchanged,
    Added,
    Replaced,
}

/// A table with its addresses parsed and its ID resolved
#[derive(Debug, Clone)]
struct DesiredTable {
    id: u32,
    rules: Vec<(RuleSpec, Vec<RouteSpec>)>,
}

impl DesiredTable {
    fn parse(table: &Table) -> Result<Self> {
        let id = table_id(&table.name);
        let rules = table
            .rules
            .iter()
            .map(|rule| {
                let routes = rule
                    .routes
                    .iter()
                    .map(|route| RouteSpec::from_desired(route, id))
                    .collect::<Result<Vec<_>>>()?;
                Ok((RuleSpec::from_desired(rule, id)?, routes))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { id, rules })
    }

    fn rule_specs(&self) -> Vec<RuleSpec> {
        self.rules.iter().map(|(rule, _)| rule.clone()).collect()
    }

    fn route_specs(&self) -> Vec<RouteSpec> {
        self.rules
            .iter()
            .flat_map(|(_, routes)| routes.iter().cloned())
            .collect()
    }
}

/// Applies desired routing tables to the kernel
pub struct NetworkStateReconciler {
    handle: Arc<dyn RouteHandle>,
    registry: TableRegistry,
}

impl std::fmt::Debug for NetworkStateReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkStateReconciler")
            .field("handle", &"<RouteHandle>")
            .field("registry", &self.registry)
            .finish()
    }
}

impl NetworkStateReconciler {
    pub fn new(handle: Arc<dyn RouteHandle>, registry: TableRegistry) -> Self {
        Self { handle, registry }
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    /// Converge the kernel state of `table`. Nothing is rolled back on
    /// error; the next pass picks up from whatever was applied.
    #[instrument(skip_all, fields(table = %table.name))]
    pub async fn reconcile_table(&self, table: &Table) -> Result<ReconcileStats> {
        let desired = DesiredTable::parse(table)?;
        let mut stats = ReconcileStats::default();

        stats.rules_deleted = self.clean_rules(desired.id, &desired.rule_specs()).await?;
        stats.routes_deleted = self
            .clean_routes(desired.id, &desired.route_specs())
            .await?;

        self.registry
            .ensure_table_presence(desired.id, &table.name)
            .await?;

        for (rule, routes) in &desired.rules {
            if self.ensure_rule_presence(rule).await? {
                stats.rules_added += 1;
            }
            for route in routes {
                match self.ensure_route_presence(route).await? {
                    RouteChange::Unchanged => {}
                    RouteChange::Added => stats.routes_added += 1,
                    RouteChange::Replaced => stats.routes_replaced += 1,
                }
            }
        }

        if stats.is_noop() {
            debug!(table_id = desired.id, "Routing table already converged");
        } else {
            info!(table_id = desired.id, ?stats, "Routing table reconciled");
        }
        Ok(stats)
    }

    /// Delete every rule and route of the table and unregister its name
    #[instrument(skip_all, fields(table = %table.name))]
    pub async fn remove_table(&self, table: &Table) -> Result<ReconcileStats> {
        let id = table_id(&table.name);
        let stats = ReconcileStats {
            rules_deleted: self.clean_rules(id, &[]).await?,
            routes_deleted: self.clean_routes(id, &[]).await?,
            ..Default::default()
        };
        self.registry.ensure_table_absence(id, &table.name).await?;
        info!(table_id = id, ?stats, "Routing table removed");
        Ok(stats)
    }

    /// Delete the rules of table `id` not claimed by a desired rule.
    ///
    /// Each desired rule claims at most one kernel rule, so duplicates are
    /// removed too. Returns the number of deleted rules.
    pub async fn clean_rules(&self, id: u32, desired: &[RuleSpec]) -> Result<usize> {
        let existing = self.handle.list_rules(id).await?;
        let mut claimed = vec![false; desired.len()];
        let mut deleted = 0;

        for rule in existing {
            let owner = (0..desired.len()).find(|&i| !claimed[i] && desired[i].matches(&rule));
            match owner {
                Some(i) => claimed[i] = true,
                None => {
                    info!(%rule, "Deleting stale rule");
                    self.handle.del_rule(&rule).await?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    /// Delete the routes of table `id` that no desired route claims. A desired
    /// route claims one kernel route: first one it matches, otherwise one
    /// with its destination, which it will replace. Returns the number of
    /// deleted routes.
    pub async fn clean_routes(&self, id: u32, desired: &[RouteSpec]) -> Result<usize> {
        let existing = self.handle.list_routes(id).await?;
        let mut claimed = vec![false; desired.len()];
        let mut kept = vec![false; existing.len()];

        for (j, route) in existing.iter().enumerate() {
            let owner = (0..desired.len()).find(|&i| !claimed[i] && desired[i].matches(route));
            if let Some(i) = owner {
                claimed[i] = true;
                kept[j] = true;
            }
        }
        // Leftovers with a desired destination are replaced, not deleted
        for (j, route) in existing.iter().enumerate() {
            if kept[j] {
                continue;
            }
            let owner =
                (0..desired.len()).find(|&i| !claimed[i] && desired[i].same_destination(route));
            if let Some(i) = owner {
                claimed[i] = true;
                kept[j] = true;
            }
        }

        let mut deleted = 0;
        for (route, _) in existing.iter().zip(kept).filter(|(_, kept)| !kept) {
            info!(%route, "Deleting stale route");
            self.handle.del_route(route).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Add `rule` unless a kernel rule already satisfies it. Rules are never
    /// modified in place. Returns whether a rule was added.
    pub async fn ensure_rule_presence(&self, rule: &RuleSpec) -> Result<bool> {
        let existing = self.handle.list_rules(rule.table).await?;
        if existing.iter().any(|r| rule.matches(r)) {
            debug!(%rule, "Rule present");
            return Ok(false);
        }
        info!(%rule, "Adding rule");
        self.handle.add_rule(rule).await?;
        Ok(true)
    }

    /// Add `route`, or replace the route with the same destination if it
    /// differs.
    pub async fn ensure_route_presence(&self, route: &RouteSpec) -> Result<RouteChange> {
        let existing = self.handle.list_routes(route.table).await?;
        if existing.iter().any(|r| route.matches(r)) {
            debug!(%route, "Route present");
            return Ok(RouteChange::Unchanged);
        }
        if existing.iter().any(|r| route.same_destination(r)) {
            info!(%route, "Replacing route");
            self.handle.replace_route(route).await?;
            return Ok(RouteChange::Replaced);
        }
        info!(%route, "Adding route");
        self.handle.add_route(route).await?;
        Ok(RouteChange::Added)
    }
}
