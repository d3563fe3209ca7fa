//! In-memory routing state

use super::{RouteHandle, RouteSpec, RuleSpec};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// [`RouteHandle`] keeping rules and routes in memory.
///
/// Behaves like the kernel for the operations the reconciler needs: adding
/// an existing route or deleting a missing object fails. Every successful
/// mutation bumps [`MemoryRouteHandle::mutations`].
#[derive(Debug, Default)]
pub struct MemoryRouteHandle {
    rules: Mutex<Vec<RuleSpec>>,
    routes: Mutex<Vec<RouteSpec>>,
    next_priority: AtomicU64,
    mutations: AtomicU64,
}

impl MemoryRouteHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful add/replace/delete calls so far
    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn rules(&self) -> Vec<RuleSpec> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn routes(&self) -> Vec<RouteSpec> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install a route as if another agent had created it
    pub fn inject_route(&self, route: RouteSpec) {
        self.routes.lock().unwrap_or_else(|e| e.into_inner()).push(route);
    }

    /// Install a rule as if another agent had created it
    pub fn inject_rule(&self, rule: RuleSpec) {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).push(rule);
    }

    fn bump(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

fn not_found(what: impl std::fmt::Display) -> Error {
    Error::Command {
        command: format!("del {}", what),
        stderr: "No such file or directory".to_string(),
    }
}

#[async_trait]
impl RouteHandle for MemoryRouteHandle {
    async fn list_rules(&self, table: u32) -> Result<Vec<RuleSpec>> {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rules.iter().filter(|r| r.table == table).cloned().collect())
    }

    async fn add_rule(&self, rule: &RuleSpec) -> Result<()> {
        let mut stored = rule.clone();
        if stored.priority.is_none() {
            // The kernel numbers rules downwards from 32765
            let offset = self.next_priority.fetch_add(1, Ordering::SeqCst) as u32;
            stored.priority = Some(32765u32.saturating_sub(offset));
        }
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stored);
        self.bump();
        Ok(())
    }

    async fn del_rule(&self, rule: &RuleSpec) -> Result<()> {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let position = rules
            .iter()
            .position(|r| rule.matches(r) && (rule.priority.is_none() || rule.priority == r.priority))
            .ok_or_else(|| not_found(rule))?;
        rules.remove(position);
        drop(rules);
        self.bump();
        Ok(())
    }

    async fn list_routes(&self, table: u32) -> Result<Vec<RouteSpec>> {
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(routes.iter().filter(|r| r.table == table).cloned().collect())
    }

    async fn add_route(&self, route: &RouteSpec) -> Result<()> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if routes.iter().any(|r| route.same_destination(r)) {
            return Err(Error::Command {
                command: format!("route add {}", route),
                stderr: "File exists".to_string(),
            });
        }
        routes.push(route.clone());
        drop(routes);
        self.bump();
        Ok(())
    }

    async fn replace_route(&self, route: &RouteSpec) -> Result<()> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.retain(|r| !route.same_destination(r));
        routes.push(route.clone());
        drop(routes);
        self.bump();
        Ok(())
    }

    async fn del_route(&self, route: &RouteSpec) -> Result<()> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let position = routes
            .iter()
            .position(|r| route.matches(r))
            .ok_or_else(|| not_found(route))?;
        routes.remove(position);
        drop(routes);
        self.bump();
        Ok(())
    }
}
