//! In-memory nftables ruleset

use super::{ChainState, NftHandle, RuleState};
use crate::crd::{Chain, FilterRule, TableFamily};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

type Tables = HashMap<(TableFamily, String), Vec<ChainState>>;

/// [`NftHandle`] keeping tables in memory, counting successful mutations
#[derive(Debug, Default)]
pub struct MemoryNftHandle {
    tables: Mutex<Tables>,
    next_handle: AtomicU64,
    mutations: AtomicU64,
}

fn missing(what: &str, name: &str) -> Error {
    Error::Command {
        command: format!("nft delete {} {}", what, name),
        stderr: "No such file or directory".to_string(),
    }
}

impl MemoryNftHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutations(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn has_table(&self, family: TableFamily, table: &str) -> bool {
        self.lock().contains_key(&(family, table.to_string()))
    }

    /// Append a rule as if another agent had added it
    pub fn inject_rule(&self, family: TableFamily, table: &str, chain: &str, name: Option<&str>) {
        let handle = self.handle();
        if let Some(chain) = self
            .lock()
            .get_mut(&(family, table.to_string()))
            .and_then(|chains| chains.iter_mut().find(|c| c.name == chain))
        {
            chain.rules.push(RuleState {
                handle,
                name: name.map(str::to_string),
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn bump(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn with_chain<T>(
        &self,
        family: TableFamily,
        table: &str,
        chain: &str,
        f: impl FnOnce(&mut ChainState) -> Result<T>,
    ) -> Result<T> {
        let mut tables = self.lock();
        let chains = tables
            .get_mut(&(family, table.to_string()))
            .ok_or_else(|| missing("table", table))?;
        let state = chains
            .iter_mut()
            .find(|c| c.name == chain)
            .ok_or_else(|| missing("chain", chain))?;
        f(state)
    }
}

#[async_trait]
impl NftHandle for MemoryNftHandle {
    async fn ensure_table(&self, family: TableFamily, table: &str) -> Result<()> {
        let mut tables = self.lock();
        let key = (family, table.to_string());
        if !tables.contains_key(&key) {
            tables.insert(key, Vec::new());
            drop(tables);
            self.bump();
        }
        Ok(())
    }

    async fn delete_table(&self, family: TableFamily, table: &str) -> Result<()> {
        let removed = self.lock().remove(&(family, table.to_string()));
        if removed.is_some() {
            self.bump();
        }
        Ok(())
    }

    async fn list_chains(&self, family: TableFamily, table: &str) -> Result<Vec<ChainState>> {
        self.lock()
            .get(&(family, table.to_string()))
            .cloned()
            .ok_or_else(|| missing("table", table))
    }

    async fn add_chain(&self, family: TableFamily, table: &str, chain: &Chain) -> Result<()> {
        let mut tables = self.lock();
        let chains = tables
            .get_mut(&(family, table.to_string()))
            .ok_or_else(|| missing("table", table))?;
        if chains.iter().any(|c| c.name == chain.name) {
            return Err(Error::Command {
                command: format!("nft add chain {}", chain.name),
                stderr: "File exists".to_string(),
            });
        }
        chains.push(ChainState::from_desired(chain));
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn delete_chain(&self, family: TableFamily, table: &str, chain: &str) -> Result<()> {
        let mut tables = self.lock();
        let chains = tables
            .get_mut(&(family, table.to_string()))
            .ok_or_else(|| missing("table", table))?;
        let position = chains
            .iter()
            .position(|c| c.name == chain)
            .ok_or_else(|| missing("chain", chain))?;
        chains.remove(position);
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn add_rule(
        &self,
        family: TableFamily,
        table: &str,
        chain: &str,
        rule: &FilterRule,
    ) -> Result<()> {
        let handle = self.handle();
        self.with_chain(family, table, chain, |state| {
            state.rules.push(RuleState {
                handle,
                name: Some(rule.name.clone()),
            });
            Ok(())
        })?;
        self.bump();
        Ok(())
    }

    async fn delete_rule(
        &self,
        family: TableFamily,
        table: &str,
        chain: &str,
        handle: u64,
    ) -> Result<()> {
        self.with_chain(family, table, chain, |state| {
            let position = state
                .rules
                .iter()
                .position(|r| r.handle == handle)
                .ok_or_else(|| missing("rule handle", &handle.to_string()))?;
            state.rules.remove(position);
            Ok(())
        })?;
        self.bump();
        Ok(())
    }
}
