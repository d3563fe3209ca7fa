//! Routing table IDs and the iproute2 table name registry
//!
//! Table IDs are derived from the table name, so no mapping has to be
//! persisted. The registry file (`/etc/iproute2/rt_tables` format,
//! `<id>\t<name>` per line) only makes the names visible to `ip`.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Kernel table ID of `name`.
///
/// First four bytes of SHA-256(name), top bit cleared and bit 8 forced so
/// the result never falls into the reserved 0-255 range.
pub fn table_id(name: &str) -> u32 {
    let digest = Sha256::digest(name.as_bytes());
    let id = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (id & 0x7fff_ffff) | 0x100
}

/// A line of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub id: u32,
    pub name: String,
}

/// The routing table name registry.
///
/// Edits are read-modify-write of the whole file; clones share a lock so
/// they never interleave within the process.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    path: PathBuf,
    edit: Arc<Mutex<()>>,
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new(crate::DEFAULT_RT_TABLES_PATH)
    }
}

fn parse_line(line: &str) -> Option<TableEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut fields = line.split_whitespace();
    let id = fields.next()?.parse().ok()?;
    let name = fields.next()?.to_string();
    Some(TableEntry { id, name })
}

impl TableRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            edit: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Registered tables, comments and malformed lines skipped
    pub async fn entries(&self) -> Result<Vec<TableEntry>> {
        Ok(self.read().await?.lines().filter_map(parse_line).collect())
    }

    /// Register `name` under `id` unless already there.
    ///
    /// Fails with [`Error::TableIdCollision`] when `id` is taken by another
    /// name.
    pub async fn ensure_table_presence(&self, id: u32, name: &str) -> Result<()> {
        let _edit = self.edit.lock().await;
        let content = self.read().await?;
        for entry in content.lines().filter_map(parse_line) {
            if entry.id != id {
                continue;
            }
            if entry.name == name {
                return Ok(());
            }
            return Err(Error::TableIdCollision {
                id,
                existing: entry.name,
                requested: name.to_string(),
            });
        }

        let mut updated = content;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&format!("{}\t{}\n", id, name));
        tokio::fs::write(&self.path, updated).await?;
        info!(id, name, path = %self.path.display(), "Registered routing table");
        Ok(())
    }

    /// Drop the `id`/`name` line, rewriting the file without it
    pub async fn ensure_table_absence(&self, id: u32, name: &str) -> Result<()> {
        let _edit = self.edit.lock().await;
        let content = self.read().await?;
        let mut found = false;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                let matched = parse_line(line)
                    .map(|e| e.id == id && e.name == name)
                    .unwrap_or(false);
                found |= matched;
                !matched
            })
            .collect();

        if !found {
            debug!(id, name, "Routing table not registered");
            return Ok(());
        }

        let mut updated = kept.join("\n");
        if !updated.is_empty() {
            updated.push('\n');
        }
        tokio::fs::write(&self.path, updated).await?;
        info!(id, name, path = %self.path.display(), "Unregistered routing table");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM_TABLES: &str = "#\n# reserved values\n#\n255\tlocal\n254\tmain\n253\tdefault\n0\tunspec\n";

    fn registry(dir: &tempfile::TempDir) -> TableRegistry {
        TableRegistry::new(dir.path().join("rt_tables"))
    }

    #[test]
    fn test_table_id_is_deterministic() {
        assert_eq!(table_id("t1"), table_id("t1"));
        assert_ne!(table_id("t1"), table_id("t2"));
    }

    #[test]
    fn test_table_id_range() {
        for name in ["t1", "nodeport-worker-1", "", "gateway"] {
            let id = table_id(name);
            assert!(id > 255, "{} -> {}", name, id);
            assert!(id <= 0x7fff_ffff, "{} -> {}", name, id);
        }
    }

    #[tokio::test]
    async fn test_presence_appends_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        tokio::fs::write(registry.path(), SYSTEM_TABLES).await.unwrap();

        registry.ensure_table_presence(1000, "t1").await.unwrap();
        registry.ensure_table_presence(1000, "t1").await.unwrap();

        let content = tokio::fs::read_to_string(registry.path()).await.unwrap();
        assert!(content.starts_with(SYSTEM_TABLES));
        assert_eq!(content.matches("1000\tt1\n").count(), 1);
    }

    #[tokio::test]
    async fn test_presence_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);

        registry.ensure_table_presence(1000, "t1").await.unwrap();
        assert_eq!(
            registry.entries().await.unwrap(),
            vec![TableEntry {
                id: 1000,
                name: "t1".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_collision_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);

        registry.ensure_table_presence(1000, "t1").await.unwrap();
        let err = registry.ensure_table_presence(1000, "other").await.unwrap_err();
        assert!(matches!(err, Error::TableIdCollision { id: 1000, .. }));
    }

    #[tokio::test]
    async fn test_absence_removes_only_that_line() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(&dir);
        tokio::fs::write(registry.path(), SYSTEM_TABLES).await.unwrap();
        registry.ensure_table_presence(1000, "t1").await.unwrap();
        registry.ensure_table_presence(2000, "t2").await.unwrap();

        registry.ensure_table_absence(1000, "t1").await.unwrap();
        registry.ensure_table_absence(1000, "t1").await.unwrap();

        let content = tokio::fs::read_to_string(registry.path()).await.unwrap();
        assert_eq!(content, format!("{}2000\tt2\n", SYSTEM_TABLES));
    }
}
