//! libSQL metadata index stored as `index.db` inside each checkpoint.
//!
//! The index mirrors the node table of `graph.json` keyed by item id so that
//! readers (the milestone validation job, `samplegraph verify`) can answer
//! existence checks without deserializing the whole topology.
//!
//! **Access rules:**
//! - the checkpoint writer rebuilds it read-write via [`CheckpointIndex::open`]
//! - snapshot consumers open it via [`CheckpointIndex::open_readonly`]

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use samplegraph_shared::{DiscoveredVia, ItemId, ItemNode, Result, SampleGraphError};

use crate::migrations;

/// File name of the index inside a checkpoint directory.
pub const INDEX_FILE: &str = "index.db";

/// One row of the `items` table.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedItem {
    pub id: ItemId,
    pub name: String,
    pub username: String,
    pub pack_id: Option<u64>,
    pub discovered_via: DiscoveredVia,
    pub last_verified_at: DateTime<Utc>,
}

/// Handle on a checkpoint's `index.db`.
pub struct CheckpointIndex {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn storage_err(e: impl std::fmt::Display) -> SampleGraphError {
    SampleGraphError::Storage(e.to_string())
}

impl CheckpointIndex {
    /// Open or create the index at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SampleGraphError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let index = Self {
            db,
            conn,
            readonly: false,
        };
        index.run_migrations().await?;
        Ok(index)
    }

    /// Open an existing index at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SampleGraphError::Storage(format!(
                "metadata index not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::debug!(
                    version = migration.version,
                    description = migration.description,
                    "applying index migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SampleGraphError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0,
        }
    }

    /// Whether the on-disk schema is the one this build writes.
    pub async fn is_current(&self) -> bool {
        self.schema_version().await == migrations::latest_version()
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(SampleGraphError::Storage(
                "metadata index is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Replace the whole table with `nodes` in one transaction.
    pub async fn replace_all<'a>(&self, nodes: impl IntoIterator<Item = &'a ItemNode>) -> Result<usize> {
        self.check_writable()?;
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute("DELETE FROM items", params![])
            .await
            .map_err(storage_err)?;

        let mut written = 0;
        for node in nodes {
            let verified = node.last_verified_at.to_rfc3339();
            tx.execute(
                "INSERT INTO items (id, name, username, pack_id, discovered_via, last_verified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    node.id.0 as i64,
                    node.name.as_str(),
                    node.username.as_str(),
                    node.pack_id.map(|p| p as i64),
                    node.discovered_via.as_str(),
                    verified.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
            written += 1;
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(written)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn contains(&self, id: ItemId) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM items WHERE id = ?1", params![id.0 as i64])
            .await
            .map_err(storage_err)?;
        Ok(rows.next().await.map_err(storage_err)?.is_some())
    }

    pub async fn count(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM items", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)? as usize),
            None => Ok(0),
        }
    }

    /// All indexed ids, ascending.
    pub async fn ids(&self) -> Result<Vec<ItemId>> {
        let mut rows = self
            .conn
            .query("SELECT id FROM items ORDER BY id", params![])
            .await
            .map_err(storage_err)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            ids.push(ItemId(row.get::<i64>(0).map_err(storage_err)? as u64));
        }
        Ok(ids)
    }

    pub async fn get(&self, id: ItemId) -> Result<Option<IndexedItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, name, username, pack_id, discovered_via, last_verified_at
                 FROM items WHERE id = ?1",
                params![id.0 as i64],
            )
            .await
            .map_err(storage_err)?;

        let Some(row) = rows.next().await.map_err(storage_err)? else {
            return Ok(None);
        };

        let via: String = row.get(4).map_err(storage_err)?;
        let verified: String = row.get(5).map_err(storage_err)?;
        Ok(Some(IndexedItem {
            id: ItemId(row.get::<i64>(0).map_err(storage_err)? as u64),
            name: row.get(1).map_err(storage_err)?,
            username: row.get(2).map_err(storage_err)?,
            pack_id: row.get::<i64>(3).ok().map(|p| p as u64),
            discovered_via: via.parse().map_err(SampleGraphError::Storage)?,
            last_verified_at: DateTime::parse_from_rfc3339(&verified)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(storage_err)?,
        }))
    }

    /// Number of indexed items owned by `username`.
    pub async fn count_by_owner(&self, username: &str) -> Result<usize> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM items WHERE username = ?1",
                params![username],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)? as usize),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_index_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sg_index_{}.db", Uuid::now_v7()))
    }

    fn node(id: u64, user: &str, pack: Option<u64>) -> ItemNode {
        let mut n = ItemNode::new(ItemId(id), format!("item-{id}.wav"), user);
        n.pack_id = pack;
        n.discovered_via = DiscoveredVia::PackEdge;
        n
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let index = CheckpointIndex::open(&temp_index_path()).await.expect("open");
        assert_eq!(index.schema_version().await, 2);
        assert!(index.is_current().await);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let path = temp_index_path();
        let first = CheckpointIndex::open(&path).await.expect("first open");
        drop(first);
        let second = CheckpointIndex::open(&path).await.expect("second open");
        assert_eq!(second.schema_version().await, 2);
    }

    #[tokio::test]
    async fn replace_all_then_lookup() {
        let index = CheckpointIndex::open(&temp_index_path()).await.expect("open");
        let nodes = vec![node(3, "alice", Some(9)), node(7, "alice", None), node(11, "bob", None)];
        assert_eq!(index.replace_all(&nodes).await.expect("write"), 3);

        assert_eq!(index.count().await.expect("count"), 3);
        assert!(index.contains(ItemId(7)).await.expect("contains"));
        assert!(!index.contains(ItemId(8)).await.expect("contains"));
        assert_eq!(index.count_by_owner("alice").await.expect("owner"), 2);
        assert_eq!(
            index.ids().await.expect("ids"),
            vec![ItemId(3), ItemId(7), ItemId(11)]
        );

        let row = index.get(ItemId(3)).await.expect("get").expect("row");
        assert_eq!(row.username, "alice");
        assert_eq!(row.pack_id, Some(9));
        assert_eq!(row.discovered_via, DiscoveredVia::PackEdge);

        let missing_pack = index.get(ItemId(7)).await.expect("get").expect("row");
        assert_eq!(missing_pack.pack_id, None);

        // A second rebuild replaces rather than appends.
        index.replace_all(&nodes[..1]).await.expect("rewrite");
        assert_eq!(index.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let path = temp_index_path();
        let rw = CheckpointIndex::open(&path).await.expect("open");
        rw.replace_all(&[node(1, "alice", None)]).await.expect("write");
        drop(rw);

        let ro = CheckpointIndex::open_readonly(&path).await.expect("open ro");
        assert!(ro.contains(ItemId(1)).await.expect("contains"));
        let result = ro.replace_all(&[node(2, "bob", None)]).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let result = CheckpointIndex::open_readonly(&temp_index_path()).await;
        assert!(result.is_err());
    }
}
