//! SQL migration definitions for the checkpoint metadata index.
//!
//! Migrations are applied in order when an index is opened read-write.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: items keyed by catalog id",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS items (
    id               INTEGER PRIMARY KEY,
    name             TEXT NOT NULL,
    username         TEXT NOT NULL,
    pack_id          INTEGER,
    discovered_via   TEXT NOT NULL,
    last_verified_at TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Owner and pack lookup indexes",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_items_username ON items(username);
CREATE INDEX IF NOT EXISTS idx_items_pack_id ON items(pack_id);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}

/// Highest schema version known to this build.
pub(crate) fn latest_version() -> u32 {
    all_migrations()
        .iter()
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}
