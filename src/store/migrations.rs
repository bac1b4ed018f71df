use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::logger;

/// Numbered schema ladder. Each entry runs inside its own transaction and
/// records itself in `schema_migrations`; any failure is fatal to startup.
struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection, usize) -> rusqlite::Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "core memories",
        apply: |conn, _dims| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS memories (
                    id TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    type TEXT NOT NULL DEFAULT 'semantic',
                    source TEXT NOT NULL DEFAULT '',
                    importance REAL NOT NULL DEFAULT 0.5,
                    confidence REAL NOT NULL DEFAULT 0.5,
                    tags TEXT NOT NULL DEFAULT '[]',
                    pinned INTEGER NOT NULL DEFAULT 0,
                    who TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    accessed_at TEXT,
                    access_count INTEGER NOT NULL DEFAULT 0,
                    is_deleted INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
                CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
                CREATE INDEX IF NOT EXISTS idx_memories_live ON memories(is_deleted, created_at);
                CREATE TABLE IF NOT EXISTS perception_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );",
            )
        },
    },
    Migration {
        version: 2,
        name: "fts index",
        apply: |conn, _dims| {
            conn.execute_batch(
                "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                    content, tags,
                    content='memories',
                    content_rowid='rowid'
                );
                CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                    INSERT INTO memories_fts(rowid, content, tags)
                    VALUES (new.rowid, new.content, new.tags);
                END;
                CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                    INSERT INTO memories_fts(memories_fts, rowid, content, tags)
                    VALUES ('delete', old.rowid, old.content, old.tags);
                END;
                CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE ON memories BEGIN
                    INSERT INTO memories_fts(memories_fts, rowid, content, tags)
                    VALUES ('delete', old.rowid, old.content, old.tags);
                    INSERT INTO memories_fts(rowid, content, tags)
                    VALUES (new.rowid, new.content, new.tags);
                END;
                INSERT INTO memories_fts(memories_fts) VALUES ('rebuild');",
            )
        },
    },
    Migration {
        version: 3,
        name: "embeddings",
        apply: |conn, dims| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS embeddings (
                    id TEXT PRIMARY KEY,
                    content_hash TEXT NOT NULL UNIQUE,
                    dimensions INTEGER NOT NULL,
                    source_type TEXT NOT NULL DEFAULT 'memory',
                    source_id TEXT NOT NULL,
                    chunk_text TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );",
            )?;
            conn.execute_batch(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS vec_embeddings USING vec0(
                    id TEXT PRIMARY KEY,
                    embedding FLOAT[{dims}] distance_metric=cosine
                );"
            ))
        },
    },
    Migration {
        version: 4,
        name: "entities and conversations",
        apply: |conn, _dims| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS entities (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    entity_type TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS relations (
                    source_id TEXT NOT NULL,
                    target_id TEXT NOT NULL,
                    relation TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (source_id, target_id, relation)
                );
                CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    harness TEXT NOT NULL DEFAULT '',
                    started_at TEXT NOT NULL,
                    ended_at TEXT,
                    summary TEXT
                );",
            )
        },
    },
    Migration {
        version: 5,
        name: "expertise graph",
        apply: |conn, _dims| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS expertise_nodes (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    entity_type TEXT NOT NULL,
                    mentions INTEGER NOT NULL DEFAULT 0,
                    first_seen TEXT NOT NULL,
                    last_seen TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS expertise_edges (
                    source_id TEXT NOT NULL,
                    target_id TEXT NOT NULL,
                    weight REAL NOT NULL DEFAULT 0,
                    co_occurrences INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (source_id, target_id)
                );",
            )
        },
    },
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

pub fn current_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Bring the database to the latest schema. `dims` sizes the vector table
/// when it is first created.
pub fn migrate(conn: &Connection, dims: usize) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )
    .context("creating schema_migrations")?;

    unify_legacy_schema(conn).context("unifying legacy schema")?;

    let applied = current_version(conn);
    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        conn.execute_batch("BEGIN")?;
        let result = (migration.apply)(conn, dims).and_then(|()| {
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![migration.version, chrono::Utc::now().to_rfc3339()],
            )
            .map(|_| ())
        });
        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                logger::info(
                    "store",
                    &format!("migration {} applied ({})", migration.version, migration.name),
                );
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                anyhow::bail!("migration {} ({}) failed: {e}", migration.version, migration.name);
            }
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [name],
        |_| Ok(()),
    )
    .is_ok()
}

pub fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    let Ok(mut stmt) = conn.prepare(&format!("PRAGMA table_info({table})")) else {
        return false;
    };
    let Ok(mut rows) = stmt.query([]) else {
        return false;
    };
    while let Ok(Some(row)) = rows.next() {
        if row.get::<_, String>(1).map(|n| n == column).unwrap_or(false) {
            return true;
        }
    }
    false
}

/// Pre-ladder databases carried a narrower `memories` shape. Detect one by
/// the missing `who` column and copy its rows into the unified table before
/// the numbered ladder resumes.
fn unify_legacy_schema(conn: &Connection) -> Result<()> {
    if current_version(conn) > 0 {
        return Ok(());
    }
    if !table_exists(conn, "memories") || column_exists(conn, "memories", "who") {
        return Ok(());
    }

    logger::warn("store", "legacy memories schema detected, unifying");
    conn.execute_batch(
        "BEGIN;
        ALTER TABLE memories RENAME TO memories_legacy;
        CREATE TABLE memories (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            type TEXT NOT NULL DEFAULT 'semantic',
            source TEXT NOT NULL DEFAULT '',
            importance REAL NOT NULL DEFAULT 0.5,
            confidence REAL NOT NULL DEFAULT 0.5,
            tags TEXT NOT NULL DEFAULT '[]',
            pinned INTEGER NOT NULL DEFAULT 0,
            who TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            accessed_at TEXT,
            access_count INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0
        );
        INSERT INTO memories (id, content, type, importance, confidence, tags, created_at, updated_at)
            SELECT id, content,
                   COALESCE(type, 'semantic'),
                   COALESCE(importance, 0.5),
                   COALESCE(confidence, 0.5),
                   COALESCE(tags, '[]'),
                   created_at,
                   COALESCE(updated_at, created_at)
            FROM memories_legacy;
        DROP TABLE memories_legacy;
        INSERT INTO schema_migrations (version, applied_at) VALUES (1, datetime('now'));
        COMMIT;",
    )
    .context("copying legacy rows")?;

    // legacy dbs predate the fts/vec/graph tables; re-run the rest normally
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
        CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
        CREATE INDEX IF NOT EXISTS idx_memories_live ON memories(is_deleted, created_at);
        CREATE TABLE IF NOT EXISTS perception_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_connection;

    #[test]
    fn fresh_db_reaches_latest_version() {
        let dir = tempfile::tempdir().expect("temp dir");
        let conn = open_connection(&dir.path().join("m.db")).unwrap();
        migrate(&conn, 8).unwrap();
        assert_eq!(current_version(&conn), latest_version());
        assert!(table_exists(&conn, "memories"));
        assert!(table_exists(&conn, "memories_fts"));
        assert!(table_exists(&conn, "embeddings"));
        assert!(table_exists(&conn, "vec_embeddings"));
        assert!(table_exists(&conn, "expertise_nodes"));
        assert!(table_exists(&conn, "perception_state"));
    }

    #[test]
    fn migrations_are_idempotent_and_deterministic() {
        let dir = tempfile::tempdir().expect("temp dir");
        let conn = open_connection(&dir.path().join("m.db")).unwrap();
        migrate(&conn, 8).unwrap();
        let tables_once: Vec<String> = list_tables(&conn);

        migrate(&conn, 8).unwrap();
        assert_eq!(list_tables(&conn), tables_once);

        // fresh db in one shot matches a db migrated twice
        let conn2 = open_connection(&dir.path().join("m2.db")).unwrap();
        migrate(&conn2, 8).unwrap();
        assert_eq!(list_tables(&conn2), tables_once);
    }

    #[test]
    fn legacy_schema_is_unified_before_ladder() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("legacy.db");
        {
            let conn = open_connection(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE memories (
                    id TEXT PRIMARY KEY,
                    content TEXT NOT NULL,
                    type TEXT,
                    importance REAL,
                    confidence REAL,
                    tags TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT
                );
                INSERT INTO memories (id, content, type, created_at)
                VALUES ('old1', 'legacy fact', 'fact', '2024-01-01T00:00:00Z');",
            )
            .unwrap();
        }
        let conn = open_connection(&path).unwrap();
        migrate(&conn, 8).unwrap();
        let (content, who): (String, String) = conn
            .query_row(
                "SELECT content, who FROM memories WHERE id = 'old1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(content, "legacy fact");
        assert_eq!(who, "");
        assert_eq!(current_version(&conn), latest_version());
    }

    fn list_tables(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }
}
