//! Database migrations

use crate::error::Result;
use crate::models::EntityKind;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Table and index DDL for one entity kind
fn entity_table_statements(kind: EntityKind) -> Vec<String> {
    let table = kind.table();
    let index_columns = kind
        .index_columns()
        .iter()
        .map(|column| format!(",\n            {column} TEXT"))
        .collect::<String>();

    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY CHECK (length(id) > 0),
            owner_id TEXT NOT NULL,
            sync_status TEXT NOT NULL
                CHECK (sync_status IN ('synced', 'pending', 'conflict', 'error')),
            local_updated_at INTEGER NOT NULL,
            server_updated_at INTEGER,
            version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
            is_deleted INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            data TEXT NOT NULL{index_columns}
        )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_owner_status ON {table}(owner_id, sync_status)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_owner_deleted ON {table}(owner_id, is_deleted)"
        ),
    ];

    for column in kind.index_columns() {
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_owner_{column} ON {table}(owner_id, {column})"
        ));
    }

    statements
}

/// Execute statements atomically
async fn run_in_transaction(conn: &Connection, statements: &[String]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: entity tables, operation queue, sync metadata
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let mut statements = vec![
        // Schema version tracking
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )"
        .to_string(),
    ];

    for kind in EntityKind::SYNC_ORDER {
        statements.extend(entity_table_statements(kind));
    }

    statements.extend(
        [
            // Pending mutation log
            "CREATE TABLE IF NOT EXISTS operation_queue (
                id TEXT PRIMARY KEY,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
                timestamp INTEGER NOT NULL,
                owner_id TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                error TEXT,
                payload TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_operation_queue_owner_ts ON operation_queue(owner_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS idx_operation_queue_entity ON operation_queue(entity_kind, entity_id)",
            // Pull cursors and last sync time, one row per owner and kind
            "CREATE TABLE IF NOT EXISTS sync_meta (
                owner_id TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                last_sync_at INTEGER,
                cursor_updated_at INTEGER,
                cursor_id TEXT,
                PRIMARY KEY (owner_id, entity_kind)
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ]
        .map(str::to_string),
    );

    run_in_transaction(conn, &statements).await?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: LWW conflict logging support
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_kind TEXT NOT NULL,
            record_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            local_updated_at INTEGER NOT NULL,
            incoming_updated_at INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL,
            strategy TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_owner ON sync_conflicts(owner_id, resolved_at DESC)",
        "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(record_id)",
        "INSERT INTO schema_version (version) VALUES (2)",
    ]
    .map(str::to_string);

    run_in_transaction(conn, &statements).await?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: pull cursors move from ms to µs
async fn migrate_v3(conn: &Connection) -> Result<()> {
    let statements = [
        "UPDATE sync_meta SET cursor_updated_at = cursor_updated_at * 1000
         WHERE cursor_updated_at IS NOT NULL",
        "INSERT INTO schema_version (version) VALUES (3)",
    ]
    .map(str::to_string);

    run_in_transaction(conn, &statements).await?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}
