//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "agent_jobs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agent_jobs (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                priority INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL DEFAULT '{}',
                affinity_key TEXT,
                claimed_by TEXT,
                lease_expires_at TEXT,
                next_attempt_at TEXT,
                attempt INTEGER NOT NULL DEFAULT 1,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                cancel_requested_at TEXT,
                cancel_reason TEXT,
                result_summary TEXT,
                error_message TEXT,
                artifacts_path TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_agent_jobs_claim
                ON agent_jobs(status, priority DESC, created_at ASC, id ASC);
            CREATE INDEX IF NOT EXISTS idx_agent_jobs_lease
                ON agent_jobs(status, lease_expires_at);
            CREATE INDEX IF NOT EXISTS idx_agent_jobs_type ON agent_jobs(type);
            CREATE INDEX IF NOT EXISTS idx_agent_jobs_created ON agent_jobs(created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "agent_job_ledger",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agent_job_events (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES agent_jobs(id),
                sequence INTEGER NOT NULL,
                level TEXT NOT NULL DEFAULT 'info',
                message TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(job_id, sequence)
            );

            CREATE TABLE IF NOT EXISTS agent_job_artifacts (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES agent_jobs(id),
                name TEXT NOT NULL,
                content_type TEXT,
                size_bytes INTEGER NOT NULL,
                digest TEXT,
                storage_path TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_job_artifacts_job
                ON agent_job_artifacts(job_id, created_at);
        "#,
    },
    Migration {
        version: 3,
        name: "agent_worker_tokens",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agent_worker_tokens (
                id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                token_hash TEXT NOT NULL UNIQUE,
                description TEXT,
                allowed_repositories TEXT NOT NULL DEFAULT '[]',
                allowed_job_types TEXT NOT NULL DEFAULT '[]',
                capabilities TEXT NOT NULL DEFAULT '[]',
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_worker_tokens_worker
                ON agent_worker_tokens(worker_id);
            CREATE INDEX IF NOT EXISTS idx_agent_worker_tokens_created
                ON agent_worker_tokens(created_at);
        "#,
    },
];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "agent_jobs",
            "agent_job_events",
            "agent_job_artifacts",
            "agent_worker_tokens",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, MIGRATIONS.last().map(|m| m.version).unwrap());
    }

    #[tokio::test]
    async fn worker_token_hash_is_unique() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        let insert = "INSERT INTO agent_worker_tokens (id, worker_id, token_hash, created_at, updated_at) \
                      VALUES (?1, 'w1', 'h1', 'x', 'x')";
        conn.execute(insert, libsql::params!["t1"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["t2"]).await.is_err());
    }

    #[tokio::test]
    async fn event_sequence_is_unique_per_job() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO agent_jobs (id, type, created_at, updated_at) VALUES ('j1', 'task', 'x', 'x')",
            (),
        )
        .await
        .unwrap();
        conn.execute(
            "INSERT INTO agent_job_events (id, job_id, sequence, message, created_at) VALUES ('e1', 'j1', 1, 'a', 'x')",
            (),
        )
        .await
        .unwrap();
        let dup = conn
            .execute(
                "INSERT INTO agent_job_events (id, job_id, sequence, message, created_at) VALUES ('e2', 'j1', 1, 'b', 'x')",
                (),
            )
            .await;
        assert!(dup.is_err());
    }
}
