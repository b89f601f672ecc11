//! SQLite-backed store for resource state and operation history
//!
//! Resource state is only written after a lifecycle call succeeded, so a
//! failing create/update leaves the previously saved row untouched.
//!
//! Every row carries a creation sequence number assigned on first insert.
//! Updates keep it, so listing order reflects when a resource was first
//! created, not when it last changed.

use crate::error::Result;
use crate::models::{
    CopyState, OperationKind, OperationRecord, OperationStatus, ResourceState, StoredState,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Saved state of a named resource
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResource {
    pub name: String,
    pub state: StoredState,
    pub updated_at: DateTime<Utc>,
}

/// State manager for resources and their lifecycle calls
#[derive(Clone)]
pub struct StateManager {
    conn: Arc<Mutex<Connection>>,
}

impl StateManager {
    /// Open (or create) the state database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -2000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        manager.init_schema()?;
        Ok(manager)
    }

    /// In-memory database, used by tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        manager.init_schema()?;
        Ok(manager)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS resources (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                state TEXT NOT NULL,
                created_seq INTEGER NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );

            CREATE TABLE IF NOT EXISTS operations (
                id INTEGER PRIMARY KEY,
                resource_name TEXT NOT NULL,
                operation TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMP NOT NULL,
                completed_at TIMESTAMP,
                exit_code INTEGER,
                stdout TEXT,
                stderr TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_operations_resource_started ON operations(resource_name, started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);
            ",
        )?;

        Ok(())
    }

    /// Insert or replace the state of a command resource
    pub fn save_resource(&self, name: &str, state: &ResourceState) -> Result<()> {
        self.save_state(name, &StoredState::Command(state.clone()))
    }

    /// Insert or replace the state of a copy resource
    pub fn save_copy(&self, name: &str, state: &CopyState) -> Result<()> {
        self.save_state(name, &StoredState::Copy(state.clone()))
    }

    /// Insert or replace the state of `name`, keeping its creation sequence
    pub fn save_state(&self, name: &str, state: &StoredState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let conn = self.lock();

        conn.execute(
            "INSERT INTO resources (name, kind, resource_id, state, created_seq, updated_at)
             VALUES (?1, ?2, ?3, ?4, (SELECT COALESCE(MAX(created_seq), 0) + 1 FROM resources), ?5)
             ON CONFLICT(name) DO UPDATE SET kind = excluded.kind, resource_id = excluded.resource_id, state = excluded.state, updated_at = excluded.updated_at",
            params![name, state.kind(), state.id(), json, Utc::now()],
        )?;

        Ok(())
    }

    /// State of `name` of either kind, if it was ever created
    pub fn load_state(&self, name: &str) -> Result<Option<StoredState>> {
        let conn = self.lock();

        let json: Option<String> = conn
            .query_row(
                "SELECT state FROM resources WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// State of the command resource `name`; `None` for absent or copy resources
    pub fn load_resource(&self, name: &str) -> Result<Option<ResourceState>> {
        Ok(self.load_state(name)?.and_then(StoredState::into_command))
    }

    /// State of the copy resource `name`; `None` for absent or command resources
    pub fn load_copy(&self, name: &str) -> Result<Option<CopyState>> {
        Ok(self.load_state(name)?.and_then(StoredState::into_copy))
    }

    /// Forget `name`; returns whether a row was removed
    pub fn remove_resource(&self, name: &str) -> Result<bool> {
        let conn = self.lock();
        let removed = conn.execute("DELETE FROM resources WHERE name = ?1", params![name])?;
        Ok(removed > 0)
    }

    /// All saved resources in creation order, oldest first
    pub fn list_resources(&self) -> Result<Vec<StoredResource>> {
        let conn = self.lock();

        let mut stmt = conn.prepare(
            "SELECT name, state, updated_at FROM resources ORDER BY created_seq",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, DateTime<Utc>>(2)?,
            ))
        })?;

        let mut resources = Vec::new();
        for row in rows {
            let (name, json, updated_at) = row?;
            resources.push(StoredResource {
                name,
                state: serde_json::from_str(&json)?,
                updated_at,
            });
        }

        Ok(resources)
    }

    /// Record the start of a lifecycle call
    pub fn start_operation(&self, resource_name: &str, operation: OperationKind) -> Result<i64> {
        let conn = self.lock();

        conn.execute(
            "INSERT INTO operations (resource_name, operation, status, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                resource_name,
                operation.to_string(),
                OperationStatus::Running.to_string(),
                Utc::now()
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Record how a lifecycle call ended
    pub fn finish_operation(
        &self,
        operation_id: i64,
        status: OperationStatus,
        exit_code: Option<i32>,
        stdout: Option<&str>,
        stderr: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();

        conn.execute(
            "UPDATE operations SET status = ?1, completed_at = ?2, exit_code = ?3, stdout = ?4, stderr = ?5, error = ?6 WHERE id = ?7",
            params![
                status.to_string(),
                Utc::now(),
                exit_code,
                stdout,
                stderr,
                error,
                operation_id
            ],
        )?;

        Ok(())
    }

    /// Most recent lifecycle calls, optionally for one resource
    pub fn operation_history(
        &self,
        resource_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<OperationRecord>> {
        let conn = self.lock();

        let mut stmt = conn.prepare(
            "SELECT id, resource_name, operation, status, started_at, completed_at, exit_code, stdout, stderr, error
             FROM operations
             WHERE ?1 IS NULL OR resource_name = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![resource_name, limit], |row| {
            Ok(OperationRecord {
                id: row.get(0)?,
                resource_name: row.get(1)?,
                operation: OperationKind::parse(&row.get::<_, String>(2)?)
                    .unwrap_or(OperationKind::Update),
                status: parse_operation_status(&row.get::<_, String>(3)?),
                started_at: row.get(4)?,
                completed_at: row.get(5)?,
                exit_code: row.get(6)?,
                stdout: row.get(7)?,
                stderr: row.get(8)?,
                error: row.get(9)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        Ok(records)
    }

    /// Mark calls left running by a crashed process as failed
    pub fn recover_interrupted(&self) -> Result<Vec<i64>> {
        let conn = self.lock();

        let mut stmt = conn.prepare("SELECT id FROM operations WHERE status = ?1")?;
        let interrupted: Vec<i64> = stmt
            .query_map(params![OperationStatus::Running.to_string()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for id in &interrupted {
            conn.execute(
                "UPDATE operations SET status = ?1, completed_at = ?2, error = ?3 WHERE id = ?4",
                params![
                    OperationStatus::Failed.to_string(),
                    Utc::now(),
                    "interrupted",
                    id
                ],
            )?;
        }

        Ok(interrupted)
    }
}

fn parse_operation_status(s: &str) -> OperationStatus {
    match s {
        "running" => OperationStatus::Running,
        "success" => OperationStatus::Success,
        _ => OperationStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CommandOutputs, CommandSpec, ConnectionSpec, CopySource, CopySpec, Endpoint,
    };
    use tempfile::TempDir;

    fn state(id: &str, stdout: &str) -> ResourceState {
        ResourceState {
            id: id.to_string(),
            inputs: CommandSpec::local("echo hi"),
            outputs: CommandOutputs {
                stdout: stdout.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_save_and_load_resource() {
        let manager = StateManager::in_memory().unwrap();
        assert!(manager.load_resource("web").unwrap().is_none());

        manager.save_resource("web", &state("web1a2b3c4d", "v1")).unwrap();
        manager.save_resource("web", &state("web1a2b3c4d", "v2")).unwrap();

        let loaded = manager.load_resource("web").unwrap().unwrap();
        assert_eq!(loaded.outputs.stdout, "v2");
        assert_eq!(manager.list_resources().unwrap().len(), 1);
    }

    #[test]
    fn test_listing_keeps_creation_order_across_updates() {
        let manager = StateManager::in_memory().unwrap();
        manager.save_resource("b", &state("b00000000", "")).unwrap();
        manager.save_resource("a", &state("a00000000", "")).unwrap();
        manager.save_resource("c", &state("c00000000", "")).unwrap();

        // Updating the oldest resource must not move it to the end
        manager.save_resource("b", &state("b00000000", "v2")).unwrap();

        let names: Vec<_> = manager
            .list_resources()
            .unwrap()
            .into_iter()
            .map(|stored| stored.name)
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);

        manager.remove_resource("b").unwrap();
        manager.save_resource("b", &state("b11111111", "")).unwrap();
        let names: Vec<_> = manager
            .list_resources()
            .unwrap()
            .into_iter()
            .map(|stored| stored.name)
            .collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_copy_state_shares_the_namespace() {
        let manager = StateManager::in_memory().unwrap();
        let copy = CopyState {
            id: "push1a2b3c4d".to_string(),
            inputs: CopySpec {
                connection: ConnectionSpec::new(Endpoint::new("10.0.0.5")),
                source: CopySource::Asset("app.conf".to_string()),
                remote_path: "/etc/app.conf".to_string(),
                triggers: Vec::new(),
            },
            source_sha256: "deadbeef".to_string(),
        };
        manager.save_copy("push", &copy).unwrap();

        assert_eq!(manager.load_copy("push").unwrap(), Some(copy.clone()));
        assert!(manager.load_resource("push").unwrap().is_none());

        let listed = manager.list_resources().unwrap();
        assert_eq!(listed[0].state, StoredState::Copy(copy));

        manager.save_resource("push", &state("push00000000", "")).unwrap();
        assert!(manager.load_copy("push").unwrap().is_none());
        assert!(manager.load_resource("push").unwrap().is_some());
    }

    #[test]
    fn test_remove_resource() {
        let manager = StateManager::in_memory().unwrap();
        manager.save_resource("a", &state("a00000000", "")).unwrap();

        assert!(manager.remove_resource("a").unwrap());
        assert!(!manager.remove_resource("a").unwrap());
        assert!(manager.list_resources().unwrap().is_empty());
    }

    #[test]
    fn test_operation_history() {
        let manager = StateManager::in_memory().unwrap();

        let first = manager.start_operation("a", OperationKind::Create).unwrap();
        manager
            .finish_operation(first, OperationStatus::Success, Some(0), Some("ok"), None, None)
            .unwrap();
        let second = manager.start_operation("b", OperationKind::Delete).unwrap();
        manager
            .finish_operation(
                second,
                OperationStatus::Failed,
                Some(3),
                None,
                Some("boom"),
                Some("command exited with code 3"),
            )
            .unwrap();

        let all = manager.operation_history(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second);
        assert_eq!(all[0].operation, OperationKind::Delete);
        assert_eq!(all[0].status, OperationStatus::Failed);
        assert_eq!(all[0].exit_code, Some(3));

        let only_a = manager.operation_history(Some("a"), 10).unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].stdout.as_deref(), Some("ok"));
        assert!(only_a[0].completed_at.is_some());
    }

    #[test]
    fn test_recover_interrupted() {
        let manager = StateManager::in_memory().unwrap();
        let id = manager.start_operation("a", OperationKind::Update).unwrap();

        assert_eq!(manager.recover_interrupted().unwrap(), vec![id]);
        let history = manager.operation_history(Some("a"), 1).unwrap();
        assert_eq!(history[0].status, OperationStatus::Failed);
        assert_eq!(history[0].error.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");

        StateManager::new(&path)
            .unwrap()
            .save_resource("web", &state("web1a2b3c4d", "persisted"))
            .unwrap();

        let reopened = StateManager::new(&path).unwrap();
        let loaded = reopened.load_resource("web").unwrap().unwrap();
        assert_eq!(loaded.outputs.stdout, "persisted");
    }
}
