use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{FormBuilderError, FormBuilderResult};

/// How long a writer waits for another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ENTRY_COLUMNS: &str =
    "id, form_name, form_user, entry_data, html_headers, unique_key, entry_created_at, entry_updated_at";

/// Storage for persisted form submissions.
pub struct Database {
    conn: Mutex<Connection>,
}

/// A submission about to be written.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub form_name: &'a str,
    pub form_user: Option<&'a str>,
    pub entry_data: &'a Value,
    pub html_headers: &'a Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormEntryRecord {
    pub id: i64,
    pub form_name: String,
    pub form_user: Option<String>,
    pub entry_data: Value,
    pub html_headers: Value,
    pub unique_key: bool,
    pub entry_created_at: String,
    pub entry_updated_at: String,
}

/// Outcome of a keyed save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created(i64),
    Updated(i64),
}

impl SaveOutcome {
    pub fn id(&self) -> i64 {
        match self {
            SaveOutcome::Created(id) | SaveOutcome::Updated(id) => *id,
        }
    }
}

impl Database {
    /// Open (or create) the database file and make sure the schema exists.
    pub fn open(path: &Path) -> FormBuilderResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(anyhow::Error::from)?;
        }
        info!("SQLite database path: {:?}", path);
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> FormBuilderResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> FormBuilderResult<Self> {
        let db = Self { conn: Mutex::new(conn) };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> FormBuilderResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database connection lock poisoned").into())
    }

    /// Initialize database schema
    fn init_schema(&self) -> FormBuilderResult<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS form_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                form_name TEXT NOT NULL,
                form_user TEXT,
                entry_data TEXT NOT NULL DEFAULT '{}',
                html_headers TEXT NOT NULL DEFAULT '{}',
                unique_key INTEGER NOT NULL DEFAULT 0,
                entry_created_at TEXT NOT NULL,
                entry_updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_form_entries_form_name ON form_entries(form_name)",
            [],
        )?;

        // At most one keyed entry per (form, user).
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_form_entries_unique_user
             ON form_entries(form_name, form_user) WHERE unique_key = 1",
            [],
        )?;

        Ok(())
    }

    /// Store a new entry.
    pub fn create_entry(&self, entry: &NewEntry<'_>) -> FormBuilderResult<i64> {
        let entry_data = serde_json::to_string(entry.entry_data)?;
        let html_headers = serde_json::to_string(entry.html_headers)?;
        let now = chrono::Utc::now().to_rfc3339();

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO form_entries (form_name, form_user, entry_data, html_headers, unique_key, entry_created_at, entry_updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![entry.form_name, entry.form_user, entry_data, html_headers, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(form = entry.form_name, id, "created form entry");
        Ok(id)
    }

    /// Get-or-create keyed by `(form_name, user)`, then write the new data.
    ///
    /// Runs in an immediate transaction so concurrent submissions for the same
    /// pair serialize on the write lock; the partial unique index backs it up.
    pub fn save_unique_entry(&self, entry: &NewEntry<'_>, user: &str) -> FormBuilderResult<SaveOutcome> {
        let entry_data = serde_json::to_string(entry.entry_data)?;
        let html_headers = serde_json::to_string(entry.html_headers)?;
        let now = chrono::Utc::now().to_rfc3339();

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM form_entries WHERE form_name = ?1 AND form_user = ?2 AND unique_key = 1",
                params![entry.form_name, user],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE form_entries SET entry_data = ?1, html_headers = ?2, entry_updated_at = ?3 WHERE id = ?4",
                    params![entry_data, html_headers, now, id],
                )?;
                SaveOutcome::Updated(id)
            }
            None => {
                tx.execute(
                    "INSERT INTO form_entries (form_name, form_user, entry_data, html_headers, unique_key, entry_created_at, entry_updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
                    params![entry.form_name, user, entry_data, html_headers, now],
                )?;
                SaveOutcome::Created(tx.last_insert_rowid())
            }
        };
        tx.commit()?;
        debug!(form = entry.form_name, user, ?outcome, "saved unique form entry");
        Ok(outcome)
    }

    pub fn get_entry(&self, id: i64) -> FormBuilderResult<Option<FormEntryRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM form_entries WHERE id = ?1", ENTRY_COLUMNS);
        let record = conn.query_row(&sql, params![id], Self::map_entry).optional()?;
        Ok(record)
    }

    /// Entries newest first, optionally restricted to one form.
    pub fn list_entries(&self, form_name: Option<&str>, limit: Option<i64>) -> FormBuilderResult<Vec<FormEntryRecord>> {
        let limit = limit.unwrap_or(100);
        let conn = self.conn()?;

        let mut entries = Vec::new();
        if let Some(form_name) = form_name {
            let sql = format!(
                "SELECT {} FROM form_entries WHERE form_name = ?1 ORDER BY id DESC LIMIT ?2",
                ENTRY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![form_name, limit], Self::map_entry)?;
            for row in rows {
                entries.push(row?);
            }
        } else {
            let sql = format!(
                "SELECT {} FROM form_entries ORDER BY id DESC LIMIT ?1",
                ENTRY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit], Self::map_entry)?;
            for row in rows {
                entries.push(row?);
            }
        }

        Ok(entries)
    }

    pub fn count_entries(&self, form_name: Option<&str>) -> FormBuilderResult<i64> {
        let conn = self.conn()?;
        let count = match form_name {
            Some(name) => conn.query_row(
                "SELECT COUNT(*) FROM form_entries WHERE form_name = ?1",
                params![name],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM form_entries", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// Replace the stored data of an entry (admin edit).
    pub fn update_entry_data(&self, id: i64, entry_data: &Value) -> FormBuilderResult<()> {
        let data = serde_json::to_string(entry_data)?;
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE form_entries SET entry_data = ?1, entry_updated_at = ?2 WHERE id = ?3",
            params![data, now, id],
        )?;
        if changed == 0 {
            return Err(FormBuilderError::not_found(format!("form entry {}", id)));
        }
        Ok(())
    }

    /// Delete an entry. Returns whether a row was removed.
    pub fn delete_entry(&self, id: i64) -> FormBuilderResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM form_entries WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn map_entry(row: &rusqlite::Row) -> rusqlite::Result<FormEntryRecord> {
        Ok(FormEntryRecord {
            id: row.get(0)?,
            form_name: row.get(1)?,
            form_user: row.get(2)?,
            entry_data: row.get::<_, String>(3)?.parse().unwrap_or(Value::Null),
            html_headers: row.get::<_, String>(4)?.parse().unwrap_or(Value::Null),
            unique_key: row.get::<_, i64>(5)? != 0,
            entry_created_at: row.get(6)?,
            entry_updated_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Barrier};

    fn new_entry<'a>(form: &'a str, user: Option<&'a str>, data: &'a Value, headers: &'a Value) -> NewEntry<'a> {
        NewEntry {
            form_name: form,
            form_user: user,
            entry_data: data,
            html_headers: headers,
        }
    }

    #[test]
    fn test_create_and_get_entry() {
        let db = Database::open_in_memory().unwrap();
        let data = json!({"name": "John Doe", "tags": ["a", "b"], "agree": true, "amount": "12.50"});
        let headers = json!({"user_agent": "Mozilla/5.0", "referer": "http://example.com"});
        let id = db.create_entry(&new_entry("contact", Some("alice"), &data, &headers)).unwrap();

        let entry = db.get_entry(id).unwrap().unwrap();
        assert_eq!(entry.form_name, "contact");
        assert_eq!(entry.form_user.as_deref(), Some("alice"));
        assert_eq!(entry.entry_data, data);
        assert_eq!(entry.html_headers["user_agent"], "Mozilla/5.0");
        assert!(!entry.unique_key);
        assert!(db.get_entry(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_unique_entry_is_updated_not_duplicated() {
        let db = Database::open_in_memory().unwrap();
        let headers = json!({});
        let first = json!({"message": "first"});
        let second = json!({"message": "second"});

        let created = db.save_unique_entry(&new_entry("poll", None, &first, &headers), "bob").unwrap();
        let updated = db.save_unique_entry(&new_entry("poll", None, &second, &headers), "bob").unwrap();

        assert!(matches!(created, SaveOutcome::Created(_)));
        assert_eq!(updated, SaveOutcome::Updated(created.id()));
        assert_eq!(db.count_entries(Some("poll")).unwrap(), 1);
        let entry = db.get_entry(created.id()).unwrap().unwrap();
        assert_eq!(entry.entry_data, second);
        assert_eq!(entry.form_user.as_deref(), Some("bob"));

        db.save_unique_entry(&new_entry("poll", None, &first, &headers), "carol").unwrap();
        assert_eq!(db.count_entries(Some("poll")).unwrap(), 2);
    }

    #[test]
    fn test_concurrent_unique_saves_from_separate_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.db");
        Database::open(&path).unwrap();

        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));
        let outcomes: Vec<SaveOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let barrier = barrier.clone();
                    let path = path.clone();
                    scope.spawn(move || {
                        let db = Database::open(&path).unwrap();
                        let data = json!({"vote": i});
                        let headers = json!({});
                        barrier.wait();
                        db.save_unique_entry(&new_entry("poll", None, &data, &headers), "bob").unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let created = outcomes.iter().filter(|o| matches!(o, SaveOutcome::Created(_))).count();
        assert_eq!(created, 1);
        let id = outcomes[0].id();
        assert!(outcomes.iter().all(|o| o.id() == id));

        let db = Database::open(&path).unwrap();
        assert_eq!(db.count_entries(Some("poll")).unwrap(), 1);
    }

    #[test]
    fn test_list_count_update_delete() {
        let db = Database::open_in_memory().unwrap();
        let headers = json!({});
        for i in 0..3 {
            let data = json!({"n": i});
            db.create_entry(&new_entry("a", None, &data, &headers)).unwrap();
        }
        let other = json!({});
        db.create_entry(&new_entry("b", None, &other, &headers)).unwrap();

        assert_eq!(db.count_entries(None).unwrap(), 4);
        let listed = db.list_entries(Some("a"), None).unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].entry_data, json!({"n": 2}));
        assert_eq!(db.list_entries(None, Some(2)).unwrap().len(), 2);

        let id = listed[0].id;
        db.update_entry_data(id, &json!({"n": 42})).unwrap();
        assert_eq!(db.get_entry(id).unwrap().unwrap().entry_data, json!({"n": 42}));
        assert!(matches!(
            db.update_entry_data(9999, &json!({})),
            Err(FormBuilderError::NotFound(_))
        ));

        assert!(db.delete_entry(id).unwrap());
        assert!(!db.delete_entry(id).unwrap());
        assert_eq!(db.count_entries(Some("a")).unwrap(), 2);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("entries.db");
        let db = Database::open(&path).unwrap();
        assert_eq!(db.count_entries(None).unwrap(), 0);
        assert!(path.exists());
    }
}
