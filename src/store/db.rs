use std::path::Path;

use buildmgr_common::{ActiveProcessRecord, Artifact, BuildRecord, BuildState, BuildStatus, LaunchDescriptor};
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StoreError;

/// Synchronous SQLite access. Wrapped by [`super::Store`], which owns the
/// locking and the cache.
pub struct BuildDb {
    conn: Connection,
}

struct BuildRow {
    id: String,
    status: i64,
    result: Option<String>,
    starting: Option<String>,
    created_time: String,
}

impl BuildRow {
    fn into_record(self) -> Result<BuildRecord, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            id: self.id.clone(),
            message,
        };

        let status = BuildStatus::from_code(self.status)
            .ok_or_else(|| corrupt(format!("unknown status code {}", self.status)))?;

        let starting: Option<LaunchDescriptor> = self
            .starting
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("bad starting descriptor: {}", e)))?;
        let result: Option<serde_json::Value> = self
            .result
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt(format!("bad result payload: {}", e)))?;

        let artifact = match (starting, result) {
            (Some(starting), result) => Some(Artifact { starting, result }),
            (None, None) => None,
            (None, Some(_)) => return Err(corrupt("result without starting descriptor".into())),
        };
        let state = BuildState::from_parts(status, artifact).map_err(|e| corrupt(e.to_string()))?;

        let created_time = parse_time(&self.created_time).map_err(corrupt)?;

        Ok(BuildRecord {
            id: self.id,
            state,
            created_time,
        })
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time truncated to what the durable encoding keeps.
fn now() -> DateTime<Utc> {
    let t = Utc::now();
    t.with_nanosecond(t.nanosecond() / 1_000 * 1_000).unwrap_or(t)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{}': {}", raw, e))
}

const BUILD_COLUMNS: &str = "id, status, result, starting, created_time";

fn read_build_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BuildRow> {
    Ok(BuildRow {
        id: row.get(0)?,
        status: row.get(1)?,
        result: row.get(2)?,
        starting: row.get(3)?,
        created_time: row.get(4)?,
    })
}

impl BuildDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                status INTEGER NOT NULL,
                result TEXT,
                starting TEXT,
                created_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS process (
                id TEXT PRIMARY KEY,
                created_time TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_builds_created ON builds(created_time);
            ",
        )?;
        Ok(())
    }

    // ── Build records ─────────────────────────────────────────────────

    pub fn insert_build(&self, id: &str) -> Result<BuildRecord, StoreError> {
        let record = BuildRecord {
            id: id.to_string(),
            state: BuildState::Enqueued,
            created_time: now(),
        };
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO builds (id, status, result, starting, created_time)
             VALUES (?1, ?2, NULL, NULL, ?3)",
            params![id, record.status().code(), format_time(&record.created_time)],
        )?;
        if inserted == 0 {
            return Err(StoreError::Collision { id: id.to_string() });
        }
        Ok(record)
    }

    pub fn load_build(&self, id: &str) -> Result<Option<BuildRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM builds WHERE id = ?1", BUILD_COLUMNS),
                params![id],
                read_build_row,
            )
            .optional()?;
        row.map(BuildRow::into_record).transpose()
    }

    /// Persist status and artifact. `created_time` is never rewritten.
    pub fn write_build(&self, record: &BuildRecord) -> Result<(), StoreError> {
        let encode = |value: Result<String, serde_json::Error>| {
            value.map_err(|e| StoreError::Corrupt {
                id: record.id.clone(),
                message: e.to_string(),
            })
        };
        let (starting, result) = match record.state.artifact() {
            Some(artifact) => (
                Some(encode(serde_json::to_string(&artifact.starting))?),
                artifact
                    .result
                    .as_ref()
                    .map(|r| encode(serde_json::to_string(r)))
                    .transpose()?,
            ),
            None => (None, None),
        };

        let updated = self.conn.execute(
            "UPDATE builds SET status = ?1, result = ?2, starting = ?3 WHERE id = ?4",
            params![record.status().code(), result, starting, record.id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound { id: record.id.clone() });
        }
        Ok(())
    }

    /// Most recent first.
    pub fn list_builds(&self, limit: usize, offset: usize) -> Result<Vec<BuildRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM builds ORDER BY created_time DESC, rowid DESC LIMIT ?1 OFFSET ?2",
            BUILD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64, offset as i64], read_build_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    // ── Active process ────────────────────────────────────────────────

    pub fn get_process(&self) -> Result<Option<ActiveProcessRecord>, StoreError> {
        let row: Option<(String, String)> = self
            .conn
            .query_row("SELECT id, created_time FROM process LIMIT 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        row.map(|(id, created)| {
            let created_time = parse_time(&created).map_err(|message| StoreError::Corrupt {
                id: id.clone(),
                message,
            })?;
            Ok(ActiveProcessRecord { id, created_time })
        })
        .transpose()
    }

    pub fn create_process(&self, id: &str) -> Result<ActiveProcessRecord, StoreError> {
        let record = ActiveProcessRecord {
            id: id.to_string(),
            created_time: now(),
        };
        self.conn.execute(
            "INSERT OR REPLACE INTO process (id, created_time) VALUES (?1, ?2)",
            params![record.id, format_time(&record.created_time)],
        )?;
        Ok(record)
    }

    pub fn delete_process(&self, id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM process WHERE id = ?1", params![id])?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn raw_set_status_code(&self, id: &str, code: i64) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE builds SET status = ?1 WHERE id = ?2", params![code, id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables() -> Result<(), StoreError> {
        let db = BuildDb::new_in_memory()?;
        let count: i64 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('builds', 'process')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn test_insert_and_collision() -> Result<(), StoreError> {
        let db = BuildDb::new_in_memory()?;
        let record = db.insert_build("0badf00d")?;
        assert_eq!(record.status(), BuildStatus::Enqueued);

        let err = db.insert_build("0badf00d").unwrap_err();
        assert!(matches!(err, StoreError::Collision { .. }));
        Ok(())
    }

    #[test]
    fn test_artifact_round_trip() -> Result<(), StoreError> {
        let db = BuildDb::new_in_memory()?;
        let mut record = db.insert_build("abc12345")?;
        record.state = BuildState::Built(Artifact {
            starting: LaunchDescriptor {
                script: "dist/server.js".into(),
                interpreter: Some("node".into()),
                args: Some(vec!["--port".into(), "8080".into()]),
            },
            result: Some(serde_json::json!({"version": "1.2.3", "files": [1, 2]})),
        });
        db.write_build(&record)?;

        let loaded = db.load_build("abc12345")?.expect("record");
        assert_eq!(loaded.state, record.state);
        assert_eq!(loaded.created_time, record.created_time);
        Ok(())
    }

    #[test]
    fn test_unknown_status_code_is_corruption() -> Result<(), StoreError> {
        let db = BuildDb::new_in_memory()?;
        db.insert_build("feedface")?;
        db.raw_set_status_code("feedface", 42)?;

        let err = db.load_build("feedface").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(err.to_string().contains("42"));
        Ok(())
    }

    #[test]
    fn test_list_is_most_recent_first() -> Result<(), StoreError> {
        let db = BuildDb::new_in_memory()?;
        for id in ["00000001", "00000002", "00000003"] {
            db.insert_build(id)?;
        }
        let page = db.list_builds(2, 0)?;
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "00000003");
        assert_eq!(page[1].id, "00000002");

        let rest = db.list_builds(2, 2)?;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "00000001");
        Ok(())
    }

    #[test]
    fn test_process_singleton() -> Result<(), StoreError> {
        let db = BuildDb::new_in_memory()?;
        assert!(db.get_process()?.is_none());

        db.create_process("aaaa1111")?;
        assert_eq!(db.get_process()?.unwrap().id, "aaaa1111");

        db.delete_process("aaaa1111")?;
        assert!(db.get_process()?.is_none());
        Ok(())
    }
}
