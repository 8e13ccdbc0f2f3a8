//! SQLite store for tracked patent applications.
//!
//! Connections are opened per operation against a fixed path; SQLite's
//! busy timeout arbitrates the occasional overlap between the scheduler
//! and a foreground command. Schema upgrades are additive: every column
//! the current build knows about is ALTERed in if `PRAGMA table_info`
//! doesn't show it, so a database from any older build comes forward
//! without a version ladder.

use std::path::{Path, PathBuf};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::uspto::{
    AssignmentRecord, ContinuityData, ContinuityEntry, ContinuityRelation, DocumentInfo, PartyName,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("could not resolve application data directory")]
    DataDir,
    #[error("could not create data directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("setting {key} is not valid JSON: {source}")]
    SettingJson {
        key: String,
        source: serde_json::Error,
    },
}

pub type DbResult<T> = Result<T, DbError>;

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Declares every patents column beyond the base table, the typed patch
/// struct over them, and the SET-clause builder, so the three can never
/// drift apart.
macro_rules! patent_columns {
    ($( $name:ident : $rust:ty => $sql:literal ),+ $(,)?) => {
        const PATENT_COLUMNS_SQL: &[(&str, &str)] = &[
            $( (stringify!($name), $sql), )+
        ];

        /// A partial update to one patents row. `None` fields are left
        /// untouched, so a failed supplemental fetch never blanks data
        /// from an earlier sync.
        #[derive(Debug, Default, Clone)]
        pub struct PatentPatch {
            $( pub $name: Option<$rust>, )+
        }

        impl PatentPatch {
            fn set_clauses(&self) -> (Vec<&'static str>, Vec<Box<dyn ToSql>>) {
                let mut cols: Vec<&'static str> = Vec::new();
                let mut vals: Vec<Box<dyn ToSql>> = Vec::new();
                $(
                    if let Some(v) = &self.$name {
                        cols.push(concat!(stringify!($name), " = ?"));
                        vals.push(Box::new(v.clone()));
                    }
                )+
                (cols, vals)
            }

            pub fn is_empty(&self) -> bool {
                let mut any = false;
                $( any |= self.$name.is_some(); )+
                !any
            }
        }
    };
}

patent_columns! {
    // Core bibliographic data
    title: String => "TEXT",
    applicant: String => "TEXT",
    inventor: String => "TEXT",
    filing_date: String => "TEXT",
    current_status: String => "TEXT",
    status_date: String => "TEXT",
    status_code: i64 => "INTEGER",
    examiner: String => "TEXT",
    art_unit: String => "TEXT",
    customer_number: String => "TEXT",
    // Grant & publication
    patent_number: String => "TEXT",
    grant_date: String => "TEXT",
    publication_number: String => "TEXT",
    publication_date: String => "TEXT",
    publication_date_bag: String => "TEXT",
    publication_sequence_number_bag: String => "TEXT",
    publication_category_bag: String => "TEXT",
    // PCT / international
    pct_publication_number: String => "TEXT",
    pct_publication_date: String => "TEXT",
    international_registration_number: String => "TEXT",
    international_registration_publication_date: String => "TEXT",
    national_stage_indicator: i64 => "INTEGER",
    // Application type & classification
    application_type_code: String => "TEXT",
    application_type_label: String => "TEXT",
    application_type_category: String => "TEXT",
    uspc_class: String => "TEXT",
    uspc_subclass: String => "TEXT",
    uspc_symbol: String => "TEXT",
    cpc_classification_bag: String => "TEXT",
    // Filing & docket
    docket_number: String => "TEXT",
    confirmation_number: String => "TEXT",
    effective_filing_date: String => "TEXT",
    first_inventor_to_file: String => "TEXT",
    // Entity status
    entity_status: String => "TEXT",
    small_entity_indicator: i64 => "INTEGER",
    // Raw nested bags
    applicant_bag: String => "TEXT",
    inventor_bag: String => "TEXT",
    // Patent term adjustment
    pta_total_days: i64 => "INTEGER",
    pta_a_delay: i64 => "INTEGER",
    pta_b_delay: i64 => "INTEGER",
    pta_c_delay: i64 => "INTEGER",
    pta_applicant_delay: i64 => "INTEGER",
    pta_overlap_delay: i64 => "INTEGER",
    pta_non_overlap_delay: i64 => "INTEGER",
    pta_history: String => "TEXT",
    // Counsel & priority, serialized
    attorney_json: String => "TEXT",
    foreign_priority_json: String => "TEXT",
    // Derived & bookkeeping
    expiration_date: String => "TEXT",
    last_synced: String => "TEXT",
    nickname: String => "TEXT",
    notes: String => "TEXT",
}

/// The read model for list views. The full column set is available via
/// [`Database::patent_snapshot`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patent {
    pub id: i64,
    pub app_number: String,
    pub title: String,
    pub applicant: String,
    pub inventor: String,
    pub filing_date: String,
    pub current_status: String,
    pub status_date: String,
    pub examiner: String,
    pub art_unit: String,
    pub patent_number: String,
    pub grant_date: String,
    pub expiration_date: String,
    pub docket_number: String,
    pub nickname: String,
    pub notes: String,
    pub last_synced: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub patent_id: i64,
    pub code: String,
    pub description: String,
    pub date: String,
    pub is_new: bool,
    pub created_at: String,
}

/// An event joined with the application it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentEvent {
    pub patent_id: i64,
    pub app_number: String,
    pub code: String,
    pub description: String,
    pub date: String,
}

pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Platform data directory, e.g. `~/.local/share/patenttrack/patents.db`.
    pub fn default_path() -> DbResult<PathBuf> {
        let dir = dirs::data_dir().ok_or(DbError::DataDir)?;
        Ok(dir.join("patenttrack").join("patents.db"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> DbResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Create anything missing. Safe to run on every startup; existing
    /// rows and unknown extra columns are left alone.
    pub fn initialize(&self) -> DbResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.connect()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS patents (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 app_number TEXT NOT NULL UNIQUE,
                 created_at TEXT DEFAULT CURRENT_TIMESTAMP
             );
             CREATE TABLE IF NOT EXISTS events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 patent_id INTEGER NOT NULL,
                 event_code TEXT NOT NULL,
                 event_description TEXT DEFAULT '',
                 event_date TEXT DEFAULT '',
                 is_new INTEGER NOT NULL DEFAULT 1,
                 created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                 UNIQUE(patent_id, event_code, event_date),
                 FOREIGN KEY (patent_id) REFERENCES patents(id) ON DELETE CASCADE
             );
             CREATE TABLE IF NOT EXISTS continuity (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 patent_id INTEGER NOT NULL,
                 relation TEXT NOT NULL,
                 app_number TEXT DEFAULT '',
                 patent_number TEXT DEFAULT '',
                 filing_date TEXT DEFAULT '',
                 status TEXT DEFAULT '',
                 status_code INTEGER DEFAULT 0,
                 continuity_type TEXT DEFAULT '',
                 continuity_description TEXT DEFAULT '',
                 first_inventor_to_file INTEGER DEFAULT 0,
                 FOREIGN KEY (patent_id) REFERENCES patents(id) ON DELETE CASCADE
             );
             CREATE TABLE IF NOT EXISTS documents (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 patent_id INTEGER NOT NULL,
                 document_id TEXT NOT NULL,
                 document_code TEXT DEFAULT '',
                 description TEXT DEFAULT '',
                 official_date TEXT DEFAULT '',
                 direction TEXT DEFAULT '',
                 page_count INTEGER DEFAULT 0,
                 download_options TEXT DEFAULT '[]',
                 UNIQUE(patent_id, document_id),
                 FOREIGN KEY (patent_id) REFERENCES patents(id) ON DELETE CASCADE
             );
             CREATE TABLE IF NOT EXISTS assignments (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 patent_id INTEGER NOT NULL,
                 reel_number TEXT DEFAULT '',
                 frame_number TEXT DEFAULT '',
                 reel_frame TEXT DEFAULT '',
                 page_count INTEGER DEFAULT 0,
                 received_date TEXT DEFAULT '',
                 recorded_date TEXT DEFAULT '',
                 mailed_date TEXT DEFAULT '',
                 conveyance_text TEXT DEFAULT '',
                 assignors TEXT DEFAULT '[]',
                 assignees TEXT DEFAULT '[]',
                 document_url TEXT DEFAULT '',
                 FOREIGN KEY (patent_id) REFERENCES patents(id) ON DELETE CASCADE
             );
             CREATE TABLE IF NOT EXISTS settings (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_events_patent ON events(patent_id);
             CREATE INDEX IF NOT EXISTS idx_events_date ON events(event_date);",
        )?;

        self.add_missing_patent_columns(&conn)?;
        Ok(())
    }

    fn add_missing_patent_columns(&self, conn: &Connection) -> DbResult<()> {
        let existing: Vec<String> = {
            let mut stmt = conn.prepare("PRAGMA table_info(patents)")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
            rows.collect::<Result<_, _>>()?
        };

        for (name, sql_type) in PATENT_COLUMNS_SQL {
            if !existing.iter().any(|c| c == name) {
                debug!(column = name, "adding patents column");
                conn.execute_batch(&format!(
                    "ALTER TABLE patents ADD COLUMN {name} {sql_type}"
                ))?;
            }
        }
        Ok(())
    }

    // ---- Patents ----

    /// Track a new application. Returns `None` if it is already tracked.
    pub fn add_patent(&self, app_number: &str) -> DbResult<Option<i64>> {
        let conn = self.connect()?;
        match conn.execute(
            "INSERT INTO patents (app_number) VALUES (?1)",
            params![app_number],
        ) {
            Ok(_) => Ok(Some(conn.last_insert_rowid())),
            Err(e) if is_constraint_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a tracked application and everything hanging off it.
    pub fn remove_patent(&self, id: i64) -> DbResult<bool> {
        let conn = self.connect()?;
        let affected = conn.execute("DELETE FROM patents WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn get_patent(&self, app_number: &str) -> DbResult<Option<Patent>> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("{PATENT_SELECT} WHERE app_number = ?1"),
            params![app_number],
            row_to_patent,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn get_patent_by_id(&self, id: i64) -> DbResult<Option<Patent>> {
        let conn = self.connect()?;
        conn.query_row(
            &format!("{PATENT_SELECT} WHERE id = ?1"),
            params![id],
            row_to_patent,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_patents(&self) -> DbResult<Vec<Patent>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("{PATENT_SELECT} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_patent)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Apply a partial update. A patch with no fields set is a no-op.
    pub fn update_patent(&self, id: i64, patch: &PatentPatch) -> DbResult<()> {
        let (cols, vals) = patch.set_clauses();
        if cols.is_empty() {
            return Ok(());
        }
        let conn = self.connect()?;
        let sql = format!("UPDATE patents SET {} WHERE id = ?", cols.join(", "));
        let mut bound: Vec<&dyn ToSql> = vals.iter().map(|b| b.as_ref()).collect();
        bound.push(&id);
        conn.execute(&sql, params_from_iter(bound))?;
        Ok(())
    }

    /// Every column of one patents row as a JSON object, keyed by column
    /// name. NULLs become JSON nulls.
    pub fn patent_snapshot(&self, id: i64) -> DbResult<Option<serde_json::Value>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT * FROM patents WHERE id = ?1")?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let snapshot = stmt
            .query_row(params![id], |row| {
                let mut map = serde_json::Map::new();
                for (idx, name) in names.iter().enumerate() {
                    let value = match row.get_ref(idx)? {
                        rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                        rusqlite::types::ValueRef::Integer(n) => serde_json::Value::from(n),
                        rusqlite::types::ValueRef::Real(f) => serde_json::Value::from(f),
                        rusqlite::types::ValueRef::Text(t) => {
                            serde_json::Value::from(String::from_utf8_lossy(t).into_owned())
                        }
                        rusqlite::types::ValueRef::Blob(_) => serde_json::Value::Null,
                    };
                    map.insert(name.clone(), value);
                }
                Ok(serde_json::Value::Object(map))
            })
            .optional()?;
        Ok(snapshot)
    }

    // ---- Events ----

    /// Record a prosecution event. Returns false if the identical event
    /// (same code and date) is already stored, so re-syncs are idempotent.
    pub fn add_event(
        &self,
        patent_id: i64,
        code: &str,
        description: &str,
        date: &str,
    ) -> DbResult<bool> {
        let conn = self.connect()?;
        match conn.execute(
            "INSERT INTO events (patent_id, event_code, event_description, event_date)
             VALUES (?1, ?2, ?3, ?4)",
            params![patent_id, code, description, date],
        ) {
            Ok(_) => Ok(true),
            Err(e) if is_constraint_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn events_for_patent(&self, patent_id: i64) -> DbResult<Vec<Event>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, patent_id, event_code, event_description, event_date, is_new, created_at
             FROM events WHERE patent_id = ?1
             ORDER BY event_date DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![patent_id], row_to_event)?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Events from the last `days` days across all tracked applications,
    /// newest first, optionally restricted to a set of event codes.
    pub fn recent_events(&self, days: u32, codes: Option<&[&str]>) -> DbResult<Vec<RecentEvent>> {
        let conn = self.connect()?;
        let cutoff = format!("-{days} days");

        let mut sql = String::from(
            "SELECT e.patent_id, p.app_number, e.event_code, e.event_description, e.event_date
             FROM events e JOIN patents p ON p.id = e.patent_id
             WHERE e.event_date >= date('now', ?1)",
        );
        let mut bound: Vec<&dyn ToSql> = vec![&cutoff];
        if let Some(codes) = codes {
            if !codes.is_empty() {
                let placeholders = vec!["?"; codes.len()].join(", ");
                sql.push_str(&format!(" AND e.event_code IN ({placeholders})"));
                for code in codes {
                    bound.push(code);
                }
            }
        }
        sql.push_str(" ORDER BY e.event_date DESC, e.id DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound), |row| {
            Ok(RecentEvent {
                patent_id: row.get(0)?,
                app_number: row.get(1)?,
                code: row.get(2)?,
                description: row.get(3)?,
                date: row.get(4)?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    /// Clear the new-event flag for everything under one application.
    pub fn mark_events_seen(&self, patent_id: i64) -> DbResult<usize> {
        let conn = self.connect()?;
        let n = conn.execute(
            "UPDATE events SET is_new = 0 WHERE patent_id = ?1 AND is_new = 1",
            params![patent_id],
        )?;
        Ok(n)
    }

    pub fn count_new_events(&self, patent_id: i64) -> DbResult<i64> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT COUNT(*) FROM events WHERE patent_id = ?1 AND is_new = 1",
            params![patent_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    pub fn distinct_event_codes(&self) -> DbResult<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT event_code FROM events ORDER BY event_code")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    // ---- Continuity ----

    /// Replace the stored continuity chain wholesale. The remote payload
    /// is authoritative; there is no per-row identity to merge on.
    pub fn replace_continuity(&self, patent_id: i64, data: &ContinuityData) -> DbResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM continuity WHERE patent_id = ?1",
            params![patent_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO continuity
                     (patent_id, relation, app_number, patent_number, filing_date, status,
                      status_code, continuity_type, continuity_description, first_inventor_to_file)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let sides = [
                (ContinuityRelation::Parent, &data.parents),
                (ContinuityRelation::Child, &data.children),
            ];
            for (relation, entries) in sides {
                for e in entries {
                    stmt.execute(params![
                        patent_id,
                        relation.to_string(),
                        e.app_number,
                        e.patent_number,
                        e.filing_date,
                        e.status,
                        e.status_code,
                        e.continuity_type,
                        e.continuity_description,
                        e.first_inventor_to_file as i64,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn continuity_for_patent(&self, patent_id: i64) -> DbResult<ContinuityData> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT relation, app_number, patent_number, filing_date, status, status_code,
                    continuity_type, continuity_description, first_inventor_to_file
             FROM continuity WHERE patent_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![patent_id], |row| {
            let relation: String = row.get(0)?;
            let entry = ContinuityEntry {
                app_number: row.get(1)?,
                patent_number: row.get(2)?,
                filing_date: row.get(3)?,
                status: row.get(4)?,
                status_code: row.get(5)?,
                continuity_type: row.get(6)?,
                continuity_description: row.get(7)?,
                first_inventor_to_file: row.get::<_, i64>(8)? != 0,
            };
            Ok((relation, entry))
        })?;

        let mut data = ContinuityData::default();
        for row in rows {
            let (relation, entry) = row?;
            if relation == "parent" {
                data.parents.push(entry);
            } else {
                data.children.push(entry);
            }
        }
        Ok(data)
    }

    // ---- Documents ----

    /// Insert or refresh file-wrapper documents, keyed on the USPTO
    /// document identifier.
    pub fn upsert_documents(&self, patent_id: i64, docs: &[DocumentInfo]) -> DbResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO documents
                     (patent_id, document_id, document_code, description, official_date,
                      direction, page_count, download_options)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(patent_id, document_id) DO UPDATE SET
                     document_code = excluded.document_code,
                     description = excluded.description,
                     official_date = excluded.official_date,
                     direction = excluded.direction,
                     page_count = excluded.page_count,
                     download_options = excluded.download_options",
            )?;
            for d in docs {
                stmt.execute(params![
                    patent_id,
                    d.document_id,
                    d.document_code,
                    d.description,
                    d.date,
                    d.direction,
                    d.page_count,
                    d.download_options_json,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn documents_for_patent(&self, patent_id: i64) -> DbResult<Vec<DocumentInfo>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT document_id, document_code, description, official_date, direction,
                    page_count, download_options
             FROM documents WHERE patent_id = ?1
             ORDER BY official_date DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![patent_id], |row| {
            Ok(DocumentInfo {
                document_id: row.get(0)?,
                document_code: row.get(1)?,
                description: row.get(2)?,
                date: row.get(3)?,
                direction: row.get(4)?,
                page_count: row.get(5)?,
                download_options_json: row.get(6)?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    // ---- Assignments ----

    /// Replace stored assignments wholesale, as with continuity.
    pub fn replace_assignments(
        &self,
        patent_id: i64,
        records: &[AssignmentRecord],
    ) -> DbResult<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM assignments WHERE patent_id = ?1",
            params![patent_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO assignments
                     (patent_id, reel_number, frame_number, reel_frame, page_count,
                      received_date, recorded_date, mailed_date, conveyance_text,
                      assignors, assignees, document_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for r in records {
                stmt.execute(params![
                    patent_id,
                    r.reel_number,
                    r.frame_number,
                    r.reel_frame,
                    r.page_count,
                    r.received_date,
                    r.recorded_date,
                    r.mailed_date,
                    r.conveyance_text,
                    json_string(&r.assignors),
                    json_string(&r.assignees),
                    r.document_url,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn assignments_for_patent(&self, patent_id: i64) -> DbResult<Vec<AssignmentRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT reel_number, frame_number, reel_frame, page_count, received_date,
                    recorded_date, mailed_date, conveyance_text, assignors, assignees,
                    document_url
             FROM assignments WHERE patent_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![patent_id], |row| {
            let assignors: String = row.get(8)?;
            let assignees: String = row.get(9)?;
            Ok(AssignmentRecord {
                reel_number: row.get(0)?,
                frame_number: row.get(1)?,
                reel_frame: row.get(2)?,
                page_count: row.get(3)?,
                received_date: row.get(4)?,
                recorded_date: row.get(5)?,
                mailed_date: row.get(6)?,
                conveyance_text: row.get(7)?,
                assignors: parse_parties_json(&assignors),
                assignees: parse_parties_json(&assignees),
                document_url: row.get(10)?,
            })
        })?;
        rows.collect::<Result<_, _>>().map_err(Into::into)
    }

    // ---- Settings ----

    pub fn get_setting(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> DbResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_json_setting<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        match self.get_setting(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| DbError::SettingJson {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    pub fn set_json_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let raw = serde_json::to_string(value).map_err(|source| DbError::SettingJson {
            key: key.to_string(),
            source,
        })?;
        self.set_setting(key, &raw)
    }

    /// Raw JSON value of a setting, for callers that validate the shape
    /// themselves.
    pub fn get_raw_json_setting(&self, key: &str) -> DbResult<Option<serde_json::Value>> {
        self.get_json_setting(key)
    }
}

const PATENT_SELECT: &str = "SELECT id, app_number,
        COALESCE(title, ''), COALESCE(applicant, ''), COALESCE(inventor, ''),
        COALESCE(filing_date, ''), COALESCE(current_status, ''), COALESCE(status_date, ''),
        COALESCE(examiner, ''), COALESCE(art_unit, ''), COALESCE(patent_number, ''),
        COALESCE(grant_date, ''), COALESCE(expiration_date, ''), COALESCE(docket_number, ''),
        COALESCE(nickname, ''), COALESCE(notes, ''), COALESCE(last_synced, ''),
        COALESCE(created_at, '')
     FROM patents";

fn row_to_patent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Patent> {
    Ok(Patent {
        id: row.get(0)?,
        app_number: row.get(1)?,
        title: row.get(2)?,
        applicant: row.get(3)?,
        inventor: row.get(4)?,
        filing_date: row.get(5)?,
        current_status: row.get(6)?,
        status_date: row.get(7)?,
        examiner: row.get(8)?,
        art_unit: row.get(9)?,
        patent_number: row.get(10)?,
        grant_date: row.get(11)?,
        expiration_date: row.get(12)?,
        docket_number: row.get(13)?,
        nickname: row.get(14)?,
        notes: row.get(15)?,
        last_synced: row.get(16)?,
        created_at: row.get(17)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        patent_id: row.get(1)?,
        code: row.get(2)?,
        description: row.get(3)?,
        date: row.get(4)?,
        is_new: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

fn json_string<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".to_string())
}

fn parse_parties_json(raw: &str) -> Vec<PartyName> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(dir.path().join("patents.db"));
        db.initialize().unwrap();
        (dir, db)
    }

    #[test]
    fn add_patent_rejects_duplicates() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap();
        assert!(id.is_some());
        assert_eq!(db.add_patent("17940142").unwrap(), None);
        assert_eq!(db.list_patents().unwrap().len(), 1);
    }

    #[test]
    fn update_patch_touches_only_set_fields() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();

        let mut patch = PatentPatch::default();
        patch.title = Some("Widget".into());
        patch.current_status = Some("Docketed".into());
        db.update_patent(id, &patch).unwrap();

        let mut second = PatentPatch::default();
        second.current_status = Some("Allowed".into());
        db.update_patent(id, &second).unwrap();

        let p = db.get_patent("17940142").unwrap().unwrap();
        assert_eq!(p.title, "Widget");
        assert_eq!(p.current_status, "Allowed");
    }

    #[test]
    fn empty_patch_is_a_noop() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();
        assert!(PatentPatch::default().is_empty());
        db.update_patent(id, &PatentPatch::default()).unwrap();
    }

    #[test]
    fn add_event_is_idempotent() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();

        assert!(db.add_event(id, "CTNF", "Non-Final Rejection", "2023-01-10").unwrap());
        assert!(!db.add_event(id, "CTNF", "Non-Final Rejection", "2023-01-10").unwrap());
        // Same code on a different date is a distinct event.
        assert!(db.add_event(id, "CTNF", "Non-Final Rejection", "2024-05-02").unwrap());

        let events = db.events_for_patent(id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].date, "2024-05-02");
        assert!(events.iter().all(|e| e.is_new));
    }

    #[test]
    fn mark_events_seen_clears_flag() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();
        db.add_event(id, "CTNF", "", "2023-01-10").unwrap();
        db.add_event(id, "NOA", "", "2023-06-01").unwrap();

        assert_eq!(db.count_new_events(id).unwrap(), 2);
        assert_eq!(db.mark_events_seen(id).unwrap(), 2);
        assert_eq!(db.count_new_events(id).unwrap(), 0);
        assert_eq!(db.mark_events_seen(id).unwrap(), 0);
    }

    #[test]
    fn remove_patent_cascades() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();
        db.add_event(id, "CTNF", "", "2023-01-10").unwrap();
        db.upsert_documents(
            id,
            &[DocumentInfo {
                document_id: "DOC-1".into(),
                document_code: "CTNF".into(),
                description: String::new(),
                date: "2023-01-10".into(),
                direction: String::new(),
                page_count: 3,
                download_options_json: "[]".into(),
            }],
        )
        .unwrap();

        assert!(db.remove_patent(id).unwrap());
        assert!(!db.remove_patent(id).unwrap());
        assert!(db.get_patent("17940142").unwrap().is_none());

        let conn = db.connect().unwrap();
        let orphans: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE patent_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
        let docs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE patent_id = ?1",
                params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(docs, 0);
    }

    #[test]
    fn migration_adds_columns_to_old_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("patents.db");

        // A database created by an older build with fewer columns.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE patents (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     app_number TEXT NOT NULL UNIQUE,
                     title TEXT,
                     created_at TEXT DEFAULT CURRENT_TIMESTAMP
                 );
                 INSERT INTO patents (app_number, title) VALUES ('17940142', 'Widget');",
            )
            .unwrap();
        }

        let db = Database::new(&path);
        db.initialize().unwrap();

        // Old data survives and new columns are writable.
        let p = db.get_patent("17940142").unwrap().unwrap();
        assert_eq!(p.title, "Widget");
        let mut patch = PatentPatch::default();
        patch.pta_total_days = Some(154);
        patch.expiration_date = Some("2042-09-07".into());
        db.update_patent(p.id, &patch).unwrap();

        // Re-running initialization is harmless.
        db.initialize().unwrap();
        let after = db.get_patent("17940142").unwrap().unwrap();
        assert_eq!(after.expiration_date, "2042-09-07");
    }

    #[test]
    fn continuity_replace_is_wholesale() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();

        let first = ContinuityData {
            parents: vec![ContinuityEntry {
                app_number: "16111222".into(),
                patent_number: String::new(),
                filing_date: "2018-08-24".into(),
                status: "Patented".into(),
                status_code: 150,
                continuity_type: "CON".into(),
                continuity_description: "Continuation".into(),
                first_inventor_to_file: true,
            }],
            children: vec![],
        };
        db.replace_continuity(id, &first).unwrap();

        let second = ContinuityData {
            parents: vec![],
            children: vec![ContinuityEntry {
                app_number: "18333444".into(),
                patent_number: String::new(),
                filing_date: "2024-01-15".into(),
                status: "Pending".into(),
                status_code: 30,
                continuity_type: "DIV".into(),
                continuity_description: "Divisional".into(),
                first_inventor_to_file: false,
            }],
        };
        db.replace_continuity(id, &second).unwrap();

        let stored = db.continuity_for_patent(id).unwrap();
        assert!(stored.parents.is_empty());
        assert_eq!(stored.children.len(), 1);
        assert_eq!(stored.children[0].app_number, "18333444");
    }

    #[test]
    fn documents_upsert_refreshes_existing_rows() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();

        let mut doc = DocumentInfo {
            document_id: "DOC-1".into(),
            document_code: "CTNF".into(),
            description: "Non-Final Rejection".into(),
            date: "2023-01-10".into(),
            direction: "OUTGOING".into(),
            page_count: 0,
            download_options_json: "[]".into(),
        };
        db.upsert_documents(id, std::slice::from_ref(&doc)).unwrap();

        doc.page_count = 12;
        db.upsert_documents(id, std::slice::from_ref(&doc)).unwrap();

        let stored = db.documents_for_patent(id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].page_count, 12);
    }

    #[test]
    fn assignments_round_trip_typed_parties() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();

        let record = AssignmentRecord {
            reel_number: "60123".into(),
            frame_number: "777".into(),
            reel_frame: "60123/777".into(),
            page_count: 4,
            received_date: "2022-10-05".into(),
            recorded_date: "2022-10-07".into(),
            mailed_date: String::new(),
            conveyance_text: "ASSIGNMENT OF ASSIGNORS INTEREST".into(),
            assignors: vec![PartyName {
                name: "Ada Lovelace".into(),
                execution_date: "2022-10-01".into(),
            }],
            assignees: vec![PartyName {
                name: "Acme Corp".into(),
                execution_date: String::new(),
            }],
            document_url: String::new(),
        };
        db.replace_assignments(id, std::slice::from_ref(&record)).unwrap();

        let stored = db.assignments_for_patent(id).unwrap();
        assert_eq!(stored, vec![record]);
    }

    #[test]
    fn settings_round_trip_strings_and_json() {
        let (_dir, db) = test_db();
        assert_eq!(db.get_setting("poll_interval").unwrap(), None);

        db.set_setting("poll_interval", "1800").unwrap();
        db.set_setting("poll_interval", "3600").unwrap();
        assert_eq!(db.get_setting("poll_interval").unwrap().as_deref(), Some("3600"));

        db.set_json_setting("flags", &vec!["a", "b"]).unwrap();
        let flags: Vec<String> = db.get_json_setting("flags").unwrap().unwrap();
        assert_eq!(flags, vec!["a", "b"]);

        db.set_setting("broken", "{not json").unwrap();
        assert!(matches!(
            db.get_json_setting::<serde_json::Value>("broken"),
            Err(DbError::SettingJson { .. })
        ));
    }

    #[test]
    fn recent_events_filters_by_window_and_code() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();

        let today = chrono::Utc::now().date_naive();
        let recent = (today - chrono::Duration::days(3)).format("%Y-%m-%d").to_string();
        let stale = (today - chrono::Duration::days(90)).format("%Y-%m-%d").to_string();
        db.add_event(id, "CTNF", "Non-Final Rejection", &recent).unwrap();
        db.add_event(id, "WIDS", "IDS Filed", &recent).unwrap();
        db.add_event(id, "NOA", "Notice of Allowance", &stale).unwrap();

        let window = db.recent_events(30, None).unwrap();
        assert_eq!(window.len(), 2);

        let filtered = db.recent_events(30, Some(&["CTNF"])).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].code, "CTNF");
        assert_eq!(filtered[0].app_number, "17940142");
    }

    #[test]
    fn snapshot_exposes_every_column() {
        let (_dir, db) = test_db();
        let id = db.add_patent("17940142").unwrap().unwrap();
        let mut patch = PatentPatch::default();
        patch.title = Some("Widget".into());
        patch.pta_total_days = Some(154);
        db.update_patent(id, &patch).unwrap();

        let snap = db.patent_snapshot(id).unwrap().unwrap();
        assert_eq!(snap["app_number"], "17940142");
        assert_eq!(snap["title"], "Widget");
        assert_eq!(snap["pta_total_days"], 154);
        assert!(snap["examiner"].is_null());
        assert!(db.patent_snapshot(id + 99).unwrap().is_none());
    }
}
