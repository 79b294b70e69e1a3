//! Extension record store contract with SQLite and in-memory implementations.
//!
//! # Responsibility
//! - Provide `get/put/delete/list` over one row per extension id.
//! - Map rows to `ExtensionRecord` and back.
//!
//! # Invariants
//! - `put` is an upsert keyed by id.
//! - Stores are shared across threads; implementations serialize writers
//!   internally.

use crate::db::{open_db, open_db_in_memory, DbError};
use crate::model::extension::{
    BootstrapHook, ExtensionId, ExtensionKind, ExtensionRecord, ExtensionStatus,
    ModelValidationError,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

const EXTENSION_SELECT_SQL: &str = "SELECT
    id,
    name,
    type,
    owner,
    status,
    bootstrap,
    schema_version,
    weight,
    installed_at,
    changed_at,
    info
FROM extensions";

pub type RepoResult<T> = Result<T, RepoError>;

/// Store error for extension record persistence.
#[derive(Debug)]
pub enum RepoError {
    Validation(ModelValidationError),
    Db(DbError),
    NotFound(ExtensionId),
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "extension record not found: {id}"),
            Self::InvalidData(message) => {
                write!(f, "invalid persisted extension data: {message}")
            }
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound(_) | Self::InvalidData(_) => None,
        }
    }
}

impl From<ModelValidationError> for RepoError {
    fn from(value: ModelValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Persistent key/value table of extension records keyed by id.
pub trait ExtensionStore: Send + Sync {
    fn get(&self, id: &str) -> RepoResult<Option<ExtensionRecord>>;
    /// Inserts or replaces the record with the same id.
    fn put(&self, record: &ExtensionRecord) -> RepoResult<()>;
    /// Removes the record; `NotFound` when no row exists.
    fn delete(&self, id: &str) -> RepoResult<()>;
    /// Lists all records ordered by id.
    fn list(&self) -> RepoResult<Vec<ExtensionRecord>>;
}

/// SQLite-backed extension store.
pub struct SqliteExtensionStore {
    conn: Mutex<Connection>,
}

impl SqliteExtensionStore {
    /// Wraps a connection that already has registry migrations applied.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Opens (and migrates) a registry database file.
    pub fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
        Ok(Self::new(open_db(path)?))
    }

    /// Opens (and migrates) an in-memory registry database.
    pub fn open_in_memory() -> RepoResult<Self> {
        Ok(Self::new(open_db_in_memory()?))
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ExtensionStore for SqliteExtensionStore {
    fn get(&self, id: &str) -> RepoResult<Option<ExtensionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{EXTENSION_SELECT_SQL} WHERE id = ?1;"))?;
        let row = stmt
            .query_row([id], |row| Ok(parse_extension_row(row)))
            .optional()?;
        row.transpose()
    }

    fn put(&self, record: &ExtensionRecord) -> RepoResult<()> {
        record.validate()?;
        let info = serde_json::to_string(&record.info).map_err(|err| {
            RepoError::InvalidData(format!("cannot serialize info for `{}`: {err}", record.id))
        })?;

        self.conn().execute(
            "INSERT INTO extensions (
                id,
                name,
                type,
                owner,
                status,
                bootstrap,
                schema_version,
                weight,
                installed_at,
                changed_at,
                info
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                type = excluded.type,
                owner = excluded.owner,
                status = excluded.status,
                bootstrap = excluded.bootstrap,
                schema_version = excluded.schema_version,
                weight = excluded.weight,
                installed_at = excluded.installed_at,
                changed_at = excluded.changed_at,
                info = excluded.info;",
            params![
                record.id.as_str(),
                record.name.as_str(),
                record.kind.as_str(),
                record.owner.as_str(),
                status_to_db(record.status),
                bootstrap_to_db(&record.bootstrap),
                record.schema_version,
                record.weight,
                record.installed_at,
                record.changed_at,
                info,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &str) -> RepoResult<()> {
        let changed = self
            .conn()
            .execute("DELETE FROM extensions WHERE id = ?1;", [id])?;
        if changed == 0 {
            return Err(RepoError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn list(&self) -> RepoResult<Vec<ExtensionRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{EXTENSION_SELECT_SQL} ORDER BY id ASC;"))?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_extension_row(row)?);
        }
        Ok(records)
    }
}

/// In-memory extension store for embedding hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryExtensionStore {
    rows: RwLock<BTreeMap<ExtensionId, ExtensionRecord>>,
}

impl MemoryExtensionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExtensionStore for MemoryExtensionStore {
    fn get(&self, id: &str) -> RepoResult<Option<ExtensionRecord>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(id).cloned())
    }

    fn put(&self, record: &ExtensionRecord) -> RepoResult<()> {
        record.validate()?;
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        rows.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> RepoResult<()> {
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        match rows.remove(id) {
            Some(_) => Ok(()),
            None => Err(RepoError::NotFound(id.to_string())),
        }
    }

    fn list(&self) -> RepoResult<Vec<ExtensionRecord>> {
        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.values().cloned().collect())
    }
}

fn parse_extension_row(row: &Row<'_>) -> RepoResult<ExtensionRecord> {
    let id: String = row.get("id")?;

    let type_text: String = row.get("type")?;
    let kind = ExtensionKind::parse(&type_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid type `{type_text}` in extensions.type"))
    })?;

    let status = match row.get::<_, i64>("status")? {
        0 => ExtensionStatus::Disabled,
        1 => ExtensionStatus::Enabled,
        other => {
            return Err(RepoError::InvalidData(format!(
                "invalid status value `{other}` in extensions.status"
            )));
        }
    };

    let bootstrap_text: String = row.get("bootstrap")?;
    let bootstrap = parse_bootstrap(&bootstrap_text)?;

    let info_text: String = row.get("info")?;
    let info: Value = serde_json::from_str(&info_text).map_err(|err| {
        RepoError::InvalidData(format!("invalid json in extensions.info for `{id}`: {err}"))
    })?;

    let record = ExtensionRecord {
        id,
        name: row.get("name")?,
        kind,
        owner: row.get("owner")?,
        status,
        schema_version: row.get("schema_version")?,
        weight: row.get("weight")?,
        bootstrap,
        installed_at: row.get("installed_at")?,
        changed_at: row.get("changed_at")?,
        info,
    };
    record.validate()?;
    Ok(record)
}

fn status_to_db(status: ExtensionStatus) -> i64 {
    match status {
        ExtensionStatus::Disabled => 0,
        ExtensionStatus::Enabled => 1,
    }
}

fn bootstrap_to_db(flags: &BTreeSet<BootstrapHook>) -> String {
    flags
        .iter()
        .map(|flag| flag.hook_name())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_bootstrap(value: &str) -> RepoResult<BTreeSet<BootstrapHook>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            BootstrapHook::parse(part).ok_or_else(|| {
                RepoError::InvalidData(format!(
                    "invalid bootstrap flag `{part}` in extensions.bootstrap"
                ))
            })
        })
        .collect()
}
