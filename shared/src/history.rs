use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::nutrition::{total_calories, FoodItem};

const CURRENT_SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str = "SELECT id, created_at_ms, session, image_path, total_calories, items_json
     FROM history_entries";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode meal items: {0}")]
    Items(#[from] serde_json::Error),

    #[error("history entry {0} not found")]
    NotFound(i64),

    #[error("database version ({found}) is newer than supported schema ({supported})")]
    SchemaTooNew { found: i32, supported: i32 },

    #[error("invalid history entry: {0}")]
    Invalid(String),

    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MealSession {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
}

impl MealSession {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Breakfast => "breakfast",
            Self::Lunch => "lunch",
            Self::Dinner => "dinner",
            Self::Snack => "snack",
        }
    }

    /// Session suggested for a meal logged at `time_ms` (UTC hour of day).
    #[must_use]
    pub fn for_time(time_ms: u64) -> Self {
        let hour = (time_ms % crate::MS_PER_DAY) / (60 * 60 * 1000);
        match hour {
            4..=10 => Self::Breakfast,
            11..=15 => Self::Lunch,
            16..=21 => Self::Dinner,
            _ => Self::Snack,
        }
    }
}

impl std::str::FromStr for MealSession {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "breakfast" => Ok(Self::Breakfast),
            "lunch" => Ok(Self::Lunch),
            "dinner" => Ok(Self::Dinner),
            "snack" => Ok(Self::Snack),
            other => Err(HistoryError::Invalid(format!("unknown meal session '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHistoryEntry {
    pub created_at_ms: u64,
    pub session: MealSession,
    pub image_path: Option<String>,
    pub items: Vec<FoodItem>,
}

/// A saved meal. `total_calories` always equals the sum of its items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub created_at_ms: u64,
    pub session: MealSession,
    pub image_path: Option<String>,
    pub total_calories: u32,
    pub items: Vec<FoodItem>,
}

fn to_i64(value: u64) -> Result<i64, HistoryError> {
    i64::try_from(value).map_err(|_| HistoryError::Invalid(format!("timestamp {value} exceeds SQLite INTEGER range")))
}

fn check_items(items: &[FoodItem]) -> Result<(), HistoryError> {
    if items.is_empty() {
        return Err(HistoryError::Invalid("a meal needs at least one item".into()));
    }
    for item in items {
        item.check().map_err(|e| HistoryError::Invalid(e.to_string()))?;
    }
    Ok(())
}

fn row_to_entry(row: &Row<'_>) -> Result<HistoryEntry, HistoryError> {
    let created_at_ms: i64 = row.get("created_at_ms")?;
    let session: String = row.get("session")?;
    let total_calories: i64 = row.get("total_calories")?;
    let items_json: String = row.get("items_json")?;

    Ok(HistoryEntry {
        id: row.get("id")?,
        created_at_ms: u64::try_from(created_at_ms)
            .map_err(|_| HistoryError::Invalid(format!("negative timestamp {created_at_ms}")))?,
        session: session.parse()?,
        image_path: row.get("image_path")?,
        total_calories: u32::try_from(total_calories)
            .map_err(|_| HistoryError::Invalid(format!("bad calorie total {total_calories}")))?,
        items: serde_json::from_str(&items_json)?,
    })
}

fn run_migrations(conn: &mut Connection) -> Result<(), HistoryError> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(HistoryError::SchemaTooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)?;
        version = next_version;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    info!(version, "history schema migrated");
    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), HistoryError> {
    match version {
        1 => tx.execute_batch(include_str!("schemas/history_v1.sql"))?,
        other => {
            return Err(HistoryError::Invalid(format!(
                "no migration defined for version {other}"
            )))
        }
    }
    Ok(())
}

/// Meal log backed by SQLite.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

impl HistoryStore {
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, HistoryError> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[instrument(skip(self, entry), fields(items = entry.items.len()))]
    pub fn insert(&self, entry: NewHistoryEntry) -> Result<HistoryEntry, HistoryError> {
        check_items(&entry.items)?;
        let total = total_calories(&entry.items);
        let items_json = serde_json::to_string(&entry.items)?;

        let conn = self.conn();
        conn.execute(
            "INSERT INTO history_entries (created_at_ms, session, image_path, total_calories, items_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                to_i64(entry.created_at_ms)?,
                entry.session.as_str(),
                entry.image_path,
                i64::from(total),
                items_json,
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, total, "meal saved");

        Ok(HistoryEntry {
            id,
            created_at_ms: entry.created_at_ms,
            session: entry.session,
            image_path: entry.image_path,
            total_calories: total,
            items: entry.items,
        })
    }

    /// Rewrites an entry; the stored total is recomputed from its items.
    #[instrument(skip(self, entry), fields(id = entry.id))]
    pub fn update(&self, entry: &HistoryEntry) -> Result<HistoryEntry, HistoryError> {
        check_items(&entry.items)?;
        let total = total_calories(&entry.items);
        let items_json = serde_json::to_string(&entry.items)?;

        let changed = self.conn().execute(
            "UPDATE history_entries
             SET created_at_ms = ?1, session = ?2, image_path = ?3, total_calories = ?4, items_json = ?5
             WHERE id = ?6",
            params![
                to_i64(entry.created_at_ms)?,
                entry.session.as_str(),
                entry.image_path,
                i64::from(total),
                items_json,
                entry.id,
            ],
        )?;
        if changed == 0 {
            return Err(HistoryError::NotFound(entry.id));
        }

        Ok(HistoryEntry {
            total_calories: total,
            ..entry.clone()
        })
    }

    /// Returns false if no entry had that id.
    #[instrument(skip(self))]
    pub fn delete(&self, id: i64) -> Result<bool, HistoryError> {
        let changed = self
            .conn()
            .execute("DELETE FROM history_entries WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn get(&self, id: i64) -> Result<Option<HistoryEntry>, HistoryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        let entry = match rows.next()? {
            Some(row) => Some(row_to_entry(row)?),
            None => None,
        };
        Ok(entry)
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query_entries(
            &format!("{SELECT_COLUMNS} ORDER BY created_at_ms DESC, id DESC LIMIT ?1"),
            params![limit],
        )
    }

    /// Entries in `[start_ms, end_ms)`, oldest first.
    pub fn list_between(&self, start_ms: u64, end_ms: u64) -> Result<Vec<HistoryEntry>, HistoryError> {
        if start_ms >= end_ms {
            return Ok(Vec::new());
        }
        self.query_entries(
            &format!(
                "{SELECT_COLUMNS} WHERE created_at_ms >= ?1 AND created_at_ms < ?2
                 ORDER BY created_at_ms ASC, id ASC"
            ),
            params![to_i64(start_ms)?, to_i64(end_ms)?],
        )
    }

    /// Calories logged in `[start_ms, end_ms)`.
    pub fn total_calories_between(&self, start_ms: u64, end_ms: u64) -> Result<u32, HistoryError> {
        if start_ms >= end_ms {
            return Ok(0);
        }
        let total: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(total_calories), 0) FROM history_entries
             WHERE created_at_ms >= ?1 AND created_at_ms < ?2",
            params![to_i64(start_ms)?, to_i64(end_ms)?],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }

    pub fn count(&self) -> Result<u64, HistoryError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM history_entries", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Image path of an entry, if the entry exists and has one.
    pub fn image_path(&self, id: i64) -> Result<Option<String>, HistoryError> {
        let path: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT image_path FROM history_entries WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.flatten())
    }

    fn query_entries(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<HistoryEntry>, HistoryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(row_to_entry(row)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nutrition::{FoodSource, NutritionTable};
    use crate::MS_PER_DAY;

    fn item(name: &str, calories_per_100g: f32, grams: f32) -> FoodItem {
        NutritionTable::custom_item(name, calories_per_100g, grams).unwrap()
    }

    fn meal(created_at_ms: u64, session: MealSession, items: Vec<FoodItem>) -> NewHistoryEntry {
        NewHistoryEntry {
            created_at_ms,
            session,
            image_path: None,
            items,
        }
    }

    #[test]
    fn insert_computes_total_and_get_round_trips() {
        let store = HistoryStore::open_in_memory().unwrap();
        let saved = store
            .insert(meal(
                1_000,
                MealSession::Lunch,
                vec![item("Rice", 130.0, 200.0), item("Egg", 155.0, 50.0)],
            ))
            .unwrap();

        // 260 + 77.5 -> 260 + 78
        assert_eq!(saved.total_calories, 338);
        assert_eq!(store.get(saved.id).unwrap(), Some(saved.clone()));
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(saved.items[0].source, FoodSource::Manual);
    }

    #[test]
    fn empty_meals_are_rejected() {
        let store = HistoryStore::open_in_memory().unwrap();
        assert!(matches!(
            store.insert(meal(0, MealSession::Snack, vec![])),
            Err(HistoryError::Invalid(_))
        ));
    }

    #[test]
    fn update_recomputes_total() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut entry = store
            .insert(meal(5, MealSession::Dinner, vec![item("Soup", 50.0, 300.0)]))
            .unwrap();

        entry.items[0].set_grams(100.0).unwrap();
        entry.total_calories = 9_999;
        entry.session = MealSession::Snack;
        let updated = store.update(&entry).unwrap();

        assert_eq!(updated.total_calories, 50);
        let stored = store.get(entry.id).unwrap().unwrap();
        assert_eq!(stored.total_calories, 50);
        assert_eq!(stored.session, MealSession::Snack);
    }

    #[test]
    fn hand_edited_calories_are_rejected() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut entry = store
            .insert(meal(5, MealSession::Dinner, vec![item("Soup", 50.0, 300.0)]))
            .unwrap();

        entry.items.push(entry.items[0].clone());
        entry.items[0].calories = u32::MAX;
        entry.items[1].calories = u32::MAX;
        assert!(matches!(store.update(&entry), Err(HistoryError::Invalid(_))));
        assert_eq!(store.get(entry.id).unwrap().unwrap().total_calories, 150);
    }

    #[test]
    fn update_and_delete_missing() {
        let store = HistoryStore::open_in_memory().unwrap();
        let ghost = HistoryEntry {
            id: 42,
            created_at_ms: 0,
            session: MealSession::Lunch,
            image_path: None,
            total_calories: 0,
            items: vec![item("Tea", 1.0, 250.0)],
        };
        assert!(matches!(store.update(&ghost), Err(HistoryError::NotFound(42))));
        assert!(!store.delete(42).unwrap());
        assert_eq!(store.get(42).unwrap(), None);
    }

    #[test]
    fn range_queries_are_half_open() {
        let store = HistoryStore::open_in_memory().unwrap();
        let day = 20 * MS_PER_DAY;
        store
            .insert(meal(day - 1, MealSession::Snack, vec![item("Late", 100.0, 100.0)]))
            .unwrap();
        store
            .insert(meal(day + 10, MealSession::Breakfast, vec![item("Oats", 380.0, 50.0)]))
            .unwrap();
        store
            .insert(meal(day + 5, MealSession::Breakfast, vec![item("Milk", 60.0, 200.0)]))
            .unwrap();
        store
            .insert(meal(day + MS_PER_DAY, MealSession::Lunch, vec![item("Next", 100.0, 100.0)]))
            .unwrap();

        let today = store.list_between(day, day + MS_PER_DAY).unwrap();
        let stamps: Vec<u64> = today.iter().map(|e| e.created_at_ms).collect();
        assert_eq!(stamps, vec![day + 5, day + 10]);
        assert_eq!(store.total_calories_between(day, day + MS_PER_DAY).unwrap(), 120 + 190);
        assert_eq!(store.total_calories_between(day, day).unwrap(), 0);
        assert!(store.list_between(day + 1, day).unwrap().is_empty());
    }

    #[test]
    fn list_recent_is_newest_first() {
        let store = HistoryStore::open_in_memory().unwrap();
        for t in [30, 10, 20] {
            store
                .insert(meal(t, MealSession::Snack, vec![item("Nut", 600.0, 10.0)]))
                .unwrap();
        }
        let recent = store.list_recent(2).unwrap();
        let stamps: Vec<u64> = recent.iter().map(|e| e.created_at_ms).collect();
        assert_eq!(stamps, vec![30, 20]);
    }

    #[test]
    fn survives_reopen_and_keeps_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.sqlite3");
        let id = {
            let store = HistoryStore::open(&path).unwrap();
            let mut new = meal(7, MealSession::Lunch, vec![item("Pasta", 160.0, 250.0)]);
            new.image_path = Some("photos/abc.webp".into());
            store.insert(new).unwrap().id
        };

        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.image_path(id).unwrap().as_deref(), Some("photos/abc.webp"));
        assert_eq!(store.image_path(id + 1).unwrap(), None);

        let version: i32 = store
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.sqlite3");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        assert!(matches!(
            HistoryStore::open(&path),
            Err(HistoryError::SchemaTooNew { found: 99, .. })
        ));
    }

    #[test]
    fn session_parsing_and_time_defaults() {
        assert_eq!("dinner".parse::<MealSession>().unwrap(), MealSession::Dinner);
        assert!("brunch".parse::<MealSession>().is_err());

        let hour = 60 * 60 * 1000;
        assert_eq!(MealSession::for_time(7 * hour), MealSession::Breakfast);
        assert_eq!(MealSession::for_time(MS_PER_DAY + 12 * hour), MealSession::Lunch);
        assert_eq!(MealSession::for_time(19 * hour), MealSession::Dinner);
        assert_eq!(MealSession::for_time(23 * hour), MealSession::Snack);
    }
}
