use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::collections::{BTreeSet, HashSet};

use crate::database::Database;
use crate::error::LoadError;
use crate::progress::LoadConfiguration;

/// Entity identities currently held by in-progress jobs of any kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSet {
    entities: HashSet<String>,
}

impl LockSet {
    pub fn from_entities<I: IntoIterator<Item = String>>(entities: I) -> Self {
        Self {
            entities: entities.into_iter().collect(),
        }
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.entities.contains(entity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Advisory locks on load progress records and the entities they touch.
///
/// The lock is a flag on the persisted record plus rows in `entity_locks`;
/// callers must honour it.
pub struct LockManager;

impl LockManager {
    /// Read the shared lock set
    pub fn locked_entities(conn: &Connection) -> Result<LockSet, LoadError> {
        let mut stmt = conn.prepare("SELECT entity FROM entity_locks")?;
        let entities = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LockSet::from_entities(entities))
    }

    /// Check-and-set the lock on one record and the entities it touches.
    ///
    /// All or nothing: if the record is already locked or any participating
    /// entity is held, nothing is taken and `Ok(None)` is returned.
    pub fn acquire<'c>(
        conn: &'c Connection,
        config: &LoadConfiguration,
        holder: &str,
    ) -> Result<Option<LockGuard<'c>>, LoadError> {
        let id = config.load.load_progress_id;
        let entities: Vec<String> = config
            .participating_entities()
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let acquired = Database::immediate_transaction(conn, |c| {
            let is_locked: bool = c.query_row(
                "SELECT is_locked FROM load_progress WHERE load_progress_id = ?",
                [id],
                |row| row.get(0),
            )?;
            if is_locked {
                debug!("Load progress {} is already locked", id);
                return Ok(false);
            }

            for entity in &entities {
                let held: i64 = c.query_row(
                    "SELECT COUNT(*) FROM entity_locks WHERE entity = ?",
                    [entity],
                    |row| row.get(0),
                )?;
                if held > 0 {
                    debug!("Entity '{}' is already locked", entity);
                    return Ok(false);
                }
            }

            let now = Database::now();
            c.execute(
                "UPDATE load_progress SET is_locked = 1 WHERE load_progress_id = ?",
                [id],
            )?;
            for entity in &entities {
                c.execute(
                    "INSERT INTO entity_locks (entity, holder, locked_at) VALUES (?, ?, ?)",
                    rusqlite::params![entity, holder, now],
                )?;
            }
            Ok(true)
        })?;

        if !acquired {
            return Ok(None);
        }

        info!("Locked load progress {} for '{}'", id, holder);
        Ok(Some(LockGuard {
            conn,
            load_progress_id: id,
            entities,
            released: false,
        }))
    }

    /// Operator recovery: clear a record's lock and its entity locks,
    /// whoever holds them.
    pub fn force_unlock(conn: &Connection, config: &LoadConfiguration) -> Result<(), LoadError> {
        let entities = config.participating_entities();
        let id = config.load.load_progress_id;
        Database::immediate_transaction(conn, |c| {
            c.execute(
                "UPDATE load_progress SET is_locked = 0 WHERE load_progress_id = ?",
                [id],
            )?;
            for entity in &entities {
                c.execute("DELETE FROM entity_locks WHERE entity = ?", [entity])?;
            }
            Ok(())
        })?;
        warn!("Force-unlocked load progress {}", id);
        Ok(())
    }

    fn release_locks(
        conn: &Connection,
        load_progress_id: i64,
        entities: &[String],
    ) -> Result<(), LoadError> {
        Database::immediate_transaction(conn, |c| {
            c.execute(
                "UPDATE load_progress SET is_locked = 0 WHERE load_progress_id = ?",
                [load_progress_id],
            )?;
            for entity in entities {
                c.execute("DELETE FROM entity_locks WHERE entity = ?", [entity])?;
            }
            Ok(())
        })
    }
}

/// Scoped hold on one record's locks. Released by `release()` or, failing
/// that, when dropped, on every exit path.
pub struct LockGuard<'c> {
    conn: &'c Connection,
    load_progress_id: i64,
    entities: Vec<String>,
    released: bool,
}

impl LockGuard<'_> {
    /// Release now and report failures to the caller. After a failure the
    /// guard's `Drop` tries once more.
    pub fn release(mut self) -> Result<(), LoadError> {
        LockManager::release_locks(self.conn, self.load_progress_id, &self.entities)?;
        self.released = true;
        info!("Released locks on load progress {}", self.load_progress_id);
        Ok(())
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // A transaction left open by a failed unit must not swallow the release
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                error!("Failed to roll back open transaction before lock release: {}", e);
            }
        }
        match LockManager::release_locks(self.conn, self.load_progress_id, &self.entities) {
            Ok(()) => info!("Released locks on load progress {}", self.load_progress_id),
            Err(e) => error!(
                "Failed to release locks on load progress {}: {}",
                self.load_progress_id, e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::test_support::control_with_load;
    use crate::progress::LoadProgress;

    fn is_locked(conn: &Connection, id: i64) -> bool {
        LoadProgress::get_by_id(conn, id).unwrap().unwrap().is_locked
    }

    #[test]
    fn test_acquire_and_release() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-02-01"), 1);
        let config = LoadConfiguration::get(&conn, id).unwrap().unwrap();

        let guard = LockManager::acquire(&conn, &config, "test").unwrap().unwrap();
        assert!(is_locked(&conn, id));
        let locked = LockManager::locked_entities(&conn).unwrap();
        assert!(locked.contains(&LoadProgress::entity(id)));
        assert!(locked.contains("table:events"));

        guard.release().unwrap();
        assert!(!is_locked(&conn, id));
        assert!(LockManager::locked_entities(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_drop_releases() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-02-01"), 1);
        let config = LoadConfiguration::get(&conn, id).unwrap().unwrap();

        {
            let _guard = LockManager::acquire(&conn, &config, "test").unwrap().unwrap();
            assert!(is_locked(&conn, id));
        }

        assert!(!is_locked(&conn, id));
        assert!(LockManager::locked_entities(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_contention_takes_nothing() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-02-01"), 1);
        let config = LoadConfiguration::get(&conn, id).unwrap().unwrap();

        // Another job holds the shared table
        conn.execute(
            "INSERT INTO entity_locks (entity, holder, locked_at) VALUES ('table:events', 'other', 0)",
            [],
        )
        .unwrap();

        let guard = LockManager::acquire(&conn, &config, "test").unwrap();
        assert!(guard.is_none());
        assert!(!is_locked(&conn, id));
        assert_eq!(LockManager::locked_entities(&conn).unwrap().len(), 1);
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-02-01"), 1);
        let config = LoadConfiguration::get(&conn, id).unwrap().unwrap();

        let guard = LockManager::acquire(&conn, &config, "first").unwrap().unwrap();
        assert!(LockManager::acquire(&conn, &config, "second").unwrap().is_none());
        drop(guard);
        assert!(LockManager::acquire(&conn, &config, "second").unwrap().is_some());
    }

    #[test]
    fn test_table_listed_twice_is_locked_once() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-02-01"), 1);
        let mut config = LoadConfiguration::get(&conn, id).unwrap().unwrap();
        let table = config.columns.tables[0].clone();
        config.columns.tables.push(table);

        let guard = LockManager::acquire(&conn, &config, "test").unwrap().unwrap();
        assert_eq!(LockManager::locked_entities(&conn).unwrap().len(), 2);
        guard.release().unwrap();
        assert!(LockManager::locked_entities(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_failed_release_is_retried_on_drop() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-02-01"), 1);
        let config = LoadConfiguration::get(&conn, id).unwrap().unwrap();
        let guard = LockManager::acquire(&conn, &config, "test").unwrap().unwrap();

        // An open transaction makes the release transaction fail to start
        conn.execute_batch("BEGIN").unwrap();
        assert!(guard.release().is_err());

        assert!(!is_locked(&conn, id));
        assert!(LockManager::locked_entities(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_force_unlock() {
        let (conn, id) = control_with_load(Some("2001-01-01"), Some("2001-02-01"), 1);
        let config = LoadConfiguration::get(&conn, id).unwrap().unwrap();

        let guard = LockManager::acquire(&conn, &config, "crashed").unwrap().unwrap();
        // Simulate a killed process: the guard never runs
        std::mem::forget(guard);
        assert!(is_locked(&conn, id));

        LockManager::force_unlock(&conn, &config).unwrap();
        assert!(!is_locked(&conn, id));
        assert!(LockManager::locked_entities(&conn).unwrap().is_empty());
    }
}
