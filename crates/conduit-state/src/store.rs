//! StateStore — redb-backed state persistence for the Conduit fleet.
//!
//! Provides typed access to country counters, the geo cache, live peer
//! summaries, fleet snapshots, health records, report schedules and the
//! alert outbox. All JSON values are serialized into redb's `&[u8]` value
//! columns. Every mutation is a single write transaction, so a crash
//! leaves either the previous or the new contents, never a mix.
//!
//! Unreadable rows are treated as corruption: they are skipped with a
//! warning instead of failing the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableHandle};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Key of the single row in the snapshots table.
const LATEST: &str = "latest";

/// Everything the tracker persists at the end of one capture cycle.
#[derive(Debug, Default)]
pub struct TrafficBatch<'a> {
    /// Full counter table (absolute totals, not deltas).
    pub counters: &'a [CountryCounter],
    /// Geo cache entries resolved during this cycle.
    pub new_geo_entries: &'a [(String, String)],
    /// Full live peer table.
    pub peers: &'a [PeerSummary],
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(open_error)?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Open the store, moving a corrupted file aside and starting empty.
    pub fn open_or_reset(path: &Path) -> StateResult<Self> {
        match Self::open(path) {
            Err(StateError::Corrupted(reason)) => {
                let aside = corrupt_path(path);
                warn!(
                    ?path,
                    moved_to = ?aside,
                    %reason,
                    "state database unreadable, starting with empty state"
                );
                std::fs::rename(path, &aside).map_err(map_err!(Open))?;
                Self::open(path)
            }
            other => other,
        }
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.open_table(GEO_CACHE).map_err(map_err!(Table))?;
        txn.open_table(SCHEDULES).map_err(map_err!(Table))?;
        txn.open_table(HEALTH).map_err(map_err!(Table))?;
        txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(OUTBOX).map_err(map_err!(Table))?;
        txn.open_table(PEERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Traffic ────────────────────────────────────────────────────

    /// Load every country counter. Corrupt rows are dropped with a warning.
    pub fn load_counters(&self) -> StateResult<Vec<CountryCounter>> {
        self.list_json(COUNTERS)
    }

    /// Load the full geo cache as `ip → country`.
    pub fn load_geo_cache(&self) -> StateResult<HashMap<String, String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GEO_CACHE).map_err(map_err!(Table))?;
        let mut cache = HashMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (ip, country) = entry.map_err(map_err!(Read))?;
            cache.insert(ip.value().to_string(), country.value().to_string());
        }
        Ok(cache)
    }

    /// Load the live peer summaries written by the last tracker cycle.
    pub fn load_peers(&self) -> StateResult<Vec<PeerSummary>> {
        self.list_json(PEERS)
    }

    /// Persist one tracker cycle in a single transaction.
    ///
    /// Counters and peers replace the stored tables; geo entries are only
    /// added, never overwritten.
    pub fn persist_traffic(&self, batch: &TrafficBatch<'_>) -> StateResult<()> {
        let mut encoded = Vec::with_capacity(batch.counters.len());
        for counter in batch.counters {
            encoded.push((
                counter.country.as_str(),
                serde_json::to_vec(counter).map_err(map_err!(Serialize))?,
            ));
        }
        let mut peers = Vec::with_capacity(batch.peers.len());
        for peer in batch.peers {
            peers.push((
                peer.country.as_str(),
                serde_json::to_vec(peer).map_err(map_err!(Serialize))?,
            ));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            clear_table(&mut table)?;
            for (key, value) in &encoded {
                table.insert(*key, value.as_slice()).map_err(map_err!(Write))?;
            }

            let mut table = txn.open_table(PEERS).map_err(map_err!(Table))?;
            clear_table(&mut table)?;
            for (key, value) in &peers {
                table.insert(*key, value.as_slice()).map_err(map_err!(Write))?;
            }

            let mut geo = txn.open_table(GEO_CACHE).map_err(map_err!(Table))?;
            for (ip, country) in batch.new_geo_entries {
                if geo.get(ip.as_str()).map_err(map_err!(Read))?.is_none() {
                    geo.insert(ip.as_str(), country.as_str())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            countries = batch.counters.len(),
            new_geo = batch.new_geo_entries.len(),
            peers = batch.peers.len(),
            "traffic state persisted"
        );
        Ok(())
    }

    /// Explicitly reset all country counters and live peers.
    ///
    /// The geo cache is kept; it never needs invalidation.
    pub fn reset_counters(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            clear_table(&mut table)?;
            let mut table = txn.open_table(PEERS).map_err(map_err!(Table))?;
            clear_table(&mut table)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!("country counters reset");
        Ok(())
    }

    // ── Fleet snapshots ────────────────────────────────────────────

    /// Replace the latest fleet snapshot.
    pub fn put_latest_snapshot(&self, snapshot: &FleetSnapshot) -> StateResult<()> {
        self.put_json(SNAPSHOTS, LATEST, snapshot)
    }

    /// The most recent fleet snapshot, if the collector has run yet.
    pub fn latest_snapshot(&self) -> StateResult<Option<FleetSnapshot>> {
        self.get_json(SNAPSHOTS, LATEST)
    }

    // ── Health ─────────────────────────────────────────────────────

    /// Insert or update a health record.
    pub fn put_health(&self, record: &HealthRecord) -> StateResult<()> {
        self.put_json(HEALTH, &record.target_id, record)
    }

    /// Get a health record by target ID.
    pub fn get_health(&self, target_id: &str) -> StateResult<Option<HealthRecord>> {
        self.get_json(HEALTH, target_id)
    }

    /// List all health records.
    pub fn list_health(&self) -> StateResult<Vec<HealthRecord>> {
        self.list_json(HEALTH)
    }

    /// Delete a health record. Returns true if it existed.
    pub fn delete_health(&self, target_id: &str) -> StateResult<bool> {
        self.delete_key(HEALTH, target_id)
    }

    // ── Report schedules ───────────────────────────────────────────

    /// Insert or update a report schedule.
    pub fn put_schedule(&self, schedule: &ReportSchedule) -> StateResult<()> {
        self.put_json(SCHEDULES, schedule.kind.as_str(), schedule)
    }

    /// Get the persisted schedule of a report kind.
    pub fn get_schedule(&self, kind: ReportKind) -> StateResult<Option<ReportSchedule>> {
        self.get_json(SCHEDULES, kind.as_str())
    }

    // ── Alert outbox ───────────────────────────────────────────────

    /// Queue an immediate alert for the notification scheduler.
    pub fn enqueue_alert(&self, alert: &PendingAlert) -> StateResult<()> {
        self.put_json(OUTBOX, &alert.table_key(), alert)
    }

    /// All queued alerts, oldest first.
    pub fn pending_alerts(&self) -> StateResult<Vec<PendingAlert>> {
        self.list_json(OUTBOX)
    }

    /// Remove a dispatched alert. Returns true if it existed.
    pub fn remove_alert(&self, alert: &PendingAlert) -> StateResult<bool> {
        self.delete_key(OUTBOX, &alert.table_key())
    }

    // ── Generic JSON rows ──────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => match serde_json::from_slice(guard.value()) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(table = def.name(), %key, error = %e, "discarding unreadable row");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            match serde_json::from_slice(value.value()) {
                Ok(v) => results.push(v),
                Err(e) => {
                    warn!(table = def.name(), key = key.value(), error = %e, "discarding unreadable row");
                }
            }
        }
        Ok(results)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    #[cfg(test)]
    fn put_raw(&self, def: JsonTable, key: &str, bytes: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(key, bytes).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

/// Remove every row of a table inside an open write transaction.
fn clear_table(table: &mut redb::Table<'_, &'static str, &'static [u8]>) -> StateResult<()> {
    let keys: Vec<String> = table
        .iter()
        .map_err(map_err!(Read))?
        .filter_map(|entry| {
            let (key, _) = entry.ok()?;
            Some(key.value().to_string())
        })
        .collect();
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(())
}

/// Sort open failures into "the file is unusable" and everything else.
///
/// redb reports a bad header, a wrong magic number or a truncated file as
/// an I/O error with `InvalidData` or `UnexpectedEof`, not as `Corrupted`.
fn open_error(e: redb::DatabaseError) -> StateError {
    use std::io::ErrorKind;
    match e {
        redb::DatabaseError::Storage(redb::StorageError::Corrupted(reason)) => {
            StateError::Corrupted(reason)
        }
        redb::DatabaseError::Storage(redb::StorageError::Io(io))
            if matches!(io.kind(), ErrorKind::InvalidData | ErrorKind::UnexpectedEof) =>
        {
            StateError::Corrupted(io.to_string())
        }
        other => StateError::Open(other.to_string()),
    }
}

fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".corrupt");
    path.with_file_name(name)
}
