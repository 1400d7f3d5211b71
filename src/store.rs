// 🗄️ Aggregate Store - bounded working set over a durable key-value backend
//
// Only `working_set` states stay in memory. Least-recently-used states are
// written back to the backend (SQLite in production) and reloaded on demand.

use crate::aggregate::{AggregateState, GroupKey, Namespace};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::path::Path;
use tempfile::TempDir;
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite backend failure: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("could not encode or decode aggregate state: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("corrupt store entry: {0}")]
    Corrupt(String),

    #[error("could not prepare scratch store: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

pub type Entry = (Vec<u8>, Vec<u8>);

/// Durable map from opaque byte keys to opaque byte values.
///
/// No multi-key atomicity is required. `scan_page` must return keys in
/// ascending byte order.
pub trait KvBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Write a batch of entries. Backends may group them into one transaction.
    fn set_many(&mut self, entries: &[Entry]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Up to `limit` entries whose key starts with `prefix`, strictly after
    /// `after` when given.
    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<Entry>, StoreError>;
}

// ============================================================================
// SQLITE BACKEND
// ============================================================================

pub struct SqliteBackend {
    conn: Connection,
    // Dropped after `conn`, so the file is closed before the directory goes.
    _scratch: Option<TempDir>,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        setup_store(&conn)?;
        Ok(SqliteBackend { conn, _scratch: None })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        setup_store(&conn)?;
        Ok(SqliteBackend { conn, _scratch: None })
    }

    /// Store in a fresh temporary directory, removed when the backend drops.
    pub fn scratch() -> Result<Self, StoreError> {
        let dir = tempfile::Builder::new().prefix("find-donors-").tempdir()?;
        let path = dir.path().join("aggregates.db");
        let conn = Connection::open(&path)?;
        setup_store(&conn)?;
        debug!("Scratch store at {}", path.display());
        Ok(SqliteBackend { conn, _scratch: Some(dir) })
    }

    /// Drop every stored state, e.g. left over from an earlier run.
    pub fn reset(&mut self) -> Result<(), StoreError> {
        let removed = self.conn.execute("DELETE FROM aggregates", [])?;
        if removed > 0 {
            debug!("Cleared {} stale states", removed);
        }
        Ok(())
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM aggregates", [], |row| row.get(0))?;
        Ok(count)
    }
}

pub fn setup_store(conn: &Connection) -> Result<(), StoreError> {
    // WAL for write throughput; crash recovery is not needed, so skip fsync
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "OFF")?;
    debug!("Store journal mode: {}", mode);

    conn.execute(
        "CREATE TABLE IF NOT EXISTS aggregates (
            key BLOB PRIMARY KEY,
            value BLOB NOT NULL
        ) WITHOUT ROWID",
        [],
    )?;

    Ok(())
}

impl KvBackend for SqliteBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let mut stmt = self.conn.prepare_cached("SELECT value FROM aggregates WHERE key = ?1")?;
        let value = stmt.query_row(params![key], |row| row.get(0)).optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO aggregates (key, value) VALUES (?1, ?2)")?
            .execute(params![key, value])?;
        Ok(())
    }

    fn set_many(&mut self, entries: &[Entry]) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("INSERT OR REPLACE INTO aggregates (key, value) VALUES (?1, ?2)")?;
            for (key, value) in entries {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<Entry>, StoreError> {
        // BLOBs compare with memcmp, so ORDER BY key is byte order
        let (sql, lower) = match after {
            Some(after) => ("SELECT key, value FROM aggregates WHERE key > ?1 ORDER BY key LIMIT ?2", after),
            None => ("SELECT key, value FROM aggregates WHERE key >= ?1 ORDER BY key LIMIT ?2", prefix),
        };

        // A negative LIMIT means "no limit" to SQLite
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params![lower, limit], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<Entry>, _>>()?;

        Ok(rows
            .into_iter()
            .take_while(|(key, _)| key.starts_with(prefix))
            .collect())
    }
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

/// BTreeMap-backed backend for tests and small inputs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn scan_page(&self, prefix: &[u8], after: Option<&[u8]>, limit: usize) -> Result<Vec<Entry>, StoreError> {
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };

        Ok(self
            .entries
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ============================================================================
// AGGREGATE STORE
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Maximum number of states kept in memory.
    pub working_set: usize,
    /// States written back per eviction round.
    pub evict_batch: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            working_set: 100_000,
            evict_batch: 1_024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Served from the working set.
    pub hits: u64,
    /// Reloaded from the backend.
    pub loads: u64,
    /// First sighting of a key.
    pub creates: u64,
    pub evictions: u64,
    /// Dirty states written to the backend (eviction or flush).
    pub write_backs: u64,
}

struct Resident {
    state: AggregateState,
    dirty: bool,
    stamp: u64,
}

/// Key -> AggregateState map with a bounded resident set.
///
/// Every update is a `get_or_create` -> mutate -> `put` cycle. While a state
/// is checked out it is absent from the working set; callers keep at most
/// one state in flight.
pub struct AggregateStore<B: KvBackend> {
    backend: B,
    config: StoreConfig,
    resident: HashMap<Vec<u8>, Resident>,
    // LRU order; entries whose stamp no longer matches `resident` are ghosts
    recency: VecDeque<(Vec<u8>, u64)>,
    clock: u64,
    stats: StoreStats,
}

impl<B: KvBackend> AggregateStore<B> {
    pub fn new(backend: B, config: StoreConfig) -> Self {
        let config = StoreConfig {
            working_set: config.working_set.max(1),
            evict_batch: config.evict_batch.max(1),
        };

        AggregateStore {
            backend,
            config,
            resident: HashMap::new(),
            recency: VecDeque::new(),
            clock: 0,
            stats: StoreStats::default(),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn resident_len(&self) -> usize {
        self.resident.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Check out the state for `key`, loading or creating it as needed.
    pub fn get_or_create(&mut self, key: &GroupKey) -> Result<AggregateState, StoreError> {
        let encoded = key.encode();

        if let Some(resident) = self.resident.remove(&encoded) {
            self.stats.hits += 1;
            return Ok(resident.state);
        }

        match self.backend.get(&encoded)? {
            Some(bytes) => {
                self.stats.loads += 1;
                decode_state(key, &bytes)
            }
            None => {
                self.stats.creates += 1;
                Ok(AggregateState::default())
            }
        }
    }

    /// Return a checked-out state. It becomes the most recently used entry.
    pub fn put(&mut self, key: &GroupKey, state: AggregateState) -> Result<(), StoreError> {
        let encoded = key.encode();
        self.clock += 1;
        let stamp = self.clock;

        self.resident.insert(
            encoded.clone(),
            Resident {
                state,
                dirty: true,
                stamp,
            },
        );
        self.recency.push_back((encoded, stamp));

        if self.resident.len() > self.config.working_set {
            self.evict_lru()?;
        }
        let compact_at = self
            .config
            .working_set
            .saturating_mul(2)
            .saturating_add(self.config.evict_batch);
        if self.recency.len() > compact_at {
            self.compact_recency();
        }

        Ok(())
    }

    /// Write every dirty resident state to the backend.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        let mut batch = Vec::new();

        for (key, resident) in self.resident.iter_mut().filter(|(_, r)| r.dirty) {
            batch.push((key.clone(), serde_json::to_vec(&resident.state)?));
            resident.dirty = false;

            if batch.len() >= self.config.evict_batch {
                self.stats.write_backs += batch.len() as u64;
                self.backend.set_many(&batch)?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            self.stats.write_backs += batch.len() as u64;
            self.backend.set_many(&batch)?;
        }

        Ok(())
    }

    /// Flush, then stream every state in `namespace` in key byte order.
    pub fn scan(&mut self, namespace: Namespace) -> Result<Scan<'_, B>, StoreError> {
        self.flush()?;
        Ok(Scan {
            backend: &self.backend,
            prefix: vec![namespace.tag()],
            after: None,
            page: Vec::new().into_iter(),
            page_size: self.config.evict_batch,
            exhausted: false,
        })
    }

    fn evict_lru(&mut self) -> Result<(), StoreError> {
        let mut batch = Vec::new();
        let mut evicted = 0;

        while evicted < self.config.evict_batch {
            let Some((key, stamp)) = self.recency.pop_front() else {
                break;
            };

            let live = self.resident.get(&key).is_some_and(|r| r.stamp == stamp);
            if !live {
                continue;
            }

            if let Some(resident) = self.resident.remove(&key) {
                if resident.dirty {
                    batch.push((key, serde_json::to_vec(&resident.state)?));
                }
                evicted += 1;
            }
        }

        if !batch.is_empty() {
            self.backend.set_many(&batch)?;
        }

        self.stats.evictions += evicted as u64;
        self.stats.write_backs += batch.len() as u64;
        debug!(
            "Evicted {} states ({} written back), {} resident",
            evicted,
            batch.len(),
            self.resident.len()
        );

        Ok(())
    }

    fn compact_recency(&mut self) {
        let resident = &self.resident;
        self.recency
            .retain(|(key, stamp)| resident.get(key).is_some_and(|r| r.stamp == *stamp));
    }
}

/// Decode a persisted state and check it agrees with its own tracker.
fn decode_state(key: &GroupKey, bytes: &[u8]) -> Result<AggregateState, StoreError> {
    let state: AggregateState = serde_json::from_slice(bytes)?;
    if state.count != state.tracker.len() {
        return Err(StoreError::Corrupt(format!(
            "{}: count {} but tracker holds {}",
            key,
            state.count,
            state.tracker.len()
        )));
    }
    Ok(state)
}

/// Paged, ordered iteration over one namespace.
pub struct Scan<'a, B: KvBackend> {
    backend: &'a B,
    prefix: Vec<u8>,
    after: Option<Vec<u8>>,
    page: std::vec::IntoIter<Entry>,
    page_size: usize,
    exhausted: bool,
}

impl<B: KvBackend> Scan<'_, B> {
    fn decode(entry: Entry) -> Result<(GroupKey, AggregateState), StoreError> {
        let (key, value) = entry;
        let group_key = GroupKey::decode(&key)
            .ok_or_else(|| StoreError::Corrupt(format!("undecodable key {:?}", String::from_utf8_lossy(&key))))?;
        let state = decode_state(&group_key, &value)?;
        Ok((group_key, state))
    }
}

impl<B: KvBackend> Iterator for Scan<'_, B> {
    type Item = Result<(GroupKey, AggregateState), StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.page.next() {
                return Some(Self::decode(entry));
            }
            if self.exhausted {
                return None;
            }

            let page = match self.backend.scan_page(&self.prefix, self.after.as_deref(), self.page_size) {
                Ok(page) => page,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            };

            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some((last, _)) = page.last() {
                self.after = Some(last.clone());
            }
            self.page = page.into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TransactionDate;

    fn zip_key(recipient: &str, zip: &str) -> GroupKey {
        GroupKey::Zip {
            recipient_id: recipient.to_string(),
            zip5: zip.to_string(),
        }
    }

    fn date_key(recipient: &str, date: &str) -> GroupKey {
        GroupKey::Date {
            recipient_id: recipient.to_string(),
            transaction_date: TransactionDate::parse(date).unwrap(),
        }
    }

    fn absorb<B: KvBackend>(store: &mut AggregateStore<B>, key: &GroupKey, amount: u64) -> AggregateState {
        let mut state = store.get_or_create(key).unwrap();
        state.absorb(amount);
        store.put(key, state.clone()).unwrap();
        state
    }

    #[test]
    fn test_create_then_reuse() {
        let mut store = AggregateStore::new(MemoryBackend::new(), StoreConfig::default());
        let key = zip_key("A", "12345");

        let first = absorb(&mut store, &key, 100);
        let second = absorb(&mut store, &key, 300);

        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(second.total_cents, 400);
        assert_eq!(second.median(), Ok(200));
        assert_eq!(store.stats().creates, 1);
        assert_eq!(store.stats().hits, 1);
    }

    #[test]
    fn test_working_set_is_bounded() {
        let config = StoreConfig {
            working_set: 4,
            evict_batch: 2,
        };
        let mut store = AggregateStore::new(MemoryBackend::new(), config);

        for i in 0..100 {
            absorb(&mut store, &zip_key(&format!("C{:03}", i), "12345"), i);
            assert!(store.resident_len() <= 4);
        }

        assert_eq!(store.stats().creates, 100);
        assert!(store.stats().evictions >= 96);
        assert!(store.backend().len() >= 96);
    }

    #[test]
    fn test_evicted_state_reloads_intact() {
        let config = StoreConfig {
            working_set: 1,
            evict_batch: 1,
        };
        let mut store = AggregateStore::new(MemoryBackend::new(), config);
        let a = zip_key("A", "11111");
        let b = zip_key("B", "22222");

        absorb(&mut store, &a, 10);
        absorb(&mut store, &a, 30);
        absorb(&mut store, &b, 5); // evicts A
        let reloaded = absorb(&mut store, &a, 20);

        assert_eq!(reloaded.count, 3);
        assert_eq!(reloaded.total_cents, 60);
        assert_eq!(reloaded.median(), Ok(20));
        assert!(store.stats().loads >= 1);
    }

    #[test]
    fn test_recency_queue_stays_bounded_for_hot_keys() {
        let config = StoreConfig {
            working_set: 8,
            evict_batch: 4,
        };
        let mut store = AggregateStore::new(MemoryBackend::new(), config);
        let key = zip_key("HOT", "12345");

        for i in 0..10_000 {
            absorb(&mut store, &key, i);
        }

        assert!(store.recency.len() <= 2 * 8 + 4 + 1);
        assert_eq!(store.stats().evictions, 0);
    }

    #[test]
    fn test_scan_orders_date_keys() {
        let config = StoreConfig {
            working_set: 2,
            evict_batch: 1,
        };
        let mut store = AggregateStore::new(MemoryBackend::new(), config);

        absorb(&mut store, &date_key("B", "01012020"), 1);
        absorb(&mut store, &zip_key("A", "12345"), 1);
        absorb(&mut store, &date_key("A", "01012020"), 2);
        absorb(&mut store, &date_key("A", "12312019"), 3);
        absorb(&mut store, &date_key("A", "01012020"), 4);

        let scanned: Vec<(String, u64)> = store
            .scan(Namespace::Date)
            .unwrap()
            .map(|r| r.map(|(k, s)| (k.to_string(), s.count)))
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            scanned,
            vec![
                ("A|12312019".to_string(), 1),
                ("A|01012020".to_string(), 2),
                ("B|01012020".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_corrupt_value_is_reported() {
        let mut backend = MemoryBackend::new();
        let key = zip_key("A", "12345");
        backend.set(&key.encode(), b"{not json").unwrap();

        let mut store = AggregateStore::new(backend, StoreConfig::default());
        assert!(matches!(store.get_or_create(&key), Err(StoreError::Codec(_))));
    }

    #[test]
    fn test_huge_working_set_does_not_overflow() {
        let config = StoreConfig {
            working_set: usize::MAX,
            evict_batch: usize::MAX,
        };
        let mut store = AggregateStore::new(MemoryBackend::new(), config);
        let key = zip_key("A", "12345");

        for i in 0..10 {
            absorb(&mut store, &key, i);
        }

        // No compaction threshold reached, so every cycle left a queue entry
        assert_eq!(store.recency.len(), 10);
        assert_eq!(store.stats().hits, 9);
    }

    #[test]
    fn test_scan_rejects_count_tracker_mismatch() {
        let mut backend = MemoryBackend::new();
        let key = date_key("A", "01012020");
        backend
            .set(&key.encode(), br#"{"count":5,"total_cents":10,"tracker":{"lower":[10],"upper":[]}}"#)
            .unwrap();

        let mut store = AggregateStore::new(backend, StoreConfig::default());
        let first = store.scan(Namespace::Date).unwrap().next();

        assert!(matches!(first, Some(Err(StoreError::Corrupt(_)))));
    }

    #[test]
    fn test_sqlite_scan_page_with_unbounded_limit() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .set_many(&[
                (b"Da".to_vec(), b"1".to_vec()),
                (b"Db".to_vec(), b"2".to_vec()),
                (b"Za".to_vec(), b"3".to_vec()),
            ])
            .unwrap();

        let page = backend.scan_page(b"D", None, usize::MAX).unwrap();
        assert_eq!(page.len(), 2);

        let one = backend.scan_page(b"D", None, 1).unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_sqlite_backend_round_trip() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();

        backend.set(b"Zkey", b"one").unwrap();
        backend.set(b"Zkey", b"two").unwrap();
        backend
            .set_many(&[(b"Db".to_vec(), b"2".to_vec()), (b"Da".to_vec(), b"1".to_vec())])
            .unwrap();

        assert_eq!(backend.get(b"Zkey").unwrap(), Some(b"two".to_vec()));
        assert_eq!(backend.get(b"missing").unwrap(), None);
        assert_eq!(backend.count().unwrap(), 3);

        let first = backend.scan_page(b"D", None, 1).unwrap();
        assert_eq!(first, vec![(b"Da".to_vec(), b"1".to_vec())]);

        let rest = backend.scan_page(b"D", Some(b"Da"), 10).unwrap();
        assert_eq!(rest, vec![(b"Db".to_vec(), b"2".to_vec())]);

        backend.reset().unwrap();
        assert_eq!(backend.count().unwrap(), 0);
    }

    #[test]
    fn test_sqlite_store_with_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::open(&dir.path().join("agg.db")).unwrap();
        let config = StoreConfig {
            working_set: 3,
            evict_batch: 2,
        };
        let mut store = AggregateStore::new(backend, config);

        for round in 0..3 {
            for i in 0..10 {
                absorb(&mut store, &date_key(&format!("C{}", i), "01012020"), round * 100 + i);
            }
        }

        let states: Vec<(GroupKey, AggregateState)> = store
            .scan(Namespace::Date)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(states.len(), 10);
        for (i, (key, state)) in states.iter().enumerate() {
            assert_eq!(key.recipient_id(), format!("C{}", i));
            assert_eq!(state.count, 3);
            assert_eq!(state.total_cents, 300 + 3 * i as u64);
            assert_eq!(state.median(), Ok(100 + i as u64));
        }

        println!("✅ SQLite store stats: {:?}", store.stats());
    }
}
