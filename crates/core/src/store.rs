//! Embedded observation store backed by `redb`.
//!
//! Observations are flattened into [`FactRecord`]s and persisted one row per
//! record. The store is the local persistence collaborator: it answers fact
//! queries with raw records, which callers convert back into observations and
//! re-merge.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::flat::{flatten_observation, FactRecord};
use crate::{AirembrError, Observation, Result};

/// Composite string key: `"{session_id}:{observation_id}:{ulid}"`.
///
/// Records of one session share a prefix, and the ULID keeps records of one
/// observation in insertion order.
const FACTS: TableDefinition<&str, &str> = TableDefinition::new("facts");
/// Maps client-supplied idempotency keys to the JSON list of stored keys.
const IDEMPOTENCY: TableDefinition<&str, &str> = TableDefinition::new("idempotency");

const DEFAULT_PAGE_LIMIT: usize = 20;

/// A persisted record with its storage key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFact {
    pub key: String,
    pub recorded_at: DateTime<Utc>,
    pub record: FactRecord,
}

/// Filter and paging parameters for [`ObservationStore::query_facts`].
///
/// `where` pairs match by equality on the record's dotted keys; the date range
/// applies to `metadata.time.create` and is inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactQuery {
    #[serde(rename = "where")]
    pub filters: Vec<(String, Value)>,
    pub min_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
    pub page: usize,
    pub limit: usize,
}

impl Default for FactQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            min_date: None,
            max_date: None,
            page: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl FactQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((path.into(), value.into()));
        self
    }

    pub fn since(mut self, min_date: DateTime<Utc>) -> Self {
        self.min_date = Some(min_date);
        self
    }

    pub fn until(mut self, max_date: DateTime<Utc>) -> Self {
        self.max_date = Some(max_date);
        self
    }

    pub fn page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn has_date_range(&self) -> bool {
        self.min_date.is_some() || self.max_date.is_some()
    }

    /// Whether `record` passes every filter and the date range.
    pub fn matches(&self, record: &FactRecord) -> bool {
        let filters_ok = self
            .filters
            .iter()
            .all(|(path, expected)| record.get(path) == Some(expected));
        if !filters_ok {
            return false;
        }
        if !self.has_date_range() {
            return true;
        }
        let Some(created) = record_time(record) else {
            return false;
        };
        self.min_date.is_none_or(|min| created >= min)
            && self.max_date.is_none_or(|max| created <= max)
    }
}

fn record_time(record: &FactRecord) -> Option<DateTime<Utc>> {
    record
        .get_str("metadata.time.create")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// One page of matching records, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FactPage {
    pub total: usize,
    pub page: usize,
    pub limit: usize,
    pub records: Vec<FactRecord>,
}

/// Local observation store.
///
/// ```rust,no_run
/// use airembr::store::{FactQuery, ObservationStore};
///
/// let store = ObservationStore::open("memory.airembr").unwrap();
/// let page = store.query_facts(&FactQuery::new().filter("rel.label", "purchased")).unwrap();
/// println!("{} purchases", page.total);
/// ```
pub struct ObservationStore {
    db: Database,
}

impl ObservationStore {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory store; data is lost when it is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(FACTS)?;
            write_txn.open_table(IDEMPOTENCY)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Persist the flattened records of `observations` in one transaction.
    ///
    /// With an `idempotency_key` that was already used, nothing is written and
    /// the records stored the first time are returned.
    pub fn remember(
        &self,
        observations: &[Observation],
        idempotency_key: Option<&str>,
    ) -> Result<Vec<StoredFact>> {
        if let Some(key) = idempotency_key {
            // Fast path: a retry only needs a read transaction.
            let existing = {
                let read_txn = self.db.begin_read()?;
                let idem_table = read_txn.open_table(IDEMPOTENCY)?;
                let existing = idem_table.get(key)?.map(|guard| guard.value().to_string());
                existing
            };
            if let Some(keys) = existing {
                return self.load_keys(&keys);
            }
        }

        let mut rows = Vec::new();
        for observation in observations {
            for record in flatten_observation(observation)? {
                rows.push((observation.session_id(), observation.id(), record));
            }
        }

        let write_txn = self.db.begin_write()?;
        if let Some(key) = idempotency_key {
            // Another writer may have used the key since the read above.
            let existing = {
                let idem_table = write_txn.open_table(IDEMPOTENCY)?;
                let existing = idem_table.get(key)?.map(|guard| guard.value().to_string());
                existing
            };
            if let Some(keys) = existing {
                drop(write_txn);
                return self.load_keys(&keys);
            }
        }

        let recorded_at = Utc::now();
        let mut stored = Vec::with_capacity(rows.len());
        {
            let mut table = write_txn.open_table(FACTS)?;
            for (session, observation, record) in rows {
                let fact = StoredFact {
                    key: format!("{session}:{observation}:{}", Ulid::new()),
                    recorded_at,
                    record,
                };
                let value = serde_json::to_string(&fact)?;
                table.insert(fact.key.as_str(), value.as_str())?;
                stored.push(fact);
            }
        }
        if let Some(key) = idempotency_key {
            let keys: Vec<&str> = stored.iter().map(|f| f.key.as_str()).collect();
            let keys = serde_json::to_string(&keys)?;
            let mut idem_table = write_txn.open_table(IDEMPOTENCY)?;
            idem_table.insert(key, keys.as_str())?;
        }
        write_txn.commit()?;

        tracing::debug!(
            observations = observations.len(),
            records = stored.len(),
            "stored observation records"
        );
        Ok(stored)
    }

    fn load_keys(&self, keys_json: &str) -> Result<Vec<StoredFact>> {
        let keys: Vec<String> = serde_json::from_str(keys_json)?;
        keys.iter().map(|key| self.fact(key)).collect()
    }

    /// Fetch one stored record by its key.
    pub fn fact(&self, key: &str) -> Result<StoredFact> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FACTS)?;
        let value = table
            .get(key)?
            .map(|guard| guard.value().to_string())
            .ok_or_else(|| AirembrError::NotFound(format!("fact {key}")))?;
        Ok(serde_json::from_str(&value)?)
    }

    /// Records matching `query`, ordered by creation time then storage order.
    pub fn query_facts(&self, query: &FactQuery) -> Result<FactPage> {
        let mut matching = self.scan_prefix("", |record| query.matches(record))?;
        matching.sort_by_key(|fact| record_time(&fact.record));

        let total = matching.len();
        let records = matching
            .into_iter()
            .skip(query.page.saturating_mul(query.limit))
            .take(query.limit)
            .map(|fact| fact.record)
            .collect();

        Ok(FactPage {
            total,
            page: query.page,
            limit: query.limit,
            records,
        })
    }

    /// Records in which the entity with `id` is the actor or an object.
    pub fn query_entity(&self, id: &str) -> Result<Vec<FactRecord>> {
        let facts = self.scan_prefix("", |record| {
            record.get_str("actor.id") == Some(id) || record.get_str("object.id") == Some(id)
        })?;
        Ok(facts.into_iter().map(|fact| fact.record).collect())
    }

    /// Every record stored for one session, in storage order.
    pub fn session_records(&self, session_id: &str) -> Result<Vec<FactRecord>> {
        // The key prefix narrows the scan; the record decides, since session
        // ids may themselves contain `:`.
        let facts = self.scan_prefix(&format!("{session_id}:"), |record| {
            record.get_str("session.id") == Some(session_id)
        })?;
        Ok(facts.into_iter().map(|fact| fact.record).collect())
    }

    // Internal: scan the facts table, filter by key prefix, apply predicate.
    fn scan_prefix(
        &self,
        prefix: &str,
        predicate: impl Fn(&FactRecord) -> bool,
    ) -> Result<Vec<StoredFact>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FACTS)?;
        let mut results = Vec::new();

        for entry in table.iter()? {
            let (k, v) = entry?;
            if k.value().starts_with(prefix) {
                let fact: StoredFact = serde_json::from_str(v.value())?;
                if predicate(&fact.record) {
                    results.push(fact);
                }
            }
        }

        Ok(results)
    }
}
