use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::client::{CloudClient, Document, Mutation, TransactionId};
use super::query::{CloudQuery, Direction};
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use crate::value::{compare, Operator, Value};

struct Record {
    doc: Document,
    version: u64,
}

#[derive(Default)]
struct State {
    entities: BTreeMap<Key, Record>,
    version: u64,
    next_id: i64,
    next_tx: u64,
    /// Read set of each open transaction: key -> version seen, 0 if absent.
    open: HashMap<TransactionId, HashMap<Key, u64>>,
    conflicts: usize,
}

impl State {
    fn version_of(&self, key: &Key) -> u64 {
        self.entities.get(key).map_or(0, |r| r.version)
    }

    fn resolve(&mut self, key: &Key) -> Key {
        if key.is_incomplete() {
            self.next_id += 1;
            Key::with_id(key.kind.clone(), self.next_id)
        } else {
            key.clone()
        }
    }
}

/// In-process stand-in for the cloud database, with optimistic
/// transactions checked against each transaction's read set.
#[derive(Default)]
pub struct MemoryClient {
    state: Mutex<State>,
    lookups: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next `n` transactional commits fail with
    /// `TransactionConflict`.
    pub fn inject_conflicts(&self, n: usize) {
        self.state().conflicts = n;
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.state().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(AtomicOrdering::SeqCst)
    }

    /// Number of successful commits so far.
    pub fn commits(&self) -> usize {
        self.commits.load(AtomicOrdering::SeqCst)
    }
}

fn order_values(a: &Value, b: &Value) -> Ordering {
    if compare(a, Operator::Lt, b) {
        Ordering::Less
    } else if compare(a, Operator::Gt, b) {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

fn property(doc: &Document, name: &str) -> Option<Value> {
    doc.get(name).map(Value::from_json)
}

#[async_trait]
impl CloudClient for MemoryClient {
    async fn lookup(&self, key: &Key, tx: Option<&TransactionId>) -> StoreResult<Option<Document>> {
        self.lookups.fetch_add(1, AtomicOrdering::SeqCst);
        let mut state = self.state();
        if let Some(tx) = tx {
            let seen = state.version_of(key);
            let reads = state
                .open
                .get_mut(tx)
                .ok_or_else(|| StoreError::transport(format!("unknown transaction {}", tx.0)))?;
            reads.entry(key.clone()).or_insert(seen);
        }
        Ok(state.entities.get(key).map(|r| r.doc.clone()))
    }

    async fn run_query(&self, query: &CloudQuery) -> StoreResult<Vec<(Key, Option<Document>)>> {
        let state = self.state();
        let mut matched: Vec<(&Key, &Document)> = state
            .entities
            .iter()
            .filter(|(k, _)| k.kind == query.kind())
            .filter(|(_, r)| {
                query.filters().iter().all(|f| {
                    property(&r.doc, &f.field).is_some_and(|v| compare(&v, f.operator, &f.value))
                })
            })
            .filter(|(_, r)| {
                query
                    .orders()
                    .iter()
                    .all(|(field, _)| r.doc.contains_key(field))
            })
            .map(|(k, r)| (k, &r.doc))
            .collect();

        if !query.orders().is_empty() {
            matched.sort_by(|(_, a), (_, b)| {
                query.orders().iter().fold(Ordering::Equal, |acc, (field, dir)| {
                    acc.then_with(|| {
                        let ord = match (property(a, field), property(b, field)) {
                            (Some(x), Some(y)) => order_values(&x, &y),
                            _ => Ordering::Equal,
                        };
                        match dir {
                            Direction::Ascending => ord,
                            Direction::Descending => ord.reverse(),
                        }
                    })
                })
            });
        }

        let page = matched
            .into_iter()
            .skip(query.offset_value())
            .take(query.limit_value().unwrap_or(usize::MAX))
            .map(|(k, doc)| (k.clone(), (!query.keys_only()).then(|| doc.clone())))
            .collect();
        Ok(page)
    }

    async fn begin_transaction(&self) -> StoreResult<TransactionId> {
        let mut state = self.state();
        state.next_tx += 1;
        let tx = TransactionId(format!("tx-{}", state.next_tx));
        state.open.insert(tx.clone(), HashMap::new());
        Ok(tx)
    }

    async fn commit(
        &self,
        tx: Option<&TransactionId>,
        mutations: Vec<Mutation>,
    ) -> StoreResult<Vec<Key>> {
        let mut state = self.state();
        if let Some(tx) = tx {
            let reads = state
                .open
                .remove(tx)
                .ok_or_else(|| StoreError::transport(format!("unknown transaction {}", tx.0)))?;
            if state.conflicts > 0 {
                state.conflicts -= 1;
                return Err(StoreError::TransactionConflict);
            }
            if reads.iter().any(|(key, seen)| state.version_of(key) != *seen) {
                return Err(StoreError::TransactionConflict);
            }
        }

        let taken = mutations
            .iter()
            .any(|m| matches!(m, Mutation::Insert(k, _) if state.entities.contains_key(k)));
        if taken {
            return Err(StoreError::EntityExists);
        }

        state.version += 1;
        let version = state.version;
        let mut keys = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            match mutation {
                Mutation::Insert(key, doc) | Mutation::Upsert(key, doc) => {
                    let key = state.resolve(&key);
                    state.entities.insert(key.clone(), Record { doc, version });
                    keys.push(key);
                }
                Mutation::Delete(key) => {
                    state.entities.remove(&key);
                    keys.push(key);
                }
            }
        }
        self.commits.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(keys)
    }

    async fn rollback(&self, tx: &TransactionId) -> StoreResult<()> {
        self.state().open.remove(tx);
        Ok(())
    }
}
