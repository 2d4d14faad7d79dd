//! In-memory key-value backend.
//!
//! Emulates the parts of DynamoDB the kifu store relies on: conditional
//! writes returning the prior item, batch writes capped at
//! `MAX_BATCH_WRITE`, sparse secondary indexes, paginated queries with
//! continuation keys. Failure injection and call counters support tests.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::interfaces::{
    Condition, Conditional, KvBackend, QueryPage, QueryRequest, RangeCondition, Result,
    StorageError, WriteRequest, MAX_BATCH_WRITE,
};
use crate::storage::item::{AttrValue, Item, Key, PK_ATTR, SK_ATTR};
use crate::storage::keys::{
    CREATED_KEY_ATTR, OWNER_ATTR, OWNER_INDEX, POSITION_INDEX, POSITION_KEY_ATTR,
    POSITION_SK_ATTR, SIGNATURE_INDEX, SIGNATURE_KEY_ATTR, SIGNATURE_SK_ATTR,
};

/// Default number of items per query page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Hash and range attribute of a secondary index.
#[derive(Debug, Clone)]
struct IndexSchema {
    hash_attr: String,
    range_attr: String,
}

/// In-memory backend with the kifu table's secondary indexes.
pub struct MemoryBackend {
    items: RwLock<BTreeMap<Key, Item>>,
    indexes: HashMap<String, IndexSchema>,
    page_size: usize,
    latency: RwLock<Option<Duration>>,
    fail_on_batch_write: RwLock<Option<usize>>,
    fail_on_query: RwLock<bool>,
    fail_on_get: RwLock<bool>,
    batch_write_calls: AtomicUsize,
    query_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Backend whose queries return at most `page_size` items per page.
    pub fn with_page_size(page_size: usize) -> Self {
        let mut indexes = HashMap::new();
        indexes.insert(
            OWNER_INDEX.to_string(),
            IndexSchema {
                hash_attr: OWNER_ATTR.to_string(),
                range_attr: CREATED_KEY_ATTR.to_string(),
            },
        );
        indexes.insert(
            POSITION_INDEX.to_string(),
            IndexSchema {
                hash_attr: POSITION_KEY_ATTR.to_string(),
                range_attr: POSITION_SK_ATTR.to_string(),
            },
        );
        indexes.insert(
            SIGNATURE_INDEX.to_string(),
            IndexSchema {
                hash_attr: SIGNATURE_KEY_ATTR.to_string(),
                range_attr: SIGNATURE_SK_ATTR.to_string(),
            },
        );

        Self {
            items: RwLock::new(BTreeMap::new()),
            indexes,
            page_size: page_size.max(1),
            latency: RwLock::new(None),
            fail_on_batch_write: RwLock::new(None),
            fail_on_query: RwLock::new(false),
            fail_on_get: RwLock::new(false),
            batch_write_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
        }
    }

    /// Delay every call by `latency`, so concurrent callers interleave.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// Fail the `nth` batch write call (1-based) and every one after it.
    pub async fn set_fail_on_batch_write(&self, nth: Option<usize>) {
        *self.fail_on_batch_write.write().await = nth;
    }

    pub async fn set_fail_on_query(&self, fail: bool) {
        *self.fail_on_query.write().await = fail;
    }

    pub async fn set_fail_on_get(&self, fail: bool) {
        *self.fail_on_get.write().await = fail;
    }

    /// Number of batch write calls attempted so far, failed ones included.
    pub fn batch_write_calls(&self) -> usize {
        self.batch_write_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    /// Raw stored item, bypassing the codec.
    pub async fn get_stored(&self, key: &Key) -> Option<Item> {
        self.items.read().await.get(key).cloned()
    }

    /// Overwrite a raw item, bypassing the codec.
    pub async fn insert_raw(&self, item: Item) -> Result<()> {
        let key = key_of(&item)?;
        self.items.write().await.insert(key, item);
        Ok(())
    }

    pub async fn stored_count(&self) -> usize {
        self.items.read().await.len()
    }

    async fn delay(&self) {
        let latency = *self.latency.read().await;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of(item: &Item) -> Result<Key> {
    Key::of_item(item)
        .ok_or_else(|| StorageError::InvalidArgument("item lacks pk/sk attributes".to_string()))
}

fn holds(condition: &Condition, current: Option<&Item>) -> bool {
    match (condition, current) {
        (Condition::NotExists, current) => current.is_none(),
        (Condition::Equals { attr, value }, Some(item)) => item.get(attr) == Some(value),
        (Condition::Equals { .. }, None) => false,
        (Condition::NotExistsOrEquals { .. }, None) => true,
        (Condition::NotExistsOrEquals { attr, value }, Some(item)) => {
            item.get(attr) == Some(value)
        }
    }
}

fn range_matches(range: &RangeCondition, item: &Item) -> bool {
    match range {
        RangeCondition::Between { attr, lo, hi } => item
            .get(attr)
            .and_then(AttrValue::as_s)
            .is_some_and(|v| v >= lo.as_str() && v <= hi.as_str()),
    }
}

/// Sort position of an item within a query: range value, then primary key.
fn sort_tuple(item: &Item, range_attr: &str) -> (String, String, String) {
    let s = |name: &str| {
        item.get(name)
            .and_then(AttrValue::as_s)
            .unwrap_or_default()
            .to_string()
    };
    (s(range_attr), s(PK_ATTR), s(SK_ATTR))
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &Key) -> Result<Option<Item>> {
        self.delay().await;
        if *self.fail_on_get.read().await {
            return Err(StorageError::Backend("injected get failure".to_string()));
        }
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn put_if(&self, item: Item, condition: Condition) -> Result<Conditional> {
        self.delay().await;
        let key = key_of(&item)?;
        let mut items = self.items.write().await;
        let current = items.get(&key);
        if !holds(&condition, current) {
            return Ok(Conditional::Rejected {
                current: current.cloned(),
            });
        }
        let previous = items.insert(key, item);
        Ok(Conditional::Applied { previous })
    }

    async fn delete_if(&self, key: &Key, condition: Condition) -> Result<Conditional> {
        self.delay().await;
        let mut items = self.items.write().await;
        let current = items.get(key);
        if !holds(&condition, current) {
            return Ok(Conditional::Rejected {
                current: current.cloned(),
            });
        }
        let previous = items.remove(key);
        Ok(Conditional::Applied { previous })
    }

    async fn batch_write(&self, requests: Vec<WriteRequest>) -> Result<()> {
        let call = self.batch_write_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.delay().await;

        if let Some(nth) = *self.fail_on_batch_write.read().await {
            if call >= nth {
                return Err(StorageError::Backend(format!(
                    "injected batch write failure on call {call}"
                )));
            }
        }
        if requests.len() > MAX_BATCH_WRITE {
            return Err(StorageError::InvalidArgument(format!(
                "batch of {} exceeds {}",
                requests.len(),
                MAX_BATCH_WRITE
            )));
        }

        let mut items = self.items.write().await;
        for request in requests {
            match request {
                WriteRequest::Put(item) => {
                    items.insert(key_of(&item)?, item);
                }
                WriteRequest::Delete(key) => {
                    items.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if *self.fail_on_query.read().await {
            return Err(StorageError::Backend("injected query failure".to_string()));
        }

        let range_attr = match &request.index {
            Some(name) => {
                let schema = self.indexes.get(name).ok_or_else(|| {
                    StorageError::InvalidArgument(format!("unknown index `{name}`"))
                })?;
                if schema.hash_attr != request.partition_attr {
                    return Err(StorageError::InvalidArgument(format!(
                        "`{}` is not the hash key of `{name}`",
                        request.partition_attr
                    )));
                }
                schema.range_attr.clone()
            }
            None => SK_ATTR.to_string(),
        };

        let items = self.items.read().await;
        let mut matching: Vec<(_, &Item)> = items
            .values()
            .filter(|item| {
                item.get(&request.partition_attr).and_then(AttrValue::as_s)
                    == Some(request.partition_value.as_str())
            })
            // Sparse index: items without the range attribute are not projected.
            .filter(|item| item.get(&range_attr).is_some())
            .filter(|item| {
                request
                    .range
                    .as_ref()
                    .map_or(true, |r| range_matches(r, item))
            })
            .map(|item| (sort_tuple(item, &range_attr), item))
            .collect();

        matching.sort_by(|a, b| a.0.cmp(&b.0));
        if !request.ascending {
            matching.reverse();
        }

        if let Some(start) = &request.start_key {
            let start = sort_tuple(start, &range_attr);
            matching.retain(|(tuple, _)| match tuple.cmp(&start) {
                CmpOrdering::Greater => request.ascending,
                CmpOrdering::Less => !request.ascending,
                CmpOrdering::Equal => false,
            });
        }

        let page_size = request
            .limit
            .map(|l| (l as usize).min(self.page_size))
            .unwrap_or(self.page_size);
        let more = matching.len() > page_size;
        matching.truncate(page_size);

        let last_key = if more {
            matching.last().map(|(_, item)| {
                let mut last = Item::new();
                for name in [PK_ATTR, SK_ATTR, range_attr.as_str()] {
                    if let Some(value) = item.get(name) {
                        last.insert(name.to_string(), value.clone());
                    }
                }
                last
            })
        } else {
            None
        };

        Ok(QueryPage {
            items: matching.into_iter().map(|(_, item)| item.clone()).collect(),
            last_key,
        })
    }
}
