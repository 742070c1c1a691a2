//! In-process vector store worker.
//!
//! Keeps `(id, key, value)` records in insertion order and answers top-k
//! cosine-similarity queries. The collection lives as long as the worker.

use async_trait::async_trait;
use rayon::prelude::*;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::error::{WorkerError, WorkerResult};
use crate::wire::*;
use crate::worker::{Backend, ConcurrencyMode};

/// Collections larger than this are scored with rayon.
const PARALLEL_THRESHOLD: usize = 2048;

#[derive(Debug, Clone)]
struct Record {
    id: u64,
    key: Vec<f32>,
    value: Vec<u8>,
}

#[derive(Debug, Default)]
struct Collection {
    records: Vec<Record>,
    next_id: u64,
    /// Fixed by the first `set`.
    key_len: Option<usize>,
}

impl Collection {
    fn check_key_len(&self, key: &[f32]) -> WorkerResult<()> {
        if key.is_empty() {
            return Err(WorkerError::invalid("key must not be empty"));
        }
        match self.key_len {
            Some(expected) if expected != key.len() => Err(WorkerError::invalid(format!(
                "key length {} does not match store key length {}",
                key.len(),
                expected
            ))),
            _ => Ok(()),
        }
    }
}

/// Dot product over the product of magnitudes, in f64, clamped to `[-1, 1]`.
/// A zero vector is similar to nothing.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

pub struct VectorStore {
    collection: RwLock<Collection>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self {
            collection: RwLock::new(Collection::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.collection.read().map(|c| c.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> WorkerResult<std::sync::RwLockReadGuard<'_, Collection>> {
        self.collection
            .read()
            .map_err(|_| WorkerError::model("store lock poisoned"))
    }

    fn write(&self) -> WorkerResult<std::sync::RwLockWriteGuard<'_, Collection>> {
        self.collection
            .write()
            .map_err(|_| WorkerError::model("store lock poisoned"))
    }
}

impl Default for VectorStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for VectorStore {
    fn name(&self) -> &str {
        "local-store"
    }

    fn concurrency_mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::SingleThread
    }

    async fn load(&self, opts: ModelOptions) -> WorkerResult<()> {
        let mut collection = self.write()?;
        *collection = Collection::default();
        info!("Vector store '{}' ready", opts.model);
        Ok(())
    }

    async fn stores_set(&self, opts: StoresSetOptions) -> WorkerResult<()> {
        if opts.keys.is_empty() {
            return Err(WorkerError::invalid("no keys to add"));
        }
        if opts.keys.len() != opts.values.len() {
            return Err(WorkerError::invalid(format!(
                "len(keys) = {}, len(values) = {}",
                opts.keys.len(),
                opts.values.len()
            )));
        }

        let mut collection = self.write()?;
        let dim = collection.key_len.unwrap_or(opts.keys[0].floats.len());
        for key in &opts.keys {
            if key.floats.is_empty() {
                return Err(WorkerError::invalid("key must not be empty"));
            }
            if key.floats.len() != dim {
                return Err(WorkerError::invalid(format!(
                    "key length {} does not match store key length {}",
                    key.floats.len(),
                    dim
                )));
            }
        }
        collection.key_len = Some(dim);

        for (key, value) in opts.keys.into_iter().zip(opts.values) {
            let id = collection.next_id;
            collection.next_id += 1;
            collection.records.push(Record {
                id,
                key: key.floats,
                value: value.bytes,
            });
        }
        debug!("Vector store holds {} records", collection.records.len());
        Ok(())
    }

    async fn stores_delete(&self, opts: StoresDeleteOptions) -> WorkerResult<()> {
        let mut collection = self.write()?;
        for key in &opts.keys {
            collection.check_key_len(&key.floats)?;
        }
        let before = collection.records.len();
        collection
            .records
            .retain(|r| !opts.keys.iter().any(|k| k.floats == r.key));
        debug!("Deleted {} records", before - collection.records.len());
        Ok(())
    }

    async fn stores_get(&self, opts: StoresGetOptions) -> WorkerResult<StoresGetResult> {
        let collection = self.read()?;
        let mut result = StoresGetResult::default();
        for key in &opts.keys {
            collection.check_key_len(&key.floats)?;
            for record in collection.records.iter().filter(|r| r.key == key.floats) {
                result.keys.push(StoresKey::from(record.key.clone()));
                result.values.push(StoresValue::from(record.value.clone()));
            }
        }
        Ok(result)
    }

    async fn stores_find(&self, opts: StoresFindOptions) -> WorkerResult<StoresFindResult> {
        if opts.top_k < 1 {
            return Err(WorkerError::invalid(format!("top_k must be at least 1, got {}", opts.top_k)));
        }
        let collection = self.read()?;
        if collection.records.is_empty() {
            return Ok(StoresFindResult::default());
        }
        collection.check_key_len(&opts.key.floats)?;

        let query = &opts.key.floats;
        let mut scored: Vec<(usize, f64)> = if collection.records.len() > PARALLEL_THRESHOLD {
            collection
                .records
                .par_iter()
                .enumerate()
                .map(|(i, r)| (i, cosine_similarity(query, &r.key)))
                .collect()
        } else {
            collection
                .records
                .iter()
                .enumerate()
                .map(|(i, r)| (i, cosine_similarity(query, &r.key)))
                .collect()
        };

        // descending similarity, insertion order on ties
        let records = &collection.records;
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(records[a.0].id.cmp(&records[b.0].id)));
        scored.truncate(opts.top_k as usize);

        let mut result = StoresFindResult::default();
        for (i, sim) in scored {
            let record = &collection.records[i];
            result.keys.push(StoresKey::from(record.key.clone()));
            result.values.push(StoresValue::from(record.value.clone()));
            result.similarities.push(sim as f32);
        }
        debug!("Find returned {} of {} records", result.keys.len(), collection.records.len());
        Ok(result)
    }

    async fn stores_reset(&self) -> WorkerResult<()> {
        let mut collection = self.write()?;
        *collection = Collection::default();
        Ok(())
    }
}
