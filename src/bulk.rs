//! Batch accumulator and bulk sink.
//!
//! [`BulkSink`] buffers records and hands them to a [`DocumentWriter`] in
//! batches of exactly `bulk_size`, plus one final short batch when the
//! stream ends. A failed bulk write is retried record by record so the
//! good records of a batch still land; only a failing single write is
//! reported. The buffer lock is never held across a write.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use enrich_harness_core::models::IndexDocument;

use crate::es::SearchIndex;

/// Destination of a [`BulkSink`].
#[async_trait]
pub trait DocumentWriter<T>: Send + Sync {
    /// Label used in logs.
    fn target(&self) -> &str;

    async fn write_bulk(&self, batch: &[T]) -> Result<()>;

    async fn write_one(&self, record: &T) -> Result<()>;

    /// Whether a failed bulk write falls back to single writes.
    fn fallback(&self) -> bool {
        true
    }
}

pub struct BulkSink<T> {
    bulk_size: usize,
    pending: Mutex<Vec<T>>,
    writer: Arc<dyn DocumentWriter<T>>,
    flushes: AtomicU64,
    written: AtomicU64,
}

impl<T: Send + Sync> BulkSink<T> {
    pub fn new(bulk_size: usize, writer: Arc<dyn DocumentWriter<T>>) -> Self {
        Self {
            bulk_size: bulk_size.max(1),
            pending: Mutex::new(Vec::new()),
            writer,
            flushes: AtomicU64::new(0),
            written: AtomicU64::new(0),
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Number of batches handed to the writer so far.
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Number of records handed to the writer so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<T>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take one batch: a full one, or with `last` whatever remains.
    fn take_batch(&self, last: bool) -> Option<Vec<T>> {
        let mut pending = self.lock();
        if pending.len() >= self.bulk_size {
            let rest = pending.split_off(self.bulk_size);
            Some(std::mem::replace(&mut *pending, rest))
        } else if last && !pending.is_empty() {
            Some(std::mem::take(&mut *pending))
        } else {
            None
        }
    }

    pub async fn add(&self, record: T) -> Result<()> {
        self.lock().push(record);
        self.flush(false).await
    }

    pub async fn add_all(&self, records: impl IntoIterator<Item = T>) -> Result<()> {
        self.lock().extend(records);
        self.flush(false).await
    }

    /// Write every full batch; with `last`, also the remainder.
    pub async fn flush(&self, last: bool) -> Result<()> {
        while let Some(batch) = self.take_batch(last) {
            self.write_batch(batch).await?;
        }
        Ok(())
    }

    async fn write_batch(&self, batch: Vec<T>) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.written.fetch_add(batch.len() as u64, Ordering::SeqCst);
        let target = self.writer.target();
        let err = match self.writer.write_bulk(&batch).await {
            Ok(()) => {
                debug!(target, records = batch.len(), "bulk write ok");
                return Ok(());
            }
            Err(e) => e,
        };
        if !self.writer.fallback() {
            return Err(err);
        }
        warn!(
            target,
            records = batch.len(),
            error = %err,
            "bulk write failed, falling back to single writes"
        );
        let mut first_err = None;
        for record in &batch {
            if let Err(e) = self.writer.write_one(record).await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.context(format!("single write to {} failed", target))),
            None => Ok(()),
        }
    }
}

/// Writes documents into one index of the search backend.
pub struct IndexWriter<T> {
    index: Arc<SearchIndex>,
    name: String,
    _doc: PhantomData<fn(T)>,
}

impl<T> IndexWriter<T> {
    pub fn new(index: Arc<SearchIndex>, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            _doc: PhantomData,
        }
    }
}

#[async_trait]
impl<T: IndexDocument> DocumentWriter<T> for IndexWriter<T> {
    fn target(&self) -> &str {
        &self.name
    }

    async fn write_bulk(&self, batch: &[T]) -> Result<()> {
        let docs = batch
            .iter()
            .map(|d| Ok((d.doc_id().to_string(), serde_json::to_value(d)?)))
            .collect::<Result<Vec<_>>>()?;
        self.index.bulk(&self.name, &docs).await?;
        Ok(())
    }

    async fn write_one(&self, record: &T) -> Result<()> {
        let doc = serde_json::to_value(record)?;
        self.index
            .put_doc(&self.name, record.doc_id(), &doc)
            .await
            .with_context(|| format!("PUT {}/_doc/{}", self.name, record.doc_id()))?;
        Ok(())
    }
}
