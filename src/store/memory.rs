//! In-memory [`Store`] implementation for tests and embedding.
//!
//! All tables sit behind one `std::sync::Mutex`, which makes every trait
//! method (including the check-then-insert in `create_job`) atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{
    Document, DocumentStatus, JobMetadata, JobStatus, ParseJob, ParsedBlock, ParsedChunk,
    StructuredFact,
};

use super::{JobAdmission, JobCounts, JobProgress, Store};

#[derive(Default)]
struct Tables {
    documents: HashMap<String, Document>,
    /// Insertion order doubles as creation order.
    jobs: Vec<ParseJob>,
    chunks: HashMap<String, Vec<ParsedChunk>>,
    blocks: HashMap<String, Vec<ParsedBlock>>,
    facts: Vec<StructuredFact>,
}

impl Tables {
    fn job_mut(&mut self, job_id: &str) -> Option<&mut ParseJob> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    fn touch_document(&mut self, id: &str, status: DocumentStatus, now: i64) {
        if let Some(doc) = self.documents.get_mut(id) {
            doc.status = status;
            doc.updated_at = now;
        }
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut t = self.lock()?;
        if t.documents.contains_key(&doc.id) {
            anyhow::bail!("document already exists: {}", doc.id);
        }
        t.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.lock()?.documents.get(id).cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self.lock()?.documents.values().cloned().collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn set_document_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        self.lock()?.touch_document(id, status, now());
        Ok(())
    }

    async fn set_vendor_refs(
        &self,
        id: &str,
        file_ref: Option<&str>,
        job_ref: Option<&str>,
    ) -> Result<()> {
        let mut t = self.lock()?;
        if let Some(doc) = t.documents.get_mut(id) {
            if let Some(f) = file_ref {
                doc.vendor_file_ref = Some(f.to_string());
            }
            if let Some(j) = job_ref {
                doc.vendor_job_ref = Some(j.to_string());
            }
            doc.updated_at = now();
        }
        Ok(())
    }

    async fn create_job(&self, job: &ParseJob) -> Result<JobAdmission> {
        let mut t = self.lock()?;
        if let Some(existing) = t
            .jobs
            .iter()
            .find(|j| j.document_id == job.document_id && j.status.is_active())
        {
            return Ok(JobAdmission::Existing(existing.clone()));
        }
        t.jobs.push(job.clone());
        t.touch_document(&job.document_id, DocumentStatus::Parsing, now());
        Ok(JobAdmission::Created(job.clone()))
    }

    async fn set_job_vendor_ref(&self, job_id: &str, vendor_job_ref: &str) -> Result<()> {
        let mut t = self.lock()?;
        if let Some(job) = t.job_mut(job_id) {
            job.vendor_job_ref = Some(vendor_job_ref.to_string());
            job.updated_at = now();
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<ParseJob>> {
        Ok(self.lock()?.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn latest_job(&self, document_id: &str) -> Result<Option<ParseJob>> {
        Ok(self
            .lock()?
            .jobs
            .iter()
            .rev()
            .find(|j| j.document_id == document_id)
            .cloned())
    }

    async fn latest_completed_job(&self, document_id: &str) -> Result<Option<ParseJob>> {
        Ok(self
            .lock()?
            .jobs
            .iter()
            .rev()
            .find(|j| j.document_id == document_id && j.status == JobStatus::Completed)
            .cloned())
    }

    async fn record_progress(&self, job_id: &str, progress: &JobProgress) -> Result<bool> {
        if progress.status.is_terminal() {
            anyhow::bail!("record_progress called with terminal status {}", progress.status);
        }
        let mut t = self.lock()?;
        let job = match t.job_mut(job_id) {
            Some(j) if !j.status.is_terminal() => j,
            _ => return Ok(false),
        };
        job.status = progress.status;
        job.progress = progress.progress;
        job.reason = progress.reason.clone();
        job.metadata = progress.metadata.clone();
        job.updated_at = now();
        Ok(true)
    }

    async fn complete_job(
        &self,
        job_id: &str,
        metadata: &JobMetadata,
        chunks: &[ParsedChunk],
        blocks: &[ParsedBlock],
    ) -> Result<bool> {
        let mut t = self.lock()?;
        let ts = now();
        let document_id = match t.job_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Completed;
                job.progress = Some(100.0);
                job.reason = None;
                job.metadata = metadata.clone();
                job.updated_at = ts;
                job.document_id.clone()
            }
            _ => return Ok(false),
        };
        t.chunks.insert(job_id.to_string(), chunks.to_vec());
        t.blocks.insert(job_id.to_string(), blocks.to_vec());
        t.touch_document(&document_id, DocumentStatus::Parsed, ts);
        Ok(true)
    }

    async fn fail_job(&self, job_id: &str, reason: &str) -> Result<bool> {
        let mut t = self.lock()?;
        let ts = now();
        let document_id = match t.job_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                job.status = JobStatus::Failed;
                job.reason = Some(reason.to_string());
                job.updated_at = ts;
                job.document_id.clone()
            }
            _ => return Ok(false),
        };
        t.touch_document(&document_id, DocumentStatus::Error, ts);
        Ok(true)
    }

    async fn job_counts(&self, job_id: &str) -> Result<JobCounts> {
        let t = self.lock()?;
        Ok(JobCounts {
            chunks: t.chunks.get(job_id).map_or(0, |c| c.len()),
            blocks: t.blocks.get(job_id).map_or(0, |b| b.len()),
        })
    }

    async fn list_chunks(&self, job_id: &str) -> Result<Vec<ParsedChunk>> {
        let mut chunks = self.lock()?.chunks.get(job_id).cloned().unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn list_blocks(&self, job_id: &str) -> Result<Vec<ParsedBlock>> {
        let mut blocks = self.lock()?.blocks.get(job_id).cloned().unwrap_or_default();
        blocks.sort_by_key(|b| (b.chunk_index, b.block_index));
        Ok(blocks)
    }

    async fn replace_facts(&self, document_id: &str, facts: &[StructuredFact]) -> Result<()> {
        let mut t = self.lock()?;
        t.facts.retain(|f| f.document_id != document_id);
        t.facts.extend(facts.iter().cloned());
        Ok(())
    }

    async fn list_facts(&self, document_id: &str) -> Result<Vec<StructuredFact>> {
        Ok(self
            .lock()?
            .facts
            .iter()
            .filter(|f| f.document_id == document_id)
            .cloned()
            .collect())
    }
}
