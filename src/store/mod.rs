//! Canonical Store abstraction.
//!
//! The [`Store`] trait is the only way the pipeline reads or writes
//! documents, parse jobs, normalized output, and facts. Backends:
//!
//! - [`memory::InMemoryStore`]: a single mutex over all tables; used in
//!   tests and for embedding the pipeline without a database.
//! - [`sqlite::SqliteStore`]: `sqlx` over SQLite, with a partial unique
//!   index enforcing one active job per document.
//!
//! Job mutations are scoped by job id and are no-ops once the job is
//! terminal, so a stale poll task can never clobber a finished job.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Document, DocumentStatus, JobMetadata, JobStatus, ParseJob, ParsedBlock, ParsedChunk,
    StructuredFact,
};

/// Outcome of [`Store::create_job`].
#[derive(Debug, Clone)]
pub enum JobAdmission {
    /// The job was inserted and the document moved to `PARSING`.
    Created(ParseJob),
    /// Another job is already pending or running for the document.
    Existing(ParseJob),
}

impl JobAdmission {
    pub fn job(&self) -> &ParseJob {
        match self {
            JobAdmission::Created(job) | JobAdmission::Existing(job) => job,
        }
    }
}

/// Non-terminal progress reported for a job.
#[derive(Debug, Clone)]
pub struct JobProgress {
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub reason: Option<String>,
    pub metadata: JobMetadata,
}

/// Number of normalized rows stored for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub chunks: usize,
    pub blocks: usize,
}

/// Abstract storage backend for the parse pipeline.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_job`](Store::create_job) | Atomic check-then-insert of a new job |
/// | [`record_progress`](Store::record_progress) | Update a non-terminal job |
/// | [`complete_job`](Store::complete_job) | Persist chunks/blocks, job COMPLETED, document PARSED |
/// | [`fail_job`](Store::fail_job) | Job FAILED, document ERROR |
/// | [`replace_facts`](Store::replace_facts) | Delete-then-insert the facts of a document |
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// All documents, newest first.
    async fn list_documents(&self) -> Result<Vec<Document>>;

    async fn set_document_status(&self, id: &str, status: DocumentStatus) -> Result<()>;

    /// Record vendor references on a document. `None` leaves a field untouched.
    async fn set_vendor_refs(
        &self,
        id: &str,
        file_ref: Option<&str>,
        job_ref: Option<&str>,
    ) -> Result<()>;

    /// Insert `job` unless the document already has a PENDING or RUNNING
    /// job. The check and the insert are atomic.
    async fn create_job(&self, job: &ParseJob) -> Result<JobAdmission>;

    async fn set_job_vendor_ref(&self, job_id: &str, vendor_job_ref: &str) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<ParseJob>>;

    /// Most recently created job for a document, in any status.
    async fn latest_job(&self, document_id: &str) -> Result<Option<ParseJob>>;

    async fn latest_completed_job(&self, document_id: &str) -> Result<Option<ParseJob>>;

    /// Apply non-terminal progress. Returns `false` (and changes nothing)
    /// if the job is missing or already terminal.
    async fn record_progress(&self, job_id: &str, progress: &JobProgress) -> Result<bool>;

    /// Store normalized output, mark the job COMPLETED and its document
    /// PARSED in one step. Returns `false` if the job was already terminal.
    async fn complete_job(
        &self,
        job_id: &str,
        metadata: &JobMetadata,
        chunks: &[ParsedChunk],
        blocks: &[ParsedBlock],
    ) -> Result<bool>;

    /// Mark the job FAILED with `reason` and its document ERROR. Returns
    /// `false` if the job was already terminal.
    async fn fail_job(&self, job_id: &str, reason: &str) -> Result<bool>;

    async fn job_counts(&self, job_id: &str) -> Result<JobCounts>;

    /// Chunks ordered by chunk index.
    async fn list_chunks(&self, job_id: &str) -> Result<Vec<ParsedChunk>>;

    /// Blocks ordered by (chunk index, block index).
    async fn list_blocks(&self, job_id: &str) -> Result<Vec<ParsedBlock>>;

    /// Delete every fact of `document_id`, then insert `facts`.
    async fn replace_facts(&self, document_id: &str, facts: &[StructuredFact]) -> Result<()>;

    async fn list_facts(&self, document_id: &str) -> Result<Vec<StructuredFact>>;
}
