//! Parse lifecycle orchestration.
//!
//! [`ParseOrchestrator`] drives a document from `UPLOADED` through vendor
//! extraction to `PARSED` (or `ERROR`):
//!
//! ```text
//! request_parse ─▶ create_job (atomic dedupe, document PARSING)
//!                   │
//!        ┌──────────┴───────────┐
//!   polling vendor          extract vendor
//!   spawn poll task         extract() in the caller
//!   upload? ▸ submit        │
//!   poll ▸ sleep ▸ poll …   │
//!        └──────────┬───────────┘
//!             normalize ▸ complete_job ▸ replace_facts
//! ```
//!
//! Polling-vendor failures happen inside the background task and are only
//! visible through [`ParseOrchestrator::get_parse_status`]. Extract-vendor
//! failures are returned to the caller of [`ParseOrchestrator::request_parse`].
//! In both cases the job ends `FAILED` with the error text as its reason
//! and the document ends `ERROR`.
//!
//! Every background poll task is tracked in a registry keyed by job id so
//! it can be listed ([`ParseOrchestrator::active_polls`]) or cancelled
//! ([`ParseOrchestrator::cancel`]).
//!
//! A PENDING/RUNNING job with no task in this process (its process exited
//! mid-parse) is adopted by the next `request_parse` for the document:
//! polling resumes from the stored vendor job reference, or the document
//! is submitted again when none was recorded.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::ParserConfig;
use crate::error::{ParseError, VendorError};
use crate::facts::FactExtractor;
use crate::models::{
    Document, DocumentStatus, JobMetadata, JobStatus, ParseJob, ParsedBlock, ParsedChunk,
    StructuredFact,
};
use crate::normalize::{extraction_text, normalize};
use crate::store::{JobAdmission, JobCounts, JobProgress, Store};
use crate::vendor::{
    ExtractVendor, JobResult, PollingVendor, ProviderAdapter, SubmitOptions, VendorKind,
};

/// Reason recorded on a job whose poll task was cancelled.
pub const POLL_CANCELLED_REASON: &str = "poll cancelled";

/// Reason recorded on an orphaned job left behind by a different vendor.
pub const VENDOR_CHANGED_REASON: &str = "abandoned after vendor change";

/// Tunables for the orchestrator.
pub struct OrchestratorOptions {
    pub poll_interval: Duration,
    /// `0` polls until the vendor reports a terminal status.
    pub max_poll_attempts: u32,
    pub extractor: FactExtractor,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 720,
            extractor: FactExtractor::new(),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config(config: &ParserConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_poll_attempts: config.max_poll_attempts,
            extractor: FactExtractor::new(),
        }
    }
}

/// Result of [`ParseOrchestrator::request_parse`].
#[derive(Debug, Clone, Serialize)]
pub struct ParseRequestOutcome {
    pub job_id: String,
    pub status: JobStatus,
    /// `true` when an existing PENDING/RUNNING job was returned instead of
    /// starting a new one.
    pub already_running: bool,
    /// `true` when that existing job had no live task and was picked up
    /// again by this call.
    pub resumed: bool,
}

/// Latest job of a document as reported by [`ParseOrchestrator::get_parse_status`].
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub vendor: String,
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub reason: Option<String>,
    pub chunk_count: usize,
    pub block_count: usize,
    pub metadata: JobMetadata,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobSummary {
    fn new(job: ParseJob, counts: JobCounts) -> Self {
        Self {
            id: job.id,
            vendor: job.vendor,
            status: job.status,
            progress: job.progress,
            reason: job.reason,
            chunk_count: counts.chunks,
            block_count: counts.blocks,
            metadata: job.metadata,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParseStatus {
    pub document_id: String,
    pub document_status: DocumentStatus,
    pub job: Option<JobSummary>,
}

/// Canonical output of the latest COMPLETED job of a document.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedView {
    pub job_id: String,
    pub chunks: Vec<ParsedChunk>,
    pub blocks: Vec<ParsedBlock>,
}

/// One entry of the poll registry.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ActivePoll {
    pub job_id: String,
    pub document_id: String,
    pub started_at: i64,
}

struct PollEntry {
    document_id: String,
    started_at: i64,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn Store>,
    adapter: ProviderAdapter,
    extractor: FactExtractor,
    poll_interval: Duration,
    max_poll_attempts: u32,
    polls: Mutex<HashMap<String, PollEntry>>,
    /// Jobs whose extraction runs in this process.
    extracting: Mutex<HashSet<String>>,
    /// Serializes job admission with task registration.
    admission: tokio::sync::Mutex<()>,
}

/// Marks a job as extracting in this process until dropped.
struct ExtractClaim<'a> {
    inner: &'a Inner,
    job_id: String,
}

impl Drop for ExtractClaim<'_> {
    fn drop(&mut self) {
        self.inner.extracting().remove(&self.job_id);
    }
}

/// Owns the per-document parse lifecycle. Cheap to clone; clones share the
/// store, adapter, and poll registry.
#[derive(Clone)]
pub struct ParseOrchestrator {
    inner: Arc<Inner>,
}

impl ParseOrchestrator {
    pub fn new(store: Arc<dyn Store>, adapter: ProviderAdapter, options: OrchestratorOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                adapter,
                extractor: options.extractor,
                poll_interval: options.poll_interval,
                max_poll_attempts: options.max_poll_attempts,
                polls: Mutex::new(HashMap::new()),
                extracting: Mutex::new(HashSet::new()),
                admission: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn vendor(&self) -> VendorKind {
        self.inner.adapter.kind()
    }

    /// Start a parse for `document_id`, or return the job already in flight.
    ///
    /// For a polling vendor this returns as soon as the job row exists; the
    /// upload, submission, and polling run in a background task. For an
    /// extract vendor the whole extraction runs before returning, and a
    /// vendor failure is returned as an error (after the job has been
    /// marked FAILED).
    ///
    /// An in-flight job with no task in this process is adopted and driven
    /// to completion here (`resumed` is set). One left behind by another
    /// vendor is failed with [`VENDOR_CHANGED_REASON`] and a new job starts.
    pub async fn request_parse(&self, document_id: &str) -> Result<ParseRequestOutcome, ParseError> {
        let inner = &self.inner;
        let doc = inner.document(document_id).await?;

        let initial = match inner.adapter {
            ProviderAdapter::Polling { .. } => JobStatus::Pending,
            ProviderAdapter::Extract(_) => JobStatus::Running,
        };
        let vendor = inner.adapter.kind();
        let candidate = ParseJob::new(&doc.id, vendor.as_str(), initial);

        // Held until the job's task is registered, so a job created here is
        // never mistaken for an orphan by a concurrent request.
        let admission = inner.admission.lock().await;
        let (job, resumed) = match inner.store.create_job(&candidate).await? {
            JobAdmission::Created(job) => {
                tracing::info!(document_id = %doc.id, job_id = %job.id, %vendor, "parse job created");
                (job, false)
            }
            JobAdmission::Existing(existing) if inner.is_tracked(&existing.id) => {
                tracing::info!(
                    document_id = %doc.id,
                    job_id = %existing.id,
                    status = %existing.status,
                    "parse already in flight"
                );
                return Ok(ParseRequestOutcome {
                    job_id: existing.id,
                    status: existing.status,
                    already_running: true,
                    resumed: false,
                });
            }
            JobAdmission::Existing(existing) if existing.vendor != vendor.as_str() => {
                tracing::warn!(
                    document_id = %doc.id,
                    job_id = %existing.id,
                    job_vendor = %existing.vendor,
                    %vendor,
                    "abandoning orphaned parse job"
                );
                inner.store.fail_job(&existing.id, VENDOR_CHANGED_REASON).await?;
                match inner.store.create_job(&candidate).await? {
                    JobAdmission::Created(job) => (job, false),
                    JobAdmission::Existing(other) => {
                        return Ok(ParseRequestOutcome {
                            job_id: other.id,
                            status: other.status,
                            already_running: true,
                            resumed: false,
                        });
                    }
                }
            }
            JobAdmission::Existing(existing) => {
                tracing::warn!(
                    document_id = %doc.id,
                    job_id = %existing.id,
                    status = %existing.status,
                    vendor_job_ref = existing.vendor_job_ref.as_deref().unwrap_or("-"),
                    "resuming orphaned parse job"
                );
                (existing, true)
            }
        };

        match inner.adapter.clone() {
            ProviderAdapter::Polling { vendor, options } => {
                let resume_ref = if resumed { job.vendor_job_ref.clone() } else { None };
                self.spawn_poll(doc, job.id.clone(), resume_ref, vendor, options);
                drop(admission);
                Ok(ParseRequestOutcome {
                    job_id: job.id,
                    status: job.status,
                    already_running: resumed,
                    resumed,
                })
            }
            ProviderAdapter::Extract(vendor) => {
                let _claim = inner.claim_extract(&job.id);
                drop(admission);
                if let Err(e) = inner.extract_and_finish(&doc, &job.id, vendor.as_ref()).await {
                    inner.fail(&job.id, &e.to_string()).await;
                    return Err(e);
                }
                let status = inner
                    .store
                    .get_job(&job.id)
                    .await?
                    .map(|j| j.status)
                    .unwrap_or(JobStatus::Completed);
                Ok(ParseRequestOutcome {
                    job_id: job.id,
                    status,
                    already_running: resumed,
                    resumed,
                })
            }
        }
    }

    /// Document status plus the latest job (any status) with its row counts.
    pub async fn get_parse_status(&self, document_id: &str) -> Result<ParseStatus, ParseError> {
        let inner = &self.inner;
        let doc = inner.document(document_id).await?;
        let job = match inner.store.latest_job(&doc.id).await? {
            Some(job) => {
                let counts = inner.store.job_counts(&job.id).await?;
                Some(JobSummary::new(job, counts))
            }
            None => None,
        };
        Ok(ParseStatus {
            document_id: doc.id,
            document_status: doc.status,
            job,
        })
    }

    /// Chunks and blocks of the latest COMPLETED job.
    pub async fn get_normalized_result(&self, document_id: &str) -> Result<NormalizedView, ParseError> {
        let inner = &self.inner;
        let doc = inner.document(document_id).await?;
        let job = inner
            .store
            .latest_completed_job(&doc.id)
            .await?
            .ok_or_else(|| ParseError::NoCompletedJob(doc.id.clone()))?;
        let chunks = inner.store.list_chunks(&job.id).await?;
        let blocks = inner.store.list_blocks(&job.id).await?;
        Ok(NormalizedView {
            job_id: job.id,
            chunks,
            blocks,
        })
    }

    pub async fn list_facts(&self, document_id: &str) -> Result<Vec<StructuredFact>, ParseError> {
        let doc = self.inner.document(document_id).await?;
        Ok(self.inner.store.list_facts(&doc.id).await?)
    }

    /// Re-run fact extraction over the stored chunks of the latest
    /// COMPLETED job, replacing the document's facts. Returns the number
    /// of facts stored.
    pub async fn refresh_facts(&self, document_id: &str) -> Result<usize, ParseError> {
        let inner = &self.inner;
        let doc = inner.document(document_id).await?;
        let job = inner
            .store
            .latest_completed_job(&doc.id)
            .await?
            .ok_or_else(|| ParseError::NoCompletedJob(doc.id.clone()))?;
        let chunks = inner.store.list_chunks(&job.id).await?;
        let facts = inner.build_facts(&doc, &extraction_text(&chunks));
        let count = facts.len();
        inner.store.replace_facts(&doc.id, &facts).await?;
        Ok(count)
    }

    /// Poll tasks that are still running, oldest first.
    pub fn active_polls(&self) -> Vec<ActivePoll> {
        let polls = self.inner.polls();
        let mut active: Vec<ActivePoll> = polls
            .iter()
            .filter(|(_, entry)| !entry.handle.is_finished())
            .map(|(job_id, entry)| ActivePoll {
                job_id: job_id.clone(),
                document_id: entry.document_id.clone(),
                started_at: entry.started_at,
            })
            .collect();
        active.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        active
    }

    /// Abort the poll task of `job_id`, if any, and mark the job FAILED
    /// with [`POLL_CANCELLED_REASON`]. A PENDING/RUNNING job with no task in
    /// this process is failed as well. Returns `false` if the job is
    /// unknown or had already finished.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, ParseError> {
        let entry = self.inner.polls().remove(job_id);
        if let Some(entry) = &entry {
            entry.handle.abort();
        }
        let failed = self.inner.store.fail_job(job_id, POLL_CANCELLED_REASON).await?;
        if failed {
            tracing::warn!(job_id, orphaned = entry.is_none(), "poll cancelled");
        }
        Ok(failed)
    }

    fn spawn_poll(
        &self,
        doc: Document,
        job_id: String,
        resume_ref: Option<String>,
        vendor: Arc<dyn PollingVendor>,
        options: SubmitOptions,
    ) {
        // The registry lock is held across spawn and insert so the task's
        // own removal can never run before its entry exists.
        let mut polls = self.inner.polls();
        let document_id = doc.id.clone();
        let inner = Arc::clone(&self.inner);
        let task_job_id = job_id.clone();
        let handle = tokio::spawn(async move {
            inner
                .run_poll_task(doc, task_job_id, resume_ref, vendor, options)
                .await;
        });
        polls.insert(
            job_id,
            PollEntry {
                document_id,
                started_at: chrono::Utc::now().timestamp(),
                handle,
            },
        );
    }
}

impl Inner {
    fn polls(&self) -> MutexGuard<'_, HashMap<String, PollEntry>> {
        self.polls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn extracting(&self) -> MutexGuard<'_, HashSet<String>> {
        self.extracting.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a task in this process owns `job_id`.
    fn is_tracked(&self, job_id: &str) -> bool {
        self.polls().contains_key(job_id) || self.extracting().contains(job_id)
    }

    fn claim_extract(&self, job_id: &str) -> ExtractClaim<'_> {
        self.extracting().insert(job_id.to_string());
        ExtractClaim {
            inner: self,
            job_id: job_id.to_string(),
        }
    }

    async fn document(&self, document_id: &str) -> Result<Document, ParseError> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| ParseError::DocumentNotFound(document_id.to_string()))
    }

    async fn run_poll_task(
        self: Arc<Self>,
        doc: Document,
        job_id: String,
        resume_ref: Option<String>,
        vendor: Arc<dyn PollingVendor>,
        options: SubmitOptions,
    ) {
        let result = self
            .drive_poll(&doc, &job_id, resume_ref, vendor.as_ref(), &options)
            .await;
        if let Err(e) = result {
            self.fail(&job_id, &e.to_string()).await;
        }
        self.polls().remove(&job_id);
    }

    /// Submit (uploading first when needed) unless resuming a submitted
    /// job, then poll until the vendor terminates, the job is found
    /// terminal, or the attempt budget runs out.
    async fn drive_poll(
        &self,
        doc: &Document,
        job_id: &str,
        resume_ref: Option<String>,
        vendor: &dyn PollingVendor,
        options: &SubmitOptions,
    ) -> Result<(), ParseError> {
        let job_ref = match resume_ref {
            Some(job_ref) => {
                tracing::info!(job_id, vendor_job_ref = %job_ref, "resuming poll");
                job_ref
            }
            None => self.submit(doc, job_id, vendor, options).await?,
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let response = vendor.poll(&job_ref).await?;
            tracing::debug!(
                job_id,
                vendor_job_ref = %job_ref,
                status = %response.status,
                vendor_status = %response.vendor_status,
                attempts,
                "poll"
            );

            match response.status {
                JobStatus::Completed => {
                    let raw = match response.result {
                        Some(JobResult::Inline(raw)) => raw,
                        Some(JobResult::Url(url)) => {
                            tracing::info!(job_id, "fetching large result");
                            vendor.fetch_large(&url).await?
                        }
                        None => {
                            return Err(VendorError::InvalidResponse(
                                "completed job carries no result".into(),
                            )
                            .into())
                        }
                    };
                    self.finish(doc, job_id, vendor.kind(), &raw, &response.metadata)
                        .await?;
                    return Ok(());
                }
                JobStatus::Failed => {
                    let reason = response.reason.unwrap_or_else(|| {
                        format!("vendor reported status {}", response.vendor_status)
                    });
                    self.fail(job_id, &reason).await;
                    return Ok(());
                }
                JobStatus::Pending | JobStatus::Running => {
                    let progress = JobProgress {
                        status: response.status,
                        progress: response.progress,
                        reason: response.reason,
                        metadata: response.metadata,
                    };
                    if !self.store.record_progress(job_id, &progress).await? {
                        tracing::info!(job_id, "job already terminal, stopping poll");
                        return Ok(());
                    }
                }
            }

            if self.max_poll_attempts > 0 && attempts >= self.max_poll_attempts {
                self.fail(job_id, &format!("polling timed out after {} attempts", attempts))
                    .await;
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn submit(
        &self,
        doc: &Document,
        job_id: &str,
        vendor: &dyn PollingVendor,
        options: &SubmitOptions,
    ) -> Result<String, ParseError> {
        let file_ref = match &doc.vendor_file_ref {
            Some(existing) => existing.clone(),
            None if is_remote(&doc.storage_location) => doc.storage_location.clone(),
            None => {
                let content = read_document(doc).await?;
                let file_ref = vendor
                    .upload(content, &file_name(&doc.storage_location), &doc.mime_type)
                    .await?;
                self.store
                    .set_vendor_refs(&doc.id, Some(&file_ref), None)
                    .await?;
                tracing::info!(document_id = %doc.id, %file_ref, "uploaded to vendor");
                file_ref
            }
        };

        let job_ref = vendor.submit(&file_ref, options).await?;
        self.store.set_job_vendor_ref(job_id, &job_ref).await?;
        self.store
            .set_vendor_refs(&doc.id, None, Some(&job_ref))
            .await?;
        tracing::info!(document_id = %doc.id, job_id, vendor_job_ref = %job_ref, "parse submitted");
        Ok(job_ref)
    }

    async fn extract_and_finish(
        &self,
        doc: &Document,
        job_id: &str,
        vendor: &dyn ExtractVendor,
    ) -> Result<(), ParseError> {
        let content = read_document(doc).await?;
        let raw = vendor.extract(content, &doc.mime_type).await?;
        let metadata = JobMetadata {
            result_type: Some("elements".to_string()),
            ..JobMetadata::default()
        };
        self.finish(doc, job_id, vendor.kind(), &raw, &metadata).await
    }

    /// Normalize, persist, and mine facts from a finished vendor result.
    async fn finish(
        &self,
        doc: &Document,
        job_id: &str,
        kind: VendorKind,
        raw: &serde_json::Value,
        metadata: &JobMetadata,
    ) -> Result<(), ParseError> {
        let normalized = normalize(kind, raw)?;
        let stored = self
            .store
            .complete_job(job_id, metadata, &normalized.chunks, &normalized.blocks)
            .await?;
        if !stored {
            tracing::warn!(job_id, "job already terminal, discarding result");
            return Ok(());
        }
        tracing::info!(
            document_id = %doc.id,
            job_id,
            chunks = normalized.chunks.len(),
            blocks = normalized.blocks.len(),
            "parse job completed"
        );

        // Best effort: the document stays PARSED whatever happens here.
        let facts = self.build_facts(doc, &normalized.extraction_text());
        match self.store.replace_facts(&doc.id, &facts).await {
            Ok(()) => tracing::info!(document_id = %doc.id, count = facts.len(), "facts extracted"),
            Err(e) => tracing::warn!(document_id = %doc.id, error = %e, "fact extraction failed"),
        }
        Ok(())
    }

    fn build_facts(&self, doc: &Document, text: &str) -> Vec<StructuredFact> {
        self.extractor
            .extract(text)
            .into_iter()
            .map(|fact| StructuredFact::from_extracted(&doc.patient_id, &doc.id, fact))
            .collect()
    }

    async fn fail(&self, job_id: &str, reason: &str) {
        match self.store.fail_job(job_id, reason).await {
            Ok(true) => tracing::warn!(job_id, reason, "parse job failed"),
            Ok(false) => tracing::debug!(job_id, reason, "job already terminal, failure ignored"),
            Err(e) => tracing::error!(job_id, error = %e, "could not record job failure"),
        }
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn file_name(location: &str) -> String {
    Path::new(location)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document")
        .to_string()
}

async fn read_document(doc: &Document) -> Result<Vec<u8>, ParseError> {
    tokio::fs::read(&doc.storage_location)
        .await
        .map_err(|source| ParseError::FileRead {
            path: doc.storage_location.clone(),
            source,
        })
}
