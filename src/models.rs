//! Core data models used throughout the parse pipeline.
//!
//! These types represent the documents, parse jobs, normalized chunks and
//! blocks, and mined facts that flow from vendor extraction to storage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an uploaded [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Uploaded,
    Parsing,
    Parsed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "UPLOADED",
            DocumentStatus::Parsing => "PARSING",
            DocumentStatus::Parsed => "PARSED",
            DocumentStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADED" => Ok(DocumentStatus::Uploaded),
            "PARSING" => Ok(DocumentStatus::Parsing),
            "PARSED" => Ok(DocumentStatus::Parsed),
            "ERROR" => Ok(DocumentStatus::Error),
            other => anyhow::bail!("unknown document status: {}", other),
        }
    }
}

/// Canonical status of a [`ParseJob`].
///
/// `Completed` and `Failed` are terminal: once a job reaches either, no
/// later update may move it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => anyhow::bail!("unknown job status: {}", other),
        }
    }
}

/// One uploaded file.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub patient_id: String,
    /// Local path (or URL) of the stored upload.
    pub storage_location: String,
    pub mime_type: String,
    pub status: DocumentStatus,
    /// Reference returned by the vendor's upload endpoint, reused across attempts.
    pub vendor_file_ref: Option<String>,
    /// Vendor job reference of the most recent submission.
    pub vendor_job_ref: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Document {
    /// Build a freshly uploaded document with a new id.
    pub fn new_upload(patient_id: &str, storage_location: &str, mime_type: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            patient_id: patient_id.to_string(),
            storage_location: storage_location.to_string(),
            mime_type: mime_type.to_string(),
            status: DocumentStatus::Uploaded,
            vendor_file_ref: None,
            vendor_job_ref: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result-shape metadata reported by a vendor for a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// `full`, `url` or `elements`.
    pub result_type: Option<String>,
    pub duration_seconds: Option<f64>,
    pub num_pages: Option<i64>,
    pub credits: Option<f64>,
    pub studio_link: Option<String>,
}

/// One attempt to extract a [`Document`] through one vendor.
#[derive(Debug, Clone, Serialize)]
pub struct ParseJob {
    pub id: String,
    pub document_id: String,
    pub vendor: String,
    pub vendor_job_ref: Option<String>,
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub reason: Option<String>,
    pub metadata: JobMetadata,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ParseJob {
    pub fn new(document_id: &str, vendor: &str, status: JobStatus) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            vendor: vendor.to_string(),
            vendor_job_ref: None,
            status,
            progress: None,
            reason: None,
            metadata: JobMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Position of a block on a page. `page` is 1-based; coordinates use a
/// top-left origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub page: i64,
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// An ordered unit of extracted text belonging to a parse job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedChunk {
    pub chunk_index: i64,
    pub content: String,
}

/// A positioned sub-element of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedBlock {
    pub chunk_index: i64,
    pub block_index: i64,
    #[serde(rename = "type")]
    pub block_type: String,
    pub content: String,
    pub bbox: BoundingBox,
    /// `None` when the vendor did not report a confidence for this block.
    pub confidence: Option<f64>,
}

/// Kind of a [`StructuredFact`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FactType {
    Vitals,
    Allergy,
    Medication,
}

impl FactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactType::Vitals => "VITALS",
            FactType::Allergy => "ALLERGY",
            FactType::Medication => "MEDICATION",
        }
    }
}

impl fmt::Display for FactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FactType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VITALS" => Ok(FactType::Vitals),
            "ALLERGY" => Ok(FactType::Allergy),
            "MEDICATION" => Ok(FactType::Medication),
            other => anyhow::bail!("unknown fact type: {}", other),
        }
    }
}

/// A fact produced by the extractor, before it is attributed and stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedFact {
    pub fact_type: FactType,
    pub value: String,
    pub description: Option<String>,
    pub confidence: f64,
    /// Quoted source text supporting the fact.
    pub evidence: String,
}

/// A typed entity mined from a document and persisted for a patient.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredFact {
    pub id: String,
    pub patient_id: String,
    pub document_id: String,
    pub fact_type: FactType,
    pub value: String,
    pub description: Option<String>,
    pub confidence: f64,
    pub evidence: String,
    pub created_at: i64,
}

impl StructuredFact {
    pub fn from_extracted(patient_id: &str, document_id: &str, fact: ExtractedFact) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            patient_id: patient_id.to_string(),
            document_id: document_id.to_string(),
            fact_type: fact.fact_type,
            value: fact.value,
            description: fact.description,
            confidence: fact.confidence,
            evidence: fact.evidence,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}
