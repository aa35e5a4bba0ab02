//! SQLite-backed [`Store`] implementation.
//!
//! Job transitions are written as conditional `UPDATE ... WHERE status IN
//! ('PENDING', 'RUNNING')`, so a terminal job is never rewritten. The
//! one-active-job rule is enforced by the partial unique index
//! `idx_parse_jobs_one_active` created in [`crate::migrate`].

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{
    BoundingBox, Document, DocumentStatus, JobMetadata, ParseJob, ParsedBlock, ParsedChunk,
    StructuredFact,
};

use super::{JobAdmission, JobCounts, JobProgress, Store};

/// Attempts at inserting a job before giving up on a contended document.
const CREATE_JOB_ATTEMPTS: usize = 3;

const JOB_COLUMNS: &str = "id, document_id, vendor, vendor_job_ref, status, progress, reason, \
     result_type, duration_seconds, num_pages, credits, studio_link, created_at, updated_at";

const DOCUMENT_COLUMNS: &str = "id, patient_id, storage_location, mime_type, status, \
     vendor_file_ref, vendor_job_ref, created_at, updated_at";

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn active_job(&self, document_id: &str) -> Result<Option<ParseJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM parse_jobs WHERE document_id = ? AND status IN ('PENDING', 'RUNNING') LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        patient_id: row.get("patient_id"),
        storage_location: row.get("storage_location"),
        mime_type: row.get("mime_type"),
        status: status.parse()?,
        vendor_file_ref: row.get("vendor_file_ref"),
        vendor_job_ref: row.get("vendor_job_ref"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_job(row: &SqliteRow) -> Result<ParseJob> {
    let status: String = row.get("status");
    Ok(ParseJob {
        id: row.get("id"),
        document_id: row.get("document_id"),
        vendor: row.get("vendor"),
        vendor_job_ref: row.get("vendor_job_ref"),
        status: status.parse()?,
        progress: row.get("progress"),
        reason: row.get("reason"),
        metadata: JobMetadata {
            result_type: row.get("result_type"),
            duration_seconds: row.get("duration_seconds"),
            num_pages: row.get("num_pages"),
            credits: row.get("credits"),
            studio_link: row.get("studio_link"),
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_fact(row: &SqliteRow) -> Result<StructuredFact> {
    let fact_type: String = row.get("fact_type");
    Ok(StructuredFact {
        id: row.get("id"),
        patient_id: row.get("patient_id"),
        document_id: row.get("document_id"),
        fact_type: fact_type.parse()?,
        value: row.get("value"),
        description: row.get("description"),
        confidence: row.get("confidence"),
        evidence: row.get("evidence"),
        created_at: row.get("created_at"),
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, patient_id, storage_location, mime_type, status,
                                   vendor_file_ref, vendor_job_ref, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.patient_id)
        .bind(&doc.storage_location)
        .bind(&doc.mime_type)
        .bind(doc.status.as_str())
        .bind(&doc.vendor_file_ref)
        .bind(&doc.vendor_job_ref)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn list_documents(&self) -> Result<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM documents ORDER BY created_at DESC, id ASC",
            DOCUMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn set_document_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_vendor_refs(
        &self,
        id: &str,
        file_ref: Option<&str>,
        job_ref: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents SET
                vendor_file_ref = COALESCE(?, vendor_file_ref),
                vendor_job_ref = COALESCE(?, vendor_job_ref),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(file_ref)
        .bind(job_ref)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_job(&self, job: &ParseJob) -> Result<JobAdmission> {
        for _ in 0..CREATE_JOB_ATTEMPTS {
            let mut tx = self.pool.begin().await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO parse_jobs (id, document_id, vendor, vendor_job_ref, status, progress,
                                        reason, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.document_id)
            .bind(&job.vendor)
            .bind(&job.vendor_job_ref)
            .bind(job.status.as_str())
            .bind(job.progress)
            .bind(&job.reason)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {
                    sqlx::query("UPDATE documents SET status = 'PARSING', updated_at = ? WHERE id = ?")
                        .bind(now())
                        .bind(&job.document_id)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    return Ok(JobAdmission::Created(job.clone()));
                }
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback().await?;
                    // The active job may have finished between the failed
                    // insert and this read; in that case try again.
                    if let Some(existing) = self.active_job(&job.document_id).await? {
                        return Ok(JobAdmission::Existing(existing));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        anyhow::bail!(
            "could not admit parse job for document {} after {} attempts",
            job.document_id,
            CREATE_JOB_ATTEMPTS
        )
    }

    async fn set_job_vendor_ref(&self, job_id: &str, vendor_job_ref: &str) -> Result<()> {
        sqlx::query("UPDATE parse_jobs SET vendor_job_ref = ?, updated_at = ? WHERE id = ?")
            .bind(vendor_job_ref)
            .bind(now())
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<ParseJob>> {
        let row = sqlx::query(&format!("SELECT {} FROM parse_jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn latest_job(&self, document_id: &str) -> Result<Option<ParseJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM parse_jobs WHERE document_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn latest_completed_job(&self, document_id: &str) -> Result<Option<ParseJob>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM parse_jobs WHERE document_id = ? AND status = 'COMPLETED' \
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn record_progress(&self, job_id: &str, progress: &JobProgress) -> Result<bool> {
        if progress.status.is_terminal() {
            anyhow::bail!("record_progress called with terminal status {}", progress.status);
        }
        let meta = &progress.metadata;
        let result = sqlx::query(
            r#"
            UPDATE parse_jobs SET
                status = ?, progress = ?, reason = ?,
                result_type = ?, duration_seconds = ?, num_pages = ?, credits = ?, studio_link = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(progress.status.as_str())
        .bind(progress.progress)
        .bind(&progress.reason)
        .bind(&meta.result_type)
        .bind(meta.duration_seconds)
        .bind(meta.num_pages)
        .bind(meta.credits)
        .bind(&meta.studio_link)
        .bind(now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_job(
        &self,
        job_id: &str,
        metadata: &JobMetadata,
        chunks: &[ParsedChunk],
        blocks: &[ParsedBlock],
    ) -> Result<bool> {
        let ts = now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE parse_jobs SET
                status = 'COMPLETED', progress = 100, reason = NULL,
                result_type = ?, duration_seconds = ?, num_pages = ?, credits = ?, studio_link = ?,
                updated_at = ?
            WHERE id = ? AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(&metadata.result_type)
        .bind(metadata.duration_seconds)
        .bind(metadata.num_pages)
        .bind(metadata.credits)
        .bind(&metadata.studio_link)
        .bind(ts)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO parsed_chunks (parse_job_id, chunk_index, content) VALUES (?, ?, ?)",
            )
            .bind(job_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;
        }

        for block in blocks {
            sqlx::query(
                r#"
                INSERT INTO parsed_blocks (parse_job_id, chunk_index, block_index, block_type, content,
                                           bbox_page, bbox_left, bbox_top, bbox_width, bbox_height, confidence)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job_id)
            .bind(block.chunk_index)
            .bind(block.block_index)
            .bind(&block.block_type)
            .bind(&block.content)
            .bind(block.bbox.page)
            .bind(block.bbox.left)
            .bind(block.bbox.top)
            .bind(block.bbox.width)
            .bind(block.bbox.height)
            .bind(block.confidence)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE documents SET status = 'PARSED', updated_at = ? \
             WHERE id = (SELECT document_id FROM parse_jobs WHERE id = ?)",
        )
        .bind(ts)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn fail_job(&self, job_id: &str, reason: &str) -> Result<bool> {
        let ts = now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE parse_jobs SET status = 'FAILED', reason = ?, updated_at = ? \
             WHERE id = ? AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(reason)
        .bind(ts)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE documents SET status = 'ERROR', updated_at = ? \
             WHERE id = (SELECT document_id FROM parse_jobs WHERE id = ?)",
        )
        .bind(ts)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn job_counts(&self, job_id: &str) -> Result<JobCounts> {
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parsed_chunks WHERE parse_job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        let blocks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parsed_blocks WHERE parse_job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(JobCounts {
            chunks: chunks as usize,
            blocks: blocks as usize,
        })
    }

    async fn list_chunks(&self, job_id: &str) -> Result<Vec<ParsedChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_index, content FROM parsed_chunks WHERE parse_job_id = ? ORDER BY chunk_index ASC",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ParsedChunk {
                chunk_index: row.get("chunk_index"),
                content: row.get("content"),
            })
            .collect())
    }

    async fn list_blocks(&self, job_id: &str) -> Result<Vec<ParsedBlock>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_index, block_index, block_type, content,
                   bbox_page, bbox_left, bbox_top, bbox_width, bbox_height, confidence
            FROM parsed_blocks WHERE parse_job_id = ?
            ORDER BY chunk_index ASC, block_index ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ParsedBlock {
                chunk_index: row.get("chunk_index"),
                block_index: row.get("block_index"),
                block_type: row.get("block_type"),
                content: row.get("content"),
                bbox: BoundingBox {
                    page: row.get("bbox_page"),
                    left: row.get("bbox_left"),
                    top: row.get("bbox_top"),
                    width: row.get("bbox_width"),
                    height: row.get("bbox_height"),
                },
                confidence: row.get("confidence"),
            })
            .collect())
    }

    async fn replace_facts(&self, document_id: &str, facts: &[StructuredFact]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM structured_facts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for fact in facts {
            sqlx::query(
                r#"
                INSERT INTO structured_facts (id, patient_id, document_id, fact_type, value,
                                              description, confidence, evidence, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&fact.id)
            .bind(&fact.patient_id)
            .bind(&fact.document_id)
            .bind(fact.fact_type.as_str())
            .bind(&fact.value)
            .bind(&fact.description)
            .bind(fact.confidence)
            .bind(&fact.evidence)
            .bind(fact.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_facts(&self, document_id: &str) -> Result<Vec<StructuredFact>> {
        let rows = sqlx::query(
            r#"
            SELECT id, patient_id, document_id, fact_type, value, description, confidence,
                   evidence, created_at
            FROM structured_facts WHERE document_id = ?
            ORDER BY rowid ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_fact).collect()
    }
}
