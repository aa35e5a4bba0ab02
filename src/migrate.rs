use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            patient_id TEXT NOT NULL,
            storage_location TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'UPLOADED',
            vendor_file_ref TEXT,
            vendor_job_ref TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parse_jobs (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            vendor TEXT NOT NULL,
            vendor_job_ref TEXT,
            status TEXT NOT NULL,
            progress REAL,
            reason TEXT,
            result_type TEXT,
            duration_seconds REAL,
            num_pages INTEGER,
            credits REAL,
            studio_link TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parsed_chunks (
            parse_job_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            PRIMARY KEY (parse_job_id, chunk_index),
            FOREIGN KEY (parse_job_id) REFERENCES parse_jobs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parsed_blocks (
            parse_job_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            block_index INTEGER NOT NULL,
            block_type TEXT NOT NULL,
            content TEXT NOT NULL,
            bbox_page INTEGER NOT NULL,
            bbox_left REAL NOT NULL,
            bbox_top REAL NOT NULL,
            bbox_width REAL NOT NULL,
            bbox_height REAL NOT NULL,
            confidence REAL,
            PRIMARY KEY (parse_job_id, chunk_index, block_index),
            FOREIGN KEY (parse_job_id) REFERENCES parse_jobs(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS structured_facts (
            id TEXT PRIMARY KEY,
            patient_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            fact_type TEXT NOT NULL,
            value TEXT NOT NULL,
            description TEXT,
            confidence REAL NOT NULL,
            evidence TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one PENDING/RUNNING job per document.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_parse_jobs_one_active
        ON parse_jobs(document_id) WHERE status IN ('PENDING', 'RUNNING')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_parse_jobs_document ON parse_jobs(document_id, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_facts_document ON structured_facts(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_facts_patient ON structured_facts(patient_id)")
        .execute(pool)
        .await?;

    Ok(())
}
