//! `cparse` command implementations.
//!
//! Each `run_*` function opens the database named in the config, performs
//! one operation, and prints the result to stdout. Diagnostics go through
//! `tracing` (stderr).

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db;
use crate::models::{Document, JobStatus};
use crate::orchestrator::{OrchestratorOptions, ParseOrchestrator, ParseStatus};
use crate::store::sqlite::SqliteStore;
use crate::store::Store;
use crate::vendor;

/// Longest pause between status checks while following a job.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Build an orchestrator over the configured SQLite database and vendor.
pub async fn build_orchestrator(config: &Config) -> Result<ParseOrchestrator> {
    let pool = db::connect(config).await?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
    let adapter = vendor::create_adapter(config)?;
    Ok(ParseOrchestrator::new(
        store,
        adapter,
        OrchestratorOptions::from_config(&config.parser),
    ))
}

/// Register an already-uploaded file as a Document in status `UPLOADED`.
pub async fn register_document(
    store: &dyn Store,
    path: &Path,
    patient_id: &str,
    mime_type: Option<&str>,
) -> Result<Document> {
    if patient_id.trim().is_empty() {
        bail!("patient id must not be empty");
    }
    let path = path
        .canonicalize()
        .with_context(|| format!("File not found: {}", path.display()))?;
    if !path.is_file() {
        bail!("Not a file: {}", path.display());
    }
    let mime_type = match mime_type {
        Some(m) => m.to_string(),
        None => mime_guess::from_path(&path)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    };

    let doc = Document::new_upload(patient_id, &path.to_string_lossy(), &mime_type);
    store.insert_document(&doc).await?;
    tracing::info!(document_id = %doc.id, patient_id, mime_type = %doc.mime_type, "document registered");
    Ok(doc)
}

pub async fn run_add(
    config: &Config,
    path: &Path,
    patient_id: &str,
    mime_type: Option<&str>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let doc = register_document(&store, path, patient_id, mime_type).await?;
    pool.close().await;

    println!("{}", doc.id);
    Ok(())
}

pub async fn run_documents(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let docs = store.list_documents().await?;
    pool.close().await;

    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }
    println!("{:<38} {:<10} {:<16} {}", "ID", "STATUS", "PATIENT", "LOCATION");
    for doc in docs {
        println!(
            "{:<38} {:<10} {:<16} {}",
            doc.id,
            doc.status.as_str(),
            doc.patient_id,
            doc.storage_location
        );
    }
    Ok(())
}

/// Request a parse and follow the job until it is terminal.
///
/// A polling vendor's poll task lives in this process, so the command
/// stays until the job finishes. A job left in flight by an earlier run is
/// resumed here. Exits with an error if the job fails.
pub async fn run_parse(config: &Config, document_id: &str) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let outcome = orchestrator.request_parse(document_id).await?;
    if outcome.resumed {
        println!("Resuming parse: job {}", outcome.job_id);
    } else if outcome.already_running {
        println!("Parse already in progress: job {}", outcome.job_id);
    } else {
        println!("Parse started: job {}", outcome.job_id);
    }

    let follow = Duration::from_secs(config.parser.poll_interval_secs).min(FOLLOW_INTERVAL);
    let mut last_seen: Option<(JobStatus, Option<f64>)> = None;
    loop {
        let status = orchestrator.get_parse_status(document_id).await?;
        let Some(job) = status.job.as_ref().filter(|j| j.id == outcome.job_id) else {
            bail!("parse job {} disappeared", outcome.job_id);
        };

        let seen = (job.status, job.progress);
        if last_seen != Some(seen) {
            match job.progress {
                Some(p) => println!("  {} ({:.0}%)", job.status, p),
                None => println!("  {}", job.status),
            }
            last_seen = Some(seen);
        }

        if job.status.is_terminal() {
            print_status(&status);
            if job.status == JobStatus::Failed {
                bail!(
                    "parse failed: {}",
                    job.reason.as_deref().unwrap_or("unknown reason")
                );
            }
            return Ok(());
        }
        tokio::time::sleep(follow).await;
    }
}

pub async fn run_status(config: &Config, document_id: &str) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let status = orchestrator.get_parse_status(document_id).await?;
    print_status(&status);
    Ok(())
}

fn print_status(status: &ParseStatus) {
    println!("document:     {}", status.document_id);
    println!("status:       {}", status.document_status);
    match &status.job {
        Some(job) => {
            println!("job:          {} ({})", job.id, job.vendor);
            println!("job status:   {}", job.status);
            if let Some(p) = job.progress {
                println!("progress:     {:.0}%", p);
            }
            if let Some(reason) = &job.reason {
                println!("reason:       {}", reason);
            }
            println!("chunks:       {}", job.chunk_count);
            println!("blocks:       {}", job.block_count);
        }
        None => println!("job:          (none)"),
    }
}

/// Print the normalized result of the latest completed job as JSON.
pub async fn run_result(config: &Config, document_id: &str) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    let view = orchestrator.get_normalized_result(document_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

pub async fn run_facts(config: &Config, document_id: &str, refresh: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config).await?;
    if refresh {
        let count = orchestrator.refresh_facts(document_id).await?;
        println!("Re-extracted {} facts.", count);
    }

    let facts = orchestrator.list_facts(document_id).await?;
    if facts.is_empty() {
        println!("No facts.");
        return Ok(());
    }
    for fact in facts {
        println!(
            "{:<10} {:<24} {:<24} {:.2}",
            fact.fact_type.as_str(),
            fact.value,
            fact.description.as_deref().unwrap_or("-"),
            fact.confidence
        );
    }
    Ok(())
}
