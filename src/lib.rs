//! # Clinical Parse
//!
//! Parse orchestration and normalization for clinical documents.
//!
//! Layout extraction is delegated to an external vendor. This crate drives
//! each document through upload, vendor submission, asynchronous
//! completion, normalization into canonical chunks and blocks, and
//! heuristic fact extraction (vitals, allergies, medications).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//! │  CLI / HTTP  │──▶│  Orchestrator  │──▶│    Vendor    │
//! │ (cparse/API) │   │ dedupe + polls │   │ Reducto/Adobe│
//! └──────────────┘   └───────┬────────┘   └──────┬───────┘
//!                            │     raw result    │
//!                            ▼◀──────────────────┘
//!                  ┌───────────────────┐   ┌──────────┐
//!                  │ Normalize + Facts │──▶│  Store   │
//!                  └───────────────────┘   │ SQLite/mem│
//!                                          └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cparse init
//! cparse add ./uploads/discharge.pdf --patient p-001
//! cparse parse <document-id>
//! cparse facts <document-id>
//! cparse serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Documents, jobs, chunks, blocks, facts |
//! | [`error`] | Vendor and parse error taxonomy |
//! | [`store`] | Storage trait with in-memory and SQLite backends |
//! | [`vendor`] | Provider adapters (polling and extract vendors) |
//! | [`normalize`] | Vendor payload → canonical chunks/blocks |
//! | [`facts`] | Heuristic fact rules |
//! | [`orchestrator`] | Parse lifecycle and poll registry |
//! | [`server`] | JSON HTTP API |
//! | [`commands`] | CLI command implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod facts;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod server;
pub mod store;
pub mod vendor;
