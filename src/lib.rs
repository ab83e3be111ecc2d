//! # Knowledge Builder
//!
//! Incremental, resumable extraction of source-grounded knowledge statements
//! from a chat-message table, using a language model as a structured
//! extraction oracle.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────────┐   ┌──────────────┐
//! │  SQLite  │──▶│ Planner │──▶│    Driver    │──▶│ Dedup + Log  │
//! │ messages │   │ batches │   │ repair/fall- │   │ knowledge.   │
//! └──────────┘   └─────────┘   │ back via LLM │   │ jsonl        │
//!                              └──────────────┘   └──────┬───────┘
//!                                                        ▼
//!                                                 ┌──────────────┐
//!                                                 │  Checkpoint  │
//!                                                 │ last_id+hash │
//!                                                 └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb run --backend mock --limit-rows 100   # offline smoke run
//! kb status                                # where did it stop?
//! kb run --backend live                    # continue with a real model
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | SQLite message source with column detection |
//! | [`planner`] | Token-budgeted batch planning |
//! | [`prompt`] | Extraction and repair prompt assembly |
//! | [`schema`] | Response parsing, validation, grounding |
//! | [`llm`] | Model client abstraction (mock, live) |
//! | [`driver`] | Repair/fallback state machine per batch |
//! | [`fact_hash`] | Stable fact hashing |
//! | [`checkpoint`] | Atomic resume state |
//! | [`knowledge_log`] | Append-only fact output |
//! | [`audit`] | Raw attempt artifacts |
//! | [`coordinator`] | The run loop |
//! | [`progress`] | Progress reporting |
//! | [`status`] | `kb status` |
//! | [`db`] | Database connection |

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod driver;
pub mod fact_hash;
pub mod knowledge_log;
pub mod llm;
pub mod models;
pub mod planner;
pub mod progress;
pub mod prompt;
pub mod schema;
pub mod source;
pub mod status;
