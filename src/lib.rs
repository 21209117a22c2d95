//! # Gravity
//!
//! A multi-market filing ingestion, analysis, and retrieval pipeline.
//!
//! Gravity polls regulatory filing providers (SEC EDGAR, NSE/BSE, a
//! simulated SEA feed), extracts structured financial facts through a
//! model adapter with validate/reflect-once/dead-letter semantics, indexes
//! the facts for hybrid lexical+semantic retrieval, and answers natural
//! language questions with cited, confidence-scored markdown.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   ┌────────────┐   ┌────────────┐   ┌───────────┐
//! │  Ingestion    │──▶│  Analysis  │──▶│ Knowledge  │   │   Query   │
//! │ poll/dedupe/  │   │ extract/   │   │ chunk/     │   │ retrieve/ │
//! │ fetch/merge   │   │ reflect/DL │   │ BM25 swap  │   │ RRF/answer│
//! └──────┬────────┘   └─────┬──────┘   └─────┬──────┘   └─────┬─────┘
//!        │                  │                │                │
//!        ▼                  ▼                ▼                ▼
//!   state store        checkpoints      chunk store      chunk store
//!   (SQLite)           (SQLite)         (SQLite)         (SQLite)
//! ```
//!
//! The four stages are small sequential state machines; parallelism exists
//! only at the orchestrator boundary (independent filings analyzed by
//! independent workers over the shared stores).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`provider`] | Market provider trait and factory |
//! | [`model`] | Model adapter seam (Gemini) |
//! | [`extraction`] | Fact extraction, validation, synthesis |
//! | [`rag`] | Hybrid BM25 + semantic retrieval with RRF |
//! | [`orchestrator`] | Stage sequencing, checkpoints, replay |
//! | [`state_store`] | Durable filing status, watchlists, notifications |
//! | [`checkpoint`] | Per-(graph, thread) state snapshots |

pub mod backfill;
pub mod checkpoint;
pub mod confidence;
pub mod config;
pub mod db;
pub mod embedding;
pub mod extraction;
pub mod migrate;
pub mod model;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod provider;
pub mod provider_edgar;
pub mod provider_india;
pub mod provider_sea;
pub mod rag;
pub mod stage_analysis;
pub mod stage_ingestion;
pub mod stage_knowledge;
pub mod stage_query;
pub mod state_store;
pub mod stats;
