//! # ThreatScope
//!
//! A local-first, retrieval-augmented pipeline for threat intelligence
//! reports and incident logs.
//!
//! ThreatScope ingests raw reports (plain text, logs, PDFs), normalizes
//! them into canonical text, chunks them with provenance-preserving byte
//! spans, annotates chunks with ATT&CK-style techniques, extracts and
//! deduplicates indicators of compromise, and embeds everything into a
//! SQLite-backed vector index. On top of that sit a filtered semantic
//! retriever and a grounded answer generator that cites the chunks it
//! used.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────┐   ┌───────────┐
//! │   Reports    │──▶│       Pipeline         │──▶│  SQLite    │
//! │ txt/log/pdf  │   │ Normalize+Chunk+Annot │   │ docs+vecs │
//! └──────────────┘   └───────────────────────┘   └────┬──────┘
//!                                                     │
//!                                    ┌────────────────┤
//!                                    ▼                ▼
//!                              ┌───────────┐    ┌───────────┐
//!                              │ Retriever │──▶│ Generator │
//!                              │ (search)  │    │  (ask)    │
//!                              └───────────┘    └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tscope init                          # create database
//! tscope ingest ./reports              # ingest report files
//! tscope embed pending                 # backfill embeddings
//! tscope search "credential dumping"   # ranked chunk retrieval
//! tscope ask "how did they get in?"    # grounded answer with citations
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`normalize`] | Format detection and text canonicalization |
//! | [`chunk`] | Overlapping, boundary-preferring chunking |
//! | [`catalog`] | Technique reference catalog |
//! | [`techniques`] | Technique matching over chunk text |
//! | [`ioc`] | Indicator extraction, dedup, and enrichment |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index with entity pre-filtering |
//! | [`retrieve`] | Candidate retrieval and re-ranking |
//! | [`generate`] | Grounded answer generation |
//! | [`ingest`] | Per-document ingestion pipeline |
//! | [`store`] | Document and annotation persistence |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod generate;
pub mod index;
pub mod ingest;
pub mod inspect;
pub mod ioc;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod retrieve;
pub mod store;
pub mod techniques;
