//! SemperVigil worker: durable job queue, worker pool, and the full
//! content-processing pipeline (ingest → fetch → summarize → publish →
//! build), plus CVE sync and event correlation.
//!
//! All coordination between processes flows through the shared database;
//! every pipeline transition is a durable enqueue, never an in-process call.

pub mod admin;
pub mod content;
pub mod cve;
pub mod db;
pub mod events;
pub mod ingest;
pub mod llm;
pub mod publish;
pub mod queue;
pub mod worker;
