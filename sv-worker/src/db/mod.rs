//! Per-entity database operations.
//!
//! One module per aggregate; all writes are idempotent upserts with
//! non-null-overwrites-existing merge semantics.

pub mod articles;
pub mod cves;
pub mod events;
pub mod health;
pub mod llm;
pub mod products;
pub mod sources;
