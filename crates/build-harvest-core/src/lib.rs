//! # Build Harvest Core
//!
//! Shared types for Build Harvest: the guide/profile/item-usage data model,
//! the structured error taxonomy, and the [`store::UsageStore`] abstraction
//! the ingestion pipeline writes into.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! pipeline itself (listing, resolving, parsing, orchestration) lives in
//! the `build-harvest` crate.

pub mod error;
pub mod models;
pub mod store;

pub use error::{ErrorKind, HarvestError};
