//! # Build Harvest
//!
//! Ingests published character build guides from guide sites, resolves the
//! planner documents each guide embeds, and extracts normalized item usages
//! enriched with a master item catalog.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────┐   ┌──────────┐
//! │ Guide Lister │──▶│   Profile    │──▶│  Parser  │──▶│  SQLite  │
//! │ search + TTL │   │   Resolver   │   │ + Catalog│   │  store   │
//! └──────────────┘   └──────────────┘   └──────────┘   └──────────┘
//!         ▲                  ▲
//!         └──── HttpFetcher (retry, backoff, rate limit) ────┘
//! ```
//!
//! The [`ingest::Orchestrator`] drives one guide at a time through the
//! stages above, with bounded parallelism across guides, cooperative
//! cancellation and a per-run re-entry guard.
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                   # create database
//! harvest sources                # check configured guide sites
//! harvest sync all               # ingest every source
//! harvest sync web:maxroll --guide whirlwind-barbarian
//! harvest stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`http`] | Retrying HTTP fetcher and rate limiter |
//! | [`cache`] | File-backed TTL caches |
//! | [`lister`] | Paginated guide listing |
//! | [`resolver`] | Planner id extraction and payload fetch |
//! | [`parser`] | Planner payload parsing |
//! | [`catalog`] | Item catalog loading and enrichment |
//! | [`traits`] | Guide source trait and registry |
//! | [`connector_web`] | Built-in web guide source |
//! | [`ingest`] | Orchestrator and `sync` command |
//! | [`sqlite_store`] | SQLite usage store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod catalog;
pub mod config;
pub mod connector_web;
pub mod db;
pub mod http;
pub mod ingest;
pub mod lister;
pub mod logging;
pub mod migrate;
pub mod parser;
pub mod progress;
pub mod resolver;
pub mod schedule;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
pub mod traits;
