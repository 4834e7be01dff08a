//! Service layer containing business logic and side-effect helpers.
//!
//! ## Service map
//! - `contracts.rs` — document validation and cross-document invariants.
//! - `registry.rs` — extension discovery and duplicate detection.
//! - `migrate.rs` — command contract migration for extension descriptors.
//! - `builder.rs` — manifest resolution and package writing.
//! - `auditor.rs` — read-only package verification.
//! - `importer.rs` — staged, journaled package application.
//! - `undo_log.rs` — on-disk undo log that makes interrupted imports recoverable.
//! - `paths.rs` — traversal-safe path handling and glob matching.
//! - `digest.rs` — sha-256 helpers, aggregate checksum, sidecar format.
//! - `storage.rs` — tool config, JSON load/dump, file moves, journal.
//! - `output.rs` — JSON/text output helpers.
//!
//! ## Conventions
//! - Prefer pure helpers where possible.
//! - Side effects should be explicit and localized.
//! - Keep command handlers thin; delegate to services.

pub mod auditor;
pub mod builder;
pub mod contracts;
pub mod digest;
pub mod importer;
pub mod migrate;
pub mod output;
pub mod paths;
pub mod registry;
pub mod storage;
pub mod undo_log;
