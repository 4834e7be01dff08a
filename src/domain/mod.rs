//! Shared data model layer (structs/constants only).
//!
//! ## Purpose
//! - Keep document, package and report structs in one place.
//! - Avoid cyclic imports and duplicated type definitions.
//! - Make JSON output schema changes explicit and reviewable.
//!
//! ## Files
//! - `models.rs` — documents, package layout, findings, reports.
//! - `constants.rs` — stable file names and schema constants.
//! - `errors.rs` — error taxonomy shared by every service.
//!
//! ## Rule of thumb
//! Domain types should be data-only: no filesystem side effects.
//!
//! ## Compatibility note
//! `Package`/`PackageEntry` are the persisted package layout and `--json`
//! outputs are integration contracts. Keep schema-impacting changes explicit
//! and synchronized with `docs/contracts/*`.

pub mod constants;
pub mod errors;
pub mod models;
