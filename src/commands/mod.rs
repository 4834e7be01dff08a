//! Command handler layer.
//!
//! This module owns CLI-oriented orchestration and output wiring.
//!
//! ## Files
//! - `contracts.rs` — contracts-check / extension-check / contracts-migrate.
//! - `state.rs` — state-export / state-check / state-import.
//!
//! ## Principles
//! - Parse/match CLI inputs here.
//! - Delegate business logic to `services/*`.
//! - Keep behavior and output schema stable.

pub mod contracts;
pub mod state;

pub use contracts::handle_contract_commands;
pub use state::handle_state_commands;
