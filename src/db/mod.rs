//! Database module: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities. Every status
//!   change is a guarded single-row `UPDATE` whose affected-row count tells
//!   the caller whether the transition happened.
//!
//! External modules should import from `printforge::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::OutboxTask;
