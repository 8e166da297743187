//! Core types shared across the sync engine.
//!
//! - [`schema`]: table, sequence, column and trigger metadata
//! - [`identifier`]: identifier quoting and literal escaping

pub mod identifier;
pub mod schema;

pub use schema::{Column, NonDeferrableConstraint, Sequence, Table, Trigger};
