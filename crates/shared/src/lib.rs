//! Botdesk Shared Types and Utilities
//!
//! This crate contains the IDs, models, and database helpers shared by the quota core
//! and the operator tooling.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
