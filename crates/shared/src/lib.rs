//! Recurbill shared types
//!
//! Types and database helpers used by more than one crate in the workspace.

pub mod db;
pub mod tier;

pub use db::{create_pool, run_migrations, DbError};
pub use tier::SubscriptionTier;
