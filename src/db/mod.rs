//! Database module: row models and SQL repositories behind the store.
//!
//! - `model`: row structs and write outcomes returned by repositories.
//! - `repo`: SQL-only functions; change broadcasting lives in [`crate::store`].

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ClaimOutcome, SetOutcome};
