//! AuraPay Common Types
//!
//! Shared types used across the ledger crates: integer minor-unit money,
//! account / settlement / entry identifiers, the error taxonomy and time helpers.

pub mod identifiers;
pub mod monetary;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
pub use time::*;
